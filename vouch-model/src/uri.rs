//! Identity URIs
//!
//! An identity is published on the network under an updatable key. The
//! normalized request form is `USK@<routing-key>/<doc-name>/<edition>`:
//! key type forced to USK, fixed document name, meta strings stripped, and
//! the suggested-edition segment carrying the current edition. Insert URIs
//! additionally carry the private insert key before the routing key.

use crate::error::ValidationError;
use crate::types::{IdentityId, InsertKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed document name of identity publications.
pub const URI_DOC_NAME: &str = "vouch";

/// The public URI under which an identity's document is fetched.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RequestUri {
    id: IdentityId,
    edition: u64,
}

impl RequestUri {
    pub fn new(id: IdentityId, edition: u64) -> Self {
        Self { id, edition }
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn edition(&self) -> u64 {
        self.edition
    }

    /// The same URI at a different edition.
    pub fn with_edition(&self, edition: u64) -> Self {
        Self { id: self.id, edition }
    }
}

impl fmt::Display for RequestUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USK@{}/{}/{}", self.id, URI_DOC_NAME, self.edition)
    }
}

impl FromStr for RequestUri {
    type Err = ValidationError;

    /// Parses and normalizes a request URI.
    ///
    /// Accepts `USK@` or `SSK@` key types, ignores trailing comma-separated
    /// key metadata, tolerates a missing doc-name/edition (edition defaults
    /// to 0), and strips anything after the edition segment.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("USK@")
            .or_else(|| s.strip_prefix("SSK@"))
            .ok_or_else(|| ValidationError::MalformedUri(format!("not a USK or SSK: {s}")))?;

        let mut segments = rest.split('/');
        let key_part = segments
            .next()
            .ok_or_else(|| ValidationError::MalformedUri("missing routing key".into()))?;
        // The key segment may carry ",<meta>" suffixes which we strip.
        let routing = key_part.split(',').next().unwrap_or(key_part);
        let id = IdentityId::from_base64(routing)?;

        // Doc name is not authoritative; anything may follow the key.
        let _doc_name = segments.next();
        let edition = match segments.next() {
            Some(text) => text
                .parse::<u64>()
                .map_err(|_| ValidationError::MalformedUri(format!("bad edition: {text}")))?,
            None => 0,
        };

        Ok(Self { id, edition })
    }
}

/// The private URI with which an own identity inserts its document.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InsertUri {
    insert_key: InsertKey,
    id: IdentityId,
    edition: u64,
}

impl InsertUri {
    pub fn new(insert_key: InsertKey, id: IdentityId, edition: u64) -> Self {
        Self { insert_key, id, edition }
    }

    /// Generate a fresh key pair.
    pub fn generate(rng: &mut impl rand::Rng) -> Self {
        Self {
            insert_key: InsertKey::random(rng),
            id: IdentityId::random(rng),
            edition: 0,
        }
    }

    pub fn insert_key(&self) -> &InsertKey {
        &self.insert_key
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn edition(&self) -> u64 {
        self.edition
    }

    /// Derive the public request URI for the same identity.
    pub fn request_uri(&self) -> RequestUri {
        RequestUri::new(self.id, self.edition)
    }

    pub fn with_edition(&self, edition: u64) -> Self {
        Self { edition, ..*self }
    }
}

impl fmt::Display for InsertUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "USK@{},{}/{}/{}",
            self.insert_key, self.id, URI_DOC_NAME, self.edition
        )
    }
}

impl FromStr for InsertUri {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("USK@")
            .or_else(|| s.strip_prefix("SSK@"))
            .ok_or_else(|| ValidationError::MalformedUri(format!("not a USK or SSK: {s}")))?;

        let mut segments = rest.split('/');
        let key_part = segments
            .next()
            .ok_or_else(|| ValidationError::MalformedUri("missing key pair".into()))?;
        let mut keys = key_part.split(',');
        let insert_key = InsertKey::from_base64(
            keys.next()
                .ok_or_else(|| ValidationError::MalformedUri("missing insert key".into()))?,
        )?;
        let id = IdentityId::from_base64(
            keys.next()
                .ok_or_else(|| ValidationError::MalformedUri("missing routing key".into()))?,
        )?;

        let _doc_name = segments.next();
        let edition = match segments.next() {
            Some(text) => text
                .parse::<u64>()
                .map_err(|_| ValidationError::MalformedUri(format!("bad edition: {text}")))?,
            None => 0,
        };

        Ok(Self { insert_key, id, edition })
    }
}
