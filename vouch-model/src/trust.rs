//! Trust edges
//!
//! A trust is the directed, unilateral opinion of one identity about
//! another, published inside the truster's trust list.

use crate::error::ValidationError;
use crate::types::IdentityId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_TRUST_VALUE: i8 = 100;
pub const MIN_TRUST_VALUE: i8 = -100;
pub const MAX_TRUST_COMMENT_LENGTH: usize = 256;

/// A directed trust edge from truster to trustee.
///
/// `truster_edition` records the edition of the truster's trust list which
/// asserted this edge; edges from older editions are stale once a newer
/// edition has been imported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trust {
    truster: IdentityId,
    trustee: IdentityId,
    value: i8,
    comment: String,
    truster_edition: u64,
    created_ms: u64,
    last_changed_ms: u64,
    version_id: Uuid,
}

impl Trust {
    pub fn new(
        truster: IdentityId,
        trustee: IdentityId,
        value: i8,
        comment: &str,
        truster_edition: u64,
        now_ms: u64,
    ) -> Result<Self, ValidationError> {
        if truster == trustee {
            return Err(ValidationError::SelfTrust);
        }
        Self::validate_value(value)?;
        let comment = Self::validate_comment(comment)?;
        Ok(Self {
            truster,
            trustee,
            value,
            comment,
            truster_edition,
            created_ms: now_ms,
            last_changed_ms: now_ms,
            version_id: Uuid::new_v4(),
        })
    }

    pub fn validate_value(value: i8) -> Result<(), ValidationError> {
        if !(MIN_TRUST_VALUE..=MAX_TRUST_VALUE).contains(&value) {
            return Err(ValidationError::TrustValueOutOfRange(value as i16));
        }
        Ok(())
    }

    fn validate_comment(comment: &str) -> Result<String, ValidationError> {
        let comment = comment.trim();
        if comment.chars().count() > MAX_TRUST_COMMENT_LENGTH {
            return Err(ValidationError::CommentTooLong {
                limit: MAX_TRUST_COMMENT_LENGTH,
            });
        }
        if comment.chars().any(char::is_control) {
            return Err(ValidationError::InvalidComment);
        }
        Ok(comment.to_owned())
    }

    pub fn truster(&self) -> &IdentityId {
        &self.truster
    }

    pub fn trustee(&self) -> &IdentityId {
        &self.trustee
    }

    pub fn value(&self) -> i8 {
        self.value
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn truster_edition(&self) -> u64 {
        self.truster_edition
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn last_changed_ms(&self) -> u64 {
        self.last_changed_ms
    }

    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn set_value(&mut self, value: i8, now_ms: u64) -> Result<(), ValidationError> {
        Self::validate_value(value)?;
        if self.value != value {
            self.value = value;
            self.last_changed_ms = now_ms;
        }
        Ok(())
    }

    pub fn set_comment(&mut self, comment: &str, now_ms: u64) -> Result<(), ValidationError> {
        let comment = Self::validate_comment(comment)?;
        if self.comment != comment {
            self.comment = comment;
            self.last_changed_ms = now_ms;
        }
        Ok(())
    }

    /// Records that a newer edition of the truster's trust list re-asserted
    /// this edge.
    pub fn set_truster_edition(&mut self, edition: u64) {
        self.truster_edition = edition;
    }

    pub fn set_version_id(&mut self, version_id: Uuid) {
        self.version_id = version_id;
    }
}

/// Domain equality: compares the edge and the opinion it expresses.
/// Timestamps, the version id, and the asserting edition (pure
/// bookkeeping for staleness detection) are not part of it.
impl PartialEq for Trust {
    fn eq(&self, other: &Self) -> bool {
        self.truster == other.truster
            && self.trustee == other.trustee
            && self.value == other.value
            && self.comment == other.comment
    }
}

impl Eq for Trust {}
