//! Identities
//!
//! An identity is one pseudonymous user, anchored in a key pair and
//! published on the network as an editioned document. Own identities
//! additionally hold the private insert key and act as roots for score
//! computation.

use crate::error::ValidationError;
use crate::types::IdentityId;
use crate::uri::{InsertUri, RequestUri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const MAX_NICKNAME_LENGTH: usize = 30;
pub const MAX_CONTEXT_NAME_LENGTH: usize = 32;
pub const MAX_CONTEXT_AMOUNT: usize = 32;
pub const MAX_PROPERTY_NAME_LENGTH: usize = 256;
pub const MAX_PROPERTY_VALUE_LENGTH: usize = 10 * 1024;
pub const MAX_PROPERTY_AMOUNT: usize = 64;

/// Retrieval status of the edition named by an identity's request URI.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FetchState {
    /// The edition has not been retrieved yet.
    NotFetched,
    /// The edition was retrieved but its document was unreadable.
    ParsingFailed,
    /// The edition was retrieved and imported.
    Fetched,
}

/// The private half of an own identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnDetails {
    insert_uri: InsertUri,
    last_insert_ms: u64,
}

impl OwnDetails {
    pub fn insert_uri(&self) -> &InsertUri {
        &self.insert_uri
    }

    pub fn last_insert_ms(&self) -> u64 {
        self.last_insert_ms
    }
}

/// An identity as handled by the trust graph.
///
/// It has a nickname and as many custom properties as needed. Discovered
/// identities start as stubs (no nickname, nothing fetched) when they first
/// appear in someone's trust list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    id: IdentityId,
    request_uri: RequestUri,
    fetch_state: FetchState,
    /// Highest edition anyone has claimed exists. Advisory only: other
    /// identities might lie to stop this one from being fetched.
    edition_hint: u64,
    created_ms: u64,
    last_fetched_ms: u64,
    last_changed_ms: u64,
    nickname: Option<String>,
    publishes_trust_list: bool,
    contexts: Vec<String>,
    properties: BTreeMap<String, String>,
    version_id: Uuid,
    own: Option<OwnDetails>,
}

impl Identity {
    /// Creates an identity from a request URI.
    ///
    /// The URI is normalized to edition 0; the edition it carried is used
    /// only as a hint, so that attackers cannot pin bogus very-high
    /// editions on an identity.
    pub fn new(
        uri: &RequestUri,
        nickname: Option<&str>,
        publishes_trust_list: bool,
        now_ms: u64,
    ) -> Result<Self, ValidationError> {
        let mut identity = Self {
            id: *uri.id(),
            request_uri: uri.with_edition(0),
            fetch_state: FetchState::NotFetched,
            edition_hint: uri.edition(),
            created_ms: now_ms,
            last_fetched_ms: 0,
            last_changed_ms: now_ms,
            nickname: None,
            publishes_trust_list,
            contexts: Vec::new(),
            properties: BTreeMap::new(),
            version_id: Uuid::new_v4(),
            own: None,
        };
        if let Some(nick) = nickname {
            identity.set_nickname(nick, now_ms)?;
        }
        Ok(identity)
    }

    /// Creates an own identity from an insert URI. Own identities always
    /// carry a nickname.
    pub fn new_own(
        insert_uri: &InsertUri,
        nickname: &str,
        publishes_trust_list: bool,
        now_ms: u64,
    ) -> Result<Self, ValidationError> {
        let mut identity = Self::new(
            &insert_uri.request_uri(),
            Some(nickname),
            publishes_trust_list,
            now_ms,
        )?;
        identity.own = Some(OwnDetails {
            insert_uri: *insert_uri,
            last_insert_ms: 0,
        });
        Ok(identity)
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn request_uri(&self) -> &RequestUri {
        &self.request_uri
    }

    pub fn edition(&self) -> u64 {
        self.request_uri.edition()
    }

    pub fn fetch_state(&self) -> FetchState {
        self.fetch_state
    }

    pub fn edition_hint(&self) -> u64 {
        self.edition_hint
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn last_fetched_ms(&self) -> u64 {
        self.last_fetched_ms
    }

    pub fn last_changed_ms(&self) -> u64 {
        self.last_changed_ms
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn publishes_trust_list(&self) -> bool {
        self.publishes_trust_list
    }

    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    pub fn has_context(&self, context: &str) -> bool {
        self.contexts.iter().any(|c| c == context.trim())
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key.trim()).map(String::as_str)
    }

    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn is_own(&self) -> bool {
        self.own.is_some()
    }

    pub fn own_details(&self) -> Option<&OwnDetails> {
        self.own.as_ref()
    }

    /// Raises the edition of the request URI.
    ///
    /// Lowering the edition is not allowed; raising it resets the fetch
    /// state and lifts the edition hint along with it.
    pub fn set_edition(&mut self, new_edition: u64, now_ms: u64) -> Result<(), ValidationError> {
        let current = self.request_uri.edition();
        if new_edition < current {
            return Err(ValidationError::EditionDecrease {
                current,
                new: new_edition,
            });
        }
        if new_edition > current {
            self.request_uri = self.request_uri.with_edition(new_edition);
            self.fetch_state = FetchState::NotFetched;
            if new_edition > self.edition_hint {
                self.edition_hint = new_edition;
            }
            self.updated(now_ms);
        }
        Ok(())
    }

    /// Applies an edition hint heard from another identity's trust list.
    /// Returns whether the hint was newer than the stored one.
    pub fn set_edition_hint(&mut self, hint: u64) -> bool {
        if hint > self.edition_hint {
            self.edition_hint = hint;
            true
        } else {
            false
        }
    }

    /// Has to be called when the identity's current edition was fetched and
    /// imported. Must not be called before `set_edition`.
    pub fn on_fetched(&mut self, now_ms: u64) {
        self.fetch_state = FetchState::Fetched;
        self.last_fetched_ms = now_ms;
        self.updated(now_ms);
    }

    /// Has to be called when the current edition was fetched but could not
    /// be parsed.
    pub fn on_parsing_failed(&mut self, now_ms: u64) {
        self.fetch_state = FetchState::ParsingFailed;
        self.last_fetched_ms = now_ms;
        self.updated(now_ms);
    }

    /// Marks the current edition as not fetched so its trust list is
    /// downloaded again. Used when an identity's score turns positive:
    /// while it was distrusted, its trustees were not created.
    pub fn mark_for_refetch(&mut self, now_ms: u64) {
        if self.fetch_state == FetchState::Fetched {
            self.fetch_state = FetchState::NotFetched;
        } else {
            let edition = self.request_uri.edition().saturating_sub(1);
            self.request_uri = self.request_uri.with_edition(edition);
        }
        self.updated(now_ms);
    }

    /// Throws if the given nickname is invalid.
    pub fn validate_nickname(nickname: &str) -> Result<(), ValidationError> {
        if nickname.is_empty() {
            return Err(ValidationError::EmptyNickname);
        }
        if nickname.chars().count() > MAX_NICKNAME_LENGTH {
            return Err(ValidationError::NicknameTooLong {
                limit: MAX_NICKNAME_LENGTH,
            });
        }
        for c in nickname.chars() {
            // '@' is reserved for "nickname@id" unique display names.
            if c.is_control() || c == '@' {
                return Err(ValidationError::InvalidNicknameCharacter(c));
            }
        }
        Ok(())
    }

    /// Sets the nickname. A nickname is immutable once set; a differing
    /// nickname from a later fetch is rejected rather than overwritten.
    pub fn set_nickname(&mut self, nickname: &str, now_ms: u64) -> Result<(), ValidationError> {
        let nickname = nickname.trim();
        Self::validate_nickname(nickname)?;
        if let Some(existing) = &self.nickname {
            if existing != nickname {
                return Err(ValidationError::NicknameChange);
            }
            return Ok(());
        }
        self.nickname = Some(nickname.to_owned());
        self.updated(now_ms);
        Ok(())
    }

    pub fn set_publishes_trust_list(&mut self, publishes: bool, now_ms: u64) {
        if self.publishes_trust_list != publishes {
            self.publishes_trust_list = publishes;
            self.updated(now_ms);
        }
    }

    fn validate_context(context: &str) -> Result<(), ValidationError> {
        if context.is_empty() {
            return Err(ValidationError::InvalidContext("empty".into()));
        }
        if context.chars().count() > MAX_CONTEXT_NAME_LENGTH {
            return Err(ValidationError::InvalidContext(format!(
                "longer than {MAX_CONTEXT_NAME_LENGTH} characters"
            )));
        }
        if !context.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError::InvalidContext(
                "must be latin letters and numbers only".into(),
            ));
        }
        Ok(())
    }

    /// Adds a context. Contexts are a set: adding an existing one is a
    /// no-op.
    pub fn add_context(&mut self, context: &str, now_ms: u64) -> Result<(), ValidationError> {
        let context = context.trim();
        Self::validate_context(context)?;
        if self.contexts.iter().any(|c| c == context) {
            return Ok(());
        }
        if self.contexts.len() >= MAX_CONTEXT_AMOUNT {
            return Err(ValidationError::TooManyContexts {
                limit: MAX_CONTEXT_AMOUNT,
            });
        }
        self.contexts.push(context.to_owned());
        self.updated(now_ms);
        Ok(())
    }

    pub fn remove_context(&mut self, context: &str, now_ms: u64) {
        let context = context.trim();
        let before = self.contexts.len();
        self.contexts.retain(|c| c != context);
        if self.contexts.len() != before {
            self.updated(now_ms);
        }
    }

    pub fn clear_contexts(&mut self) {
        self.contexts.clear();
    }

    fn validate_property_name(key: &str) -> Result<(), ValidationError> {
        if key.is_empty() {
            return Err(ValidationError::InvalidPropertyName("empty".into()));
        }
        if key.chars().count() > MAX_PROPERTY_NAME_LENGTH {
            return Err(ValidationError::InvalidPropertyName(format!(
                "longer than {MAX_PROPERTY_NAME_LENGTH} characters"
            )));
        }
        for token in key.split('.') {
            if token.is_empty() {
                return Err(ValidationError::InvalidPropertyName(
                    "periods must be surrounded by other characters".into(),
                ));
            }
            if !token.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ValidationError::InvalidPropertyName(
                    "tokens must be latin letters and numbers only".into(),
                ));
            }
        }
        Ok(())
    }

    /// Sets a custom property. Keys are trimmed before storage, values are
    /// stored as passed. Setting an identical value is a no-op.
    pub fn set_property(
        &mut self,
        key: &str,
        value: &str,
        now_ms: u64,
    ) -> Result<(), ValidationError> {
        let key = key.trim();
        Self::validate_property_name(key)?;
        if value.is_empty() {
            return Err(ValidationError::InvalidPropertyValue("empty".into()));
        }
        if value.chars().count() > MAX_PROPERTY_VALUE_LENGTH {
            return Err(ValidationError::InvalidPropertyValue(format!(
                "longer than {MAX_PROPERTY_VALUE_LENGTH} characters"
            )));
        }
        match self.properties.get(key) {
            Some(existing) if existing == value => Ok(()),
            Some(_) => {
                self.properties.insert(key.to_owned(), value.to_owned());
                self.updated(now_ms);
                Ok(())
            }
            None => {
                if self.properties.len() >= MAX_PROPERTY_AMOUNT {
                    return Err(ValidationError::TooManyProperties {
                        limit: MAX_PROPERTY_AMOUNT,
                    });
                }
                self.properties.insert(key.to_owned(), value.to_owned());
                self.updated(now_ms);
                Ok(())
            }
        }
    }

    pub fn remove_property(&mut self, key: &str, now_ms: u64) {
        if self.properties.remove(key.trim()).is_some() {
            self.updated(now_ms);
        }
    }

    pub fn clear_properties(&mut self) {
        self.properties.clear();
    }

    /// Attaches the private key material, upgrading a discovered identity
    /// to an own identity in place.
    pub fn make_own(&mut self, insert_uri: &InsertUri, now_ms: u64) {
        self.own = Some(OwnDetails {
            insert_uri: *insert_uri,
            last_insert_ms: 0,
        });
        self.updated(now_ms);
    }

    /// Records a successful insert of this own identity's document.
    pub fn on_inserted(&mut self, now_ms: u64) {
        if let Some(own) = &mut self.own {
            own.last_insert_ms = now_ms;
        }
    }

    /// Tell that this identity has been updated.
    pub fn updated(&mut self, now_ms: u64) {
        self.last_changed_ms = now_ms;
    }

    /// Restamps the version id. Done by the store on every committed
    /// mutation, and by the subscription manager when stamping
    /// synchronization clones.
    pub fn set_version_id(&mut self, version_id: Uuid) {
        self.version_id = version_id;
    }
}

/// Domain equality: compares all attributes except timestamps and the
/// version id.
impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        let own_key = |i: &Identity| i.own.as_ref().map(|o| *o.insert_uri.insert_key());
        let sorted = |v: &[String]| {
            let mut v = v.to_vec();
            v.sort();
            v
        };
        self.id == other.id
            && self.request_uri == other.request_uri
            && self.fetch_state == other.fetch_state
            && self.edition_hint == other.edition_hint
            && self.nickname == other.nickname
            && self.publishes_trust_list == other.publishes_trust_list
            && sorted(&self.contexts) == sorted(&other.contexts)
            && self.properties == other.properties
            && own_key(self) == own_key(other)
    }
}

impl Eq for Identity {}
