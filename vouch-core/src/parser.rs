//! The parser port
//!
//! Turns a fetched identity document into its structured content. The
//! wire format lives with the network layer; the kernel only requires
//! that implementations validate nicknames and trust values against the
//! entity constraints before returning.
//!
//! [`JsonFileParser`] is the bundled reference implementation, used by the
//! pipeline tests and by deployments that publish JSON documents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use vouch_model::{Identity, RequestUri, Trust, ValidationError};

/// One entry of a published trust list. The trustee URI carries the
/// edition the truster claims to be the trustee's latest, used as an
/// edition hint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustListEntry {
    pub trustee: RequestUri,
    pub value: i8,
    #[serde(default)]
    pub comment: String,
}

/// The structured content of one identity document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdentityFileContent {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub publishes_trust_list: bool,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub trust_list: Vec<TrustListEntry>,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unreadable identity file: {0}")]
    Unreadable(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub trait IdentityFileParser: Send + Sync {
    fn parse(&self, payload: &[u8]) -> Result<IdentityFileContent, ParseError>;
}

/// Reference parser for JSON identity documents.
#[derive(Default)]
pub struct JsonFileParser;

impl IdentityFileParser for JsonFileParser {
    fn parse(&self, payload: &[u8]) -> Result<IdentityFileContent, ParseError> {
        let content: IdentityFileContent = serde_json::from_slice(payload)
            .map_err(|e| ParseError::Unreadable(e.to_string()))?;
        if let Some(nickname) = &content.nickname {
            Identity::validate_nickname(nickname.trim())?;
        }
        for entry in &content.trust_list {
            Trust::validate_value(entry.value)?;
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouch_model::IdentityId;

    #[test]
    fn parses_a_full_document() {
        let trustee = RequestUri::new(IdentityId([2; 32]), 4);
        let json = serde_json::json!({
            "nickname": "alice",
            "publishes_trust_list": true,
            "contexts": ["messaging"],
            "properties": { "ui.theme": "dark" },
            "trust_list": [
                { "trustee": trustee, "value": 75, "comment": "friend" }
            ]
        });
        let content = JsonFileParser
            .parse(json.to_string().as_bytes())
            .unwrap();
        assert_eq!(content.nickname.as_deref(), Some("alice"));
        assert!(content.publishes_trust_list);
        assert_eq!(content.trust_list.len(), 1);
        assert_eq!(content.trust_list[0].value, 75);
        assert_eq!(content.trust_list[0].trustee.edition(), 4);
    }

    #[test]
    fn garbage_is_unreadable() {
        assert!(matches!(
            JsonFileParser.parse(b"<not json>"),
            Err(ParseError::Unreadable(_))
        ));
    }

    #[test]
    fn out_of_range_trust_value_is_rejected() {
        let trustee = RequestUri::new(IdentityId([2; 32]), 0);
        let json = serde_json::json!({
            "trust_list": [ { "trustee": trustee, "value": 101 } ]
        });
        // 101 does not fit the schema's i8 range check during validation;
        // values beyond i8 entirely fail deserialization instead.
        assert!(JsonFileParser.parse(json.to_string().as_bytes()).is_err());
    }

    #[test]
    fn oversize_nickname_is_rejected() {
        let json = serde_json::json!({ "nickname": "x".repeat(31) });
        assert!(matches!(
            JsonFileParser.parse(json.to_string().as_bytes()),
            Err(ParseError::Validation(ValidationError::NicknameTooLong { .. }))
        ));
    }
}
