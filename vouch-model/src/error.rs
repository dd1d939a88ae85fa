//! Validation errors shared by all entity types.

use thiserror::Error;

/// Errors raised when input fails the entity validation contracts.
///
/// These abort the enclosing operation and are never logged above debug
/// level: malformed input from the network is expected, not exceptional.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identity id must be {expected} characters, got {got}")]
    IdLength { expected: usize, got: usize },

    #[error("identity id is not valid base64: {0}")]
    IdEncoding(String),

    #[error("malformed uri: {0}")]
    MalformedUri(String),

    #[error("the edition of an identity cannot be lowered (current {current}, new {new})")]
    EditionDecrease { current: u64, new: u64 },

    #[error("nickname cannot be empty")]
    EmptyNickname,

    #[error("nickname is too long, the limit is {limit} characters")]
    NicknameTooLong { limit: usize },

    #[error("nickname contains invalid character {0:?}")]
    InvalidNicknameCharacter(char),

    #[error("changing the nickname of an identity is not allowed")]
    NicknameChange,

    #[error("invalid context name: {0}")]
    InvalidContext(String),

    #[error("an identity may not have more than {limit} contexts")]
    TooManyContexts { limit: usize },

    #[error("invalid property name: {0}")]
    InvalidPropertyName(String),

    #[error("invalid property value: {0}")]
    InvalidPropertyValue(String),

    #[error("an identity may not have more than {limit} properties")]
    TooManyProperties { limit: usize },

    #[error("trust value {0} is out of range")]
    TrustValueOutOfRange(i16),

    #[error("an identity cannot assign trust to itself")]
    SelfTrust,

    #[error("trust comment is too long, the limit is {limit} characters")]
    CommentTooLong { limit: usize },

    #[error("trust comment contains control characters")]
    InvalidComment,

    #[error("{0} is not a valid capacity value")]
    InvalidCapacity(u8),

    #[error("rank {0} does not permit capacity {1}")]
    RankCapacityMismatch(u32, u8),
}
