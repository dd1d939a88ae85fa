use thiserror::Error;
use vouch_model::{IdentityId, ValidationError};

/// Errors that can occur during store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),

    #[error("identity {0} is not an own identity")]
    NotOwnIdentity(IdentityId),

    #[error("no trust from {truster} to {trustee}")]
    NotTrusted {
        truster: IdentityId,
        trustee: IdentityId,
    },

    #[error("{target} is not in the trust tree of {owner}")]
    NotInTrustTree {
        owner: IdentityId,
        target: IdentityId,
    },

    #[error("identity {0} already exists")]
    DuplicateIdentity(IdentityId),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}
