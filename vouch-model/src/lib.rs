//! Vouch Model
//!
//! Pure data types and traits for the vouch trust graph, decoupled from
//! the store, the score engine, and the network stack.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod score;
pub mod trust;
pub mod types;
pub mod uri;

// Re-exports from dependencies
pub use uuid::Uuid;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::Config;
pub use error::ValidationError;
pub use event::{ChangeEvent, EventKind};
pub use identity::{FetchState, Identity, OwnDetails};
pub use score::{capacity_for_rank, Score, DEFAULT_CAPACITY_TABLE, OWN_CAPACITY, OWN_RANK, OWN_SCORE_VALUE};
pub use trust::Trust;
pub use types::{IdentityId, InsertKey, KEY_LENGTH, KEY_TEXT_LENGTH};
pub use uri::{InsertUri, RequestUri, URI_DOC_NAME};
