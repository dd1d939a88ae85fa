//! Vouch Core
//!
//! The trust graph kernel: a transactional graph store of identities,
//! trusts and derived scores; the incremental score engine; the
//! fetch/import pipeline that turns remote identity publications into
//! graph updates; and the subscription engine that streams ordered change
//! notifications to clients.

pub mod fetch;
pub mod importer;
pub mod jobs;
pub mod kernel;
pub mod parser;
pub mod queue;
pub mod score;
pub mod store;
pub mod subscriptions;

pub use fetch::{FetchScheduler, Fetcher};
pub use importer::{ImportError, Importer};
pub use jobs::{DelayedJob, JobRunner, MockJob, TickerJob};
pub use kernel::{Kernel, KernelStats};
pub use parser::{IdentityFileContent, IdentityFileParser, JsonFileParser, ParseError, TrustListEntry};
pub use queue::{ImportQueue, QueueStats, QueuedFile};
pub use score::{ScoreEngine, ScoreStats};
pub use store::{GraphStore, StoreError, Transaction};
pub use subscriptions::{
    ClientKind, DeployRunner, Notification, NotificationPayload, NotificationTransport,
    Subscription, SubscriptionError, SubscriptionManager, TransportError,
};
