//! The importer
//!
//! Takes fetched identity files from the import queue and turns them into
//! graph updates. Single-threaded by design: the score computation is not
//! parallelizable without heavy coordination, and importing is I/O-light
//! once parsed.
//!
//! Triggered by the queue through a delayed job so that bursts of editions
//! deduplicate before work starts. When the job fires, the queue is
//! drained fully; the cancellation token is checked between items. Parse
//! failures mark the identity, advance the edition and never halt the
//! loop.

use crate::fetch::FetchScheduler;
use crate::jobs::JobRunner;
use crate::parser::{IdentityFileParser, ParseError, TrustListEntry};
use crate::queue::{ImportQueue, QueuedFile};
use crate::score::ScoreEngine;
use crate::store::{GraphStore, StoreError};
use crate::subscriptions::SubscriptionManager;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vouch_model::{ChangeEvent, FetchState, Identity, IdentityId, Trust};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("identity {0} is not known, refusing to import its file")]
    UnknownIdentity(IdentityId),

    #[error("own identities are not imported from the network")]
    OwnIdentity,
}

enum Outcome {
    /// The file was imported; events were committed.
    Imported(Vec<ChangeEvent>),
    /// The payload was unreadable; the identity was marked and the bad
    /// edition retired.
    ParseFailed(Vec<ChangeEvent>),
    /// The queued edition is not newer than what the store already has.
    Stale,
}

pub struct Importer {
    store: Arc<GraphStore>,
    engine: Arc<ScoreEngine>,
    parser: Arc<dyn IdentityFileParser>,
    queue: Arc<ImportQueue>,
    subscriptions: Arc<SubscriptionManager>,
    scheduler: Arc<FetchScheduler>,
}

impl Importer {
    pub fn new(
        store: Arc<GraphStore>,
        engine: Arc<ScoreEngine>,
        parser: Arc<dyn IdentityFileParser>,
        queue: Arc<ImportQueue>,
        subscriptions: Arc<SubscriptionManager>,
        scheduler: Arc<FetchScheduler>,
    ) -> Self {
        Self {
            store,
            engine,
            parser,
            queue,
            subscriptions,
            scheduler,
        }
    }

    /// Drains the queue fully, observing the cancellation token between
    /// items.
    pub fn drain(&self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let Some(file) = self.queue.poll() else {
                break;
            };
            let started = Instant::now();
            let uri = file.uri;
            match self.import_file(file) {
                Ok(Outcome::Imported(events)) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    self.queue.mark_finished(elapsed_ms);
                    info!(
                        identity = %uri.id(),
                        edition = uri.edition(),
                        elapsed_ms,
                        "imported identity file"
                    );
                    self.publish(events);
                }
                Ok(Outcome::ParseFailed(events)) => {
                    self.queue.mark_failed();
                    self.publish(events);
                }
                Ok(Outcome::Stale) => {
                    debug!(
                        identity = %uri.id(),
                        edition = uri.edition(),
                        "skipping stale identity file"
                    );
                    self.queue.mark_finished(0);
                }
                Err(e) => {
                    warn!(
                        identity = %uri.id(),
                        edition = uri.edition(),
                        error = %e,
                        "identity file import failed"
                    );
                    self.queue.mark_failed();
                }
            }
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        self.subscriptions.on_events(&events);
        let refetch = self.scheduler.on_events(&events);
        for id in refetch {
            if let Err(e) = self.apply_refetch(&id) {
                warn!(identity = %id, error = %e, "marking for refetch failed");
            }
        }
    }

    fn apply_refetch(&self, id: &IdentityId) -> Result<(), StoreError> {
        let mut txn = self.store.begin();
        let mut identity = txn.identity(id)?.clone();
        let now = txn.now_ms();
        identity.mark_for_refetch(now);
        txn.put_identity(identity)?;
        let events = txn.commit();
        self.subscriptions.on_events(&events);
        // The identity did not change positivity, so this cannot recurse
        // into another refetch.
        let _ = self.scheduler.on_events(&events);
        Ok(())
    }

    fn import_file(&self, file: QueuedFile) -> Result<Outcome, ImportError> {
        let content = match self.parser.parse(&file.payload) {
            Ok(content) => content,
            Err(e) => {
                debug!(
                    identity = %file.uri.id(),
                    edition = file.uri.edition(),
                    error = %e,
                    "identity file unparseable"
                );
                return Ok(self.handle_parse_failure(&file)?);
            }
        };

        let mut txn = self.store.begin();
        let now = txn.now_ms();
        let id = *file.uri.id();
        let identity = txn
            .get_identity(&id)
            .ok_or(ImportError::UnknownIdentity(id))?;
        if identity.is_own() {
            return Err(ImportError::OwnIdentity);
        }
        let mut identity = identity.clone();

        let arrived = file.uri.edition();
        if arrived < identity.edition()
            || (arrived == identity.edition() && identity.fetch_state() == FetchState::Fetched)
        {
            return Ok(Outcome::Stale);
        }

        identity.set_edition(arrived, now).map_err(StoreError::from)?;
        if let Some(nickname) = &content.nickname {
            // A differing nickname is a validation error which aborts this
            // import; the transaction is dropped unchanged.
            identity
                .set_nickname(nickname, now)
                .map_err(StoreError::from)?;
        }
        identity.set_publishes_trust_list(content.publishes_trust_list, now);

        identity.clear_contexts();
        for context in &content.contexts {
            if let Err(e) = identity.add_context(context, now) {
                debug!(identity = %id, context, error = %e, "dropping invalid context");
            }
        }
        identity.clear_properties();
        for (key, value) in &content.properties {
            if let Err(e) = identity.set_property(key, value, now) {
                debug!(identity = %id, key, error = %e, "dropping invalid property");
            }
        }
        identity.on_fetched(now);
        txn.put_identity(identity)?;

        self.reconcile_trust_list(&mut txn, &id, arrived, &content.trust_list)?;

        Ok(Outcome::Imported(txn.commit()))
    }

    /// Brings the stored outgoing trusts of `truster` in line with the
    /// trust list published at `edition`: stale edges deleted, existing
    /// ones updated, new ones created with stub identities for unknown
    /// trustees.
    fn reconcile_trust_list(
        &self,
        txn: &mut crate::store::Transaction<'_>,
        truster: &IdentityId,
        edition: u64,
        trust_list: &[TrustListEntry],
    ) -> Result<(), ImportError> {
        let now = txn.now_ms();

        let mut entries: BTreeMap<IdentityId, &TrustListEntry> = BTreeMap::new();
        for entry in trust_list {
            let trustee = *entry.trustee.id();
            if trustee == *truster {
                debug!(identity = %truster, "dropping self-trust from trust list");
                continue;
            }
            entries.insert(trustee, entry);
        }

        // Stale edges: asserted by an older edition and absent from the
        // new list.
        for trust in txn.given_trusts(truster) {
            if trust.truster_edition() < edition && !entries.contains_key(trust.trustee()) {
                let old = txn.delete_trust(truster, trust.trustee())?;
                self.engine.on_trust_changed(txn, Some(&old), None)?;
            }
        }

        for (trustee, entry) in entries {
            match txn.get_identity(&trustee).cloned() {
                None => {
                    // First appearance anywhere: create a stub to hang the
                    // edge on. It stays unfetched until somebody's score
                    // makes it worth fetching.
                    let stub = Identity::new(&entry.trustee, None, false, now)
                        .map_err(StoreError::from)?;
                    txn.put_identity(stub)?;
                }
                Some(mut existing) => {
                    if existing.set_edition_hint(entry.trustee.edition()) {
                        txn.put_identity(existing)?;
                    }
                }
            }

            match txn.get_trust(truster, &trustee).cloned() {
                Some(old) => {
                    let mut updated = old.clone();
                    updated.set_value(entry.value, now).map_err(StoreError::from)?;
                    updated
                        .set_comment(&entry.comment, now)
                        .map_err(StoreError::from)?;
                    updated.set_truster_edition(edition);
                    let changed = updated != old;
                    txn.put_trust(updated.clone())?;
                    if changed {
                        self.engine.on_trust_changed(txn, Some(&old), Some(&updated))?;
                    }
                }
                None => {
                    let trust = Trust::new(
                        *truster,
                        trustee,
                        entry.value,
                        &entry.comment,
                        edition,
                        now,
                    )
                    .map_err(StoreError::from)?;
                    txn.put_trust(trust.clone())?;
                    self.engine.on_trust_changed(txn, None, Some(&trust))?;
                }
            }
        }
        Ok(())
    }

    /// Parse failure: mark the identity and retire the bad edition so it
    /// is not fetched again.
    fn handle_parse_failure(&self, file: &QueuedFile) -> Result<Outcome, ImportError> {
        let mut txn = self.store.begin();
        let now = txn.now_ms();
        let id = *file.uri.id();
        let identity = txn
            .get_identity(&id)
            .ok_or(ImportError::UnknownIdentity(id))?;
        let mut identity = identity.clone();
        if file.uri.edition() < identity.edition() {
            return Ok(Outcome::Stale);
        }
        identity
            .set_edition(file.uri.edition(), now)
            .map_err(StoreError::from)?;
        identity.on_parsing_failed(now);
        txn.put_identity(identity)?;
        Ok(Outcome::ParseFailed(txn.commit()))
    }
}

#[async_trait]
impl JobRunner for Importer {
    async fn run(&self, cancel: &CancellationToken) {
        self.drain(cancel);
    }
}
