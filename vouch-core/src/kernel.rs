//! The kernel
//!
//! Composition root wiring the store, score engine, import pipeline and
//! subscription engine together, and the operation surface used by the
//! RPC layer and by embedding applications.
//!
//! Locking order, observed everywhere: store transaction/read lock before
//! subscription state before scheduler state. Change events are published
//! to the subscription manager and the fetch scheduler only after the
//! producing transaction has committed.

use crate::fetch::{FetchScheduler, Fetcher};
use crate::importer::Importer;
use crate::jobs::{DelayedJob, TickerJob};
use crate::parser::IdentityFileParser;
use crate::queue::{ImportQueue, QueueStats};
use crate::score::{ScoreEngine, ScoreStats};
use crate::store::{GraphStore, StoreError};
use crate::subscriptions::{DeployRunner, SubscriptionError, SubscriptionManager};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vouch_model::{
    ChangeEvent, Clock, Config, Identity, IdentityId, InsertUri, RequestUri, Score, Trust,
};

/// How long stop() waits for the importer worker at shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Aggregated kernel statistics.
#[derive(Clone, Debug)]
pub struct KernelStats {
    pub queue: QueueStats,
    pub scores: ScoreStats,
}

pub struct Kernel {
    config: Config,
    store: Arc<GraphStore>,
    engine: Arc<ScoreEngine>,
    queue: Arc<ImportQueue>,
    subscriptions: Arc<SubscriptionManager>,
    scheduler: Arc<FetchScheduler>,
    importer: Arc<Importer>,
    importer_job: Mutex<Option<Arc<TickerJob>>>,
}

impl Kernel {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<dyn IdentityFileParser>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let store = Arc::new(GraphStore::new(clock.clone()));
        let engine = Arc::new(ScoreEngine::new(config.capacity_table));
        let queue = Arc::new(ImportQueue::new(clock));
        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            config.client_failure_limit,
        ));
        let scheduler = Arc::new(FetchScheduler::new(store.clone(), fetcher));
        let importer = Arc::new(Importer::new(
            store.clone(),
            engine.clone(),
            parser,
            queue.clone(),
            subscriptions.clone(),
            scheduler.clone(),
        ));
        Arc::new(Self {
            config,
            store,
            engine,
            queue,
            subscriptions,
            scheduler,
            importer,
            importer_job: Mutex::new(None),
        })
    }

    /// Spawns the background jobs and points the fetcher at the current
    /// wanted set. Must be called exactly once, on a tokio runtime.
    pub fn start(&self) -> Result<(), SubscriptionError> {
        let importer_job =
            TickerJob::start("vouch-importer", self.config.import_delay, self.importer.clone());
        let as_dyn: Arc<dyn DelayedJob> = importer_job.clone();
        self.queue.register_handler(&as_dyn);
        *self
            .importer_job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(importer_job);

        let deploy_job = TickerJob::start(
            "vouch-subscriptions",
            self.config.subscription_delay,
            DeployRunner::new(&self.subscriptions),
        );
        self.subscriptions.start(deploy_job)?;

        self.scheduler.rescan_all();
        info!("kernel started");
        Ok(())
    }

    /// Terminates the background jobs and waits for running work to exit.
    pub async fn stop(&self) {
        let importer_job = self
            .importer_job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(job) = importer_job {
            job.terminate();
            job.wait_for_termination(SHUTDOWN_WAIT).await;
        }
        self.subscriptions.stop().await;
        info!("kernel stopped");
    }

    // --- Identity operations ---

    /// Creates an own identity with a fresh key pair.
    pub fn create_own_identity(
        &self,
        nickname: &str,
        publishes_trust_list: bool,
    ) -> Result<Identity, StoreError> {
        let insert_uri = InsertUri::generate(&mut rand::thread_rng());
        let mut txn = self.store.begin();
        let now = txn.now_ms();
        let identity = Identity::new_own(&insert_uri, nickname, publishes_trust_list, now)?;
        let id = *identity.id();
        txn.put_identity(identity)?;
        self.engine.init_own_tree(&mut txn, &id)?;
        let events = txn.commit();
        self.publish(events);
        self.store.identity(&id)
    }

    /// Restores an own identity from its insert URI. If the identity is
    /// already known as a discovered identity it is upgraded in place,
    /// keeping its trusts.
    pub fn restore_own_identity(
        &self,
        insert_uri: &InsertUri,
        nickname: &str,
        publishes_trust_list: bool,
    ) -> Result<Identity, StoreError> {
        let id = *insert_uri.id();
        let mut txn = self.store.begin();
        let now = txn.now_ms();
        match txn.get_identity(&id).cloned() {
            Some(existing) if existing.is_own() => {
                return Err(StoreError::DuplicateIdentity(id));
            }
            Some(mut existing) => {
                existing.make_own(insert_uri, now);
                txn.put_identity(existing)?;
            }
            None => {
                let identity = Identity::new_own(insert_uri, nickname, publishes_trust_list, now)?;
                txn.put_identity(identity)?;
            }
        }
        self.engine.init_own_tree(&mut txn, &id)?;
        let events = txn.commit();
        self.publish(events);
        self.store.identity(&id)
    }

    /// Deletes an own identity, cascading to every trust it gives or
    /// receives and to its score tree.
    pub fn delete_own_identity(&self, id: &IdentityId) -> Result<(), StoreError> {
        let mut txn = self.store.begin();
        txn.own_identity(id)?;
        for trust in txn.given_trusts(id) {
            let old = txn.delete_trust(id, trust.trustee())?;
            self.engine.on_trust_changed(&mut txn, Some(&old), None)?;
        }
        for trust in txn.received_trusts(id) {
            let old = txn.delete_trust(trust.truster(), id)?;
            self.engine.on_trust_changed(&mut txn, Some(&old), None)?;
        }
        for score in txn.scores_of_owner(id) {
            txn.delete_score(id, score.trustee())?;
        }
        for score in txn.scores_for_target(id) {
            txn.delete_score(score.owner(), id)?;
        }
        txn.delete_identity(id)?;
        let events = txn.commit();
        self.publish(events);
        Ok(())
    }

    /// Adds a discovered identity by its request URI. The URI's edition
    /// becomes the initial edition hint.
    pub fn add_identity(&self, uri_text: &str) -> Result<Identity, StoreError> {
        let uri: RequestUri = uri_text.parse()?;
        let mut txn = self.store.begin();
        let now = txn.now_ms();
        if txn.get_identity(uri.id()).is_some() {
            return Err(StoreError::DuplicateIdentity(*uri.id()));
        }
        let identity = Identity::new(&uri, None, false, now)?;
        txn.put_identity(identity)?;
        let events = txn.commit();
        self.publish(events);
        self.store.identity(uri.id())
    }

    // --- Trust operations ---

    /// Sets or updates the trust of an own identity. Induced score changes
    /// commit in the same transaction; any engine failure rolls the whole
    /// change back.
    pub fn set_trust(
        &self,
        truster: &IdentityId,
        trustee: &IdentityId,
        value: i8,
        comment: &str,
    ) -> Result<(), StoreError> {
        let mut txn = self.store.begin();
        let now = txn.now_ms();
        let owner_edition = txn.own_identity(truster)?.edition();
        txn.identity(trustee)?;
        let old = txn.get_trust(truster, trustee).cloned();
        let new = match old.clone() {
            Some(mut t) => {
                t.set_value(value, now)?;
                t.set_comment(comment, now)?;
                t.set_truster_edition(owner_edition);
                t
            }
            None => Trust::new(*truster, *trustee, value, comment, owner_edition, now)?,
        };
        txn.put_trust(new.clone())?;
        self.engine
            .on_trust_changed(&mut txn, old.as_ref(), Some(&new))?;
        let events = txn.commit();
        self.publish(events);
        Ok(())
    }

    /// Removes the trust of an own identity.
    pub fn remove_trust(
        &self,
        truster: &IdentityId,
        trustee: &IdentityId,
    ) -> Result<(), StoreError> {
        let mut txn = self.store.begin();
        txn.own_identity(truster)?;
        let old = txn.delete_trust(truster, trustee)?;
        self.engine.on_trust_changed(&mut txn, Some(&old), None)?;
        let events = txn.commit();
        self.publish(events);
        Ok(())
    }

    // --- Queries (all results are clones) ---

    pub fn identity(&self, id: &IdentityId) -> Result<Identity, StoreError> {
        self.store.identity(id)
    }

    pub fn all_identities(&self) -> Vec<Identity> {
        self.store.all_identities()
    }

    pub fn own_identities(&self) -> Vec<Identity> {
        self.store.own_identities()
    }

    pub fn trust(&self, truster: &IdentityId, trustee: &IdentityId) -> Result<Trust, StoreError> {
        self.store.trust(truster, trustee)
    }

    pub fn all_trusts(&self) -> Vec<Trust> {
        self.store.all_trusts()
    }

    pub fn given_trusts(&self, truster: &IdentityId) -> Vec<Trust> {
        self.store.given_trusts(truster)
    }

    pub fn received_trusts(&self, trustee: &IdentityId) -> Vec<Trust> {
        self.store.received_trusts(trustee)
    }

    pub fn score(&self, owner: &IdentityId, target: &IdentityId) -> Result<Score, StoreError> {
        self.store.score(owner, target)
    }

    pub fn all_scores(&self) -> Vec<Score> {
        self.store.all_scores()
    }

    pub fn scores_of_owner(&self, owner: &IdentityId) -> Vec<Score> {
        self.store.scores_of_owner(owner)
    }

    pub fn scores_for_target(&self, target: &IdentityId) -> Vec<Score> {
        self.store.scores_for_target(target)
    }

    /// Rebuilds every owner's score tree from scratch and commits any
    /// corrections. Returns whether anything had to change; with a healthy
    /// incrementally-maintained score set this is false.
    pub fn recompute_all_scores(&self) -> Result<bool, StoreError> {
        let mut txn = self.store.begin();
        self.engine.full_recompute_all(&mut txn)?;
        let events = txn.commit();
        let changed = !events.is_empty();
        self.publish(events);
        Ok(changed)
    }

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            queue: self.queue.stats(),
            scores: self.engine.stats(),
        }
    }

    // --- Component access ---

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// The inbound end of the pipeline: the network layer enqueues fetched
    /// identity files here.
    pub fn import_queue(&self) -> &Arc<ImportQueue> {
        &self.queue
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Drains the import queue on the caller's thread. Used by tests and
    /// shutdown paths instead of waiting for the delayed job.
    pub fn process_imports_now(&self) {
        self.importer.drain(&CancellationToken::new());
    }

    /// Deploys all pending notifications immediately.
    pub async fn deploy_notifications_now(&self) {
        self.subscriptions
            .deploy_pending(&CancellationToken::new())
            .await;
    }

    /// Publishes a committed change batch to the observers, applying any
    /// refetch the scheduler asks for.
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
        let _ = self.scheduler.on_events(&events);
        Ok(())
    }
}
