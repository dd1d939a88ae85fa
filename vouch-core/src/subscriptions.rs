//! The subscription engine
//!
//! Clients subscribe to one or more entity kinds and receive ordered
//! change notifications. Per client there is one queue with monotone
//! indices, merged across subscription kinds, so a trust notification is
//! never delivered before the identity notification that introduced its
//! endpoints.
//!
//! A new subscription is initialized with a synchronization: BeginSync,
//! one ObjectChanged per existing entity (each stamped with the
//! synchronization's version id), EndSync. After EndSync the client
//! sweeps every locally cached entity whose version id differs, giving a
//! correct full resync from arbitrarily stale state.
//!
//! Deployment runs on a single delayed job. Per client, notifications are
//! sent one by one in index order; a transport error aborts that client's
//! run until the next pass, an explicit failure response counts toward
//! the disconnect limit.
//!
//! Clients are not persisted: `start()` wipes everything, trading
//! durability for simplicity. Reconnecting clients get a fresh
//! synchronization.

use crate::jobs::{DelayedJob, JobRunner};
use crate::store::GraphStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vouch_model::{ChangeEvent, EventKind};

/// How long stop() waits for the deployment worker at shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(7 * 24 * 3600);

/// The way a client is notified.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClientKind {
    Rpc,
    Callback,
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection is gone; delivery will be retried later.
    #[error("client transport disconnected: {0}")]
    Disconnected(String),

    /// The client received the notification but reported that processing
    /// it failed.
    #[error("client reported failure processing the notification")]
    Failed,
}

/// Delivery port to one client. Sends are synchronous to the client's
/// transport: a successful return is the client's acknowledgement.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, client: Uuid, notification: &Notification) -> Result<(), TransportError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NotificationPayload {
    /// An entity changed: absent old = created, absent new = deleted.
    ObjectChanged(ChangeEvent),
    /// Start of a synchronization; `amount` announces how many
    /// ObjectChanged notifications follow.
    BeginSync { version_id: Uuid, amount: u64 },
    /// End of a synchronization: the client sweeps cached entities whose
    /// version id does not match.
    EndSync { version_id: Uuid },
}

/// An immutable record in a client's queue.
#[derive(Clone, Debug)]
pub struct Notification {
    pub index: u64,
    pub subscription: Uuid,
    pub kind: EventKind,
    pub payload: NotificationPayload,
}

/// Binds a client to one event source kind.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub client: Uuid,
    pub kind: EventKind,
}

struct ClientState {
    kind: ClientKind,
    transport: Arc<dyn NotificationTransport>,
    subscriptions: Vec<Subscription>,
    queue: VecDeque<Notification>,
    next_index: u64,
    failures: u8,
}

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("a subscription of kind {0:?} already exists for this client")]
    AlreadySubscribed(EventKind),

    #[error("unknown subscription {0}")]
    UnknownSubscription(Uuid),

    #[error("the subscription manager was already started")]
    AlreadyStarted,
}

pub struct SubscriptionManager {
    store: Arc<GraphStore>,
    clients: Mutex<BTreeMap<Uuid, ClientState>>,
    job: Mutex<Option<Arc<dyn DelayedJob>>>,
    failure_limit: u8,
}

impl SubscriptionManager {
    pub fn new(store: Arc<GraphStore>, failure_limit: u8) -> Self {
        Self {
            store,
            clients: Mutex::new(BTreeMap::new()),
            job: Mutex::new(None),
            failure_limit,
        }
    }

    /// Deletes all clients, subscriptions and notifications, then enables
    /// deployment through the given job. Exactly one lifecycle: a second
    /// start is refused.
    pub fn start(&self, job: Arc<dyn DelayedJob>) -> Result<(), SubscriptionError> {
        let mut slot = self
            .job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(SubscriptionError::AlreadyStarted);
        }
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        *slot = Some(job);
        info!("subscription manager started");
        Ok(())
    }

    /// Aborts queued deployment and waits for a running one to finish.
    pub async fn stop(&self) {
        let job = self
            .job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(job) = job {
            job.terminate();
            job.wait_for_termination(SHUTDOWN_WAIT).await;
        }
        info!("subscription manager stopped");
    }

    fn trigger_deployment(&self) {
        let job = self
            .job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(job) = job {
            job.trigger();
        }
    }

    /// Creates a subscription for the client and enqueues the
    /// synchronization under the store's read snapshot. The client is
    /// created on its first subscription; a second subscription of the
    /// same kind is refused.
    pub fn subscribe(
        &self,
        client_id: Uuid,
        client_kind: ClientKind,
        kind: EventKind,
        transport: Arc<dyn NotificationTransport>,
    ) -> Result<Uuid, SubscriptionError> {
        // Consistent snapshot of the full entity set of this kind. Lock
        // order: store before subscription state.
        let mut snapshot = self.store.snapshot_of(kind);
        let version_id = Uuid::new_v4();
        for event in &mut snapshot {
            stamp_version(event, version_id);
        }

        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let client = clients.entry(client_id).or_insert_with(|| ClientState {
            kind: client_kind,
            transport,
            subscriptions: Vec::new(),
            queue: VecDeque::new(),
            next_index: 0,
            failures: 0,
        });
        if client.subscriptions.iter().any(|s| s.kind == kind) {
            return Err(SubscriptionError::AlreadySubscribed(kind));
        }
        let subscription = Subscription {
            id: Uuid::new_v4(),
            client: client_id,
            kind,
        };
        let subscription_id = subscription.id;
        client.subscriptions.push(subscription);

        let amount = snapshot.len() as u64;
        enqueue(
            client,
            subscription_id,
            kind,
            NotificationPayload::BeginSync { version_id, amount },
        );
        for event in snapshot {
            enqueue(
                client,
                subscription_id,
                kind,
                NotificationPayload::ObjectChanged(event),
            );
        }
        enqueue(
            client,
            subscription_id,
            kind,
            NotificationPayload::EndSync { version_id },
        );
        debug!(client = %client_id, ?kind, subscription = %subscription_id, amount, "subscribed");
        drop(clients);

        self.trigger_deployment();
        Ok(subscription_id)
    }

    /// Removes a subscription. Already queued notifications are still
    /// delivered so the client's index sequence stays gap-free.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), SubscriptionError> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for client in clients.values_mut() {
            if let Some(pos) = client
                .subscriptions
                .iter()
                .position(|s| s.id == subscription_id)
            {
                client.subscriptions.remove(pos);
                return Ok(());
            }
        }
        Err(SubscriptionError::UnknownSubscription(subscription_id))
    }

    /// Buffers notifications for a committed change batch. Must only be
    /// called after the transaction producing the events has committed.
    pub fn on_events(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let mut enqueued = false;
        {
            let mut clients = self
                .clients
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for client in clients.values_mut() {
                for event in events {
                    let kind = event.kind();
                    let Some(subscription) = client
                        .subscriptions
                        .iter()
                        .find(|s| s.kind == kind)
                        .cloned()
                    else {
                        continue;
                    };
                    enqueue(
                        client,
                        subscription.id,
                        kind,
                        NotificationPayload::ObjectChanged(event.clone()),
                    );
                    enqueued = true;
                }
            }
        }
        if enqueued {
            self.trigger_deployment();
        }
    }

    /// Sends every client's queue. Used as the deployment job's body; a
    /// failed client schedules a retry pass.
    pub async fn deploy_pending(&self, cancel: &CancellationToken) {
        let client_ids: Vec<Uuid> = {
            let clients = self
                .clients
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            clients.keys().copied().collect()
        };
        let mut retry = false;
        for client_id in client_ids {
            if cancel.is_cancelled() {
                return;
            }
            if !self.deploy_client(client_id).await {
                retry = true;
            }
        }
        if retry {
            self.trigger_deployment();
        }
    }

    /// Sends one client's queue in index order. Returns false if the
    /// client still has pending notifications (send failed mid-queue).
    pub async fn deploy_client(&self, client_id: Uuid) -> bool {
        loop {
            let (notification, transport) = {
                let clients = self
                    .clients
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let Some(client) = clients.get(&client_id) else {
                    return true;
                };
                match client.queue.front() {
                    Some(notification) => (notification.clone(), client.transport.clone()),
                    None => return true,
                }
            };

            let result = transport.send(client_id, &notification).await;

            let mut clients = self
                .clients
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(client) = clients.get_mut(&client_id) else {
                return true;
            };
            match result {
                Ok(()) => {
                    // Client acknowledged: advance past this notification.
                    if client
                        .queue
                        .front()
                        .is_some_and(|n| n.index == notification.index)
                    {
                        client.queue.pop_front();
                    }
                }
                Err(TransportError::Failed) => {
                    client.failures += 1;
                    warn!(
                        client = %client_id,
                        failures = client.failures,
                        "client failed to process notification"
                    );
                    if client.failures >= self.failure_limit {
                        info!(client = %client_id, "disconnecting client after repeated failures");
                        clients.remove(&client_id);
                        return true;
                    }
                    return false;
                }
                Err(TransportError::Disconnected(reason)) => {
                    debug!(client = %client_id, %reason, "client transport disconnected");
                    return false;
                }
            }
        }
    }

    // --- Introspection, used by the RPC layer and tests ---

    pub fn client_exists(&self, client_id: Uuid) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&client_id)
    }

    pub fn client_kind(&self, client_id: Uuid) -> Option<ClientKind> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&client_id)
            .map(|c| c.kind)
    }

    pub fn client_queue_len(&self, client_id: Uuid) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&client_id)
            .map(|c| c.queue.len())
            .unwrap_or(0)
    }

    pub fn subscriptions_of(&self, client_id: Uuid) -> Vec<Subscription> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&client_id)
            .map(|c| c.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn enqueue(client: &mut ClientState, subscription: Uuid, kind: EventKind, payload: NotificationPayload) {
    let index = client.next_index;
    client.next_index += 1;
    client.queue.push_back(Notification {
        index,
        subscription,
        kind,
        payload,
    });
}

fn stamp_version(event: &mut ChangeEvent, version_id: Uuid) {
    match event {
        ChangeEvent::Identity { new: Some(i), .. } => i.set_version_id(version_id),
        ChangeEvent::Trust { new: Some(t), .. } => t.set_version_id(version_id),
        ChangeEvent::Score { new: Some(s), .. } => s.set_version_id(version_id),
        _ => {}
    }
}

/// Job body for the deployment job. Holds the manager weakly so the
/// manager -> job -> runner chain does not leak.
pub struct DeployRunner {
    manager: Weak<SubscriptionManager>,
}

impl DeployRunner {
    pub fn new(manager: &Arc<SubscriptionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::downgrade(manager),
        })
    }
}

#[async_trait]
impl JobRunner for DeployRunner {
    async fn run(&self, cancel: &CancellationToken) {
        if let Some(manager) = self.manager.upgrade() {
            manager.deploy_pending(cancel).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MockJob;
    use std::sync::Mutex as StdMutex;
    use vouch_model::{Identity, IdentityId, MockClock, RequestUri};

    /// Transport double recording deliveries; can be told to fail or
    /// disconnect.
    #[derive(Default)]
    struct RecordingTransport {
        delivered: StdMutex<Vec<Notification>>,
        mode: StdMutex<Mode>,
    }

    #[derive(Default, Clone, Copy, PartialEq)]
    enum Mode {
        #[default]
        Ok,
        Fail,
        Disconnect,
    }

    #[async_trait]
    impl NotificationTransport for RecordingTransport {
        async fn send(
            &self,
            _client: Uuid,
            notification: &Notification,
        ) -> Result<(), TransportError> {
            match *self.mode.lock().unwrap() {
                Mode::Ok => {
                    self.delivered.lock().unwrap().push(notification.clone());
                    Ok(())
                }
                Mode::Fail => Err(TransportError::Failed),
                Mode::Disconnect => Err(TransportError::Disconnected("gone".into())),
            }
        }
    }

    fn setup(identities: usize) -> (Arc<GraphStore>, Arc<SubscriptionManager>) {
        let store = Arc::new(GraphStore::new(Arc::new(MockClock::new(0))));
        let mut txn = store.begin();
        for seed in 0..identities {
            let identity = Identity::new(
                &RequestUri::new(IdentityId([seed as u8 + 1; 32]), 0),
                None,
                true,
                0,
            )
            .unwrap();
            txn.put_identity(identity).unwrap();
        }
        txn.commit();
        let manager = Arc::new(SubscriptionManager::new(store.clone(), 5));
        manager.start(MockJob::new()).unwrap();
        (store, manager)
    }

    #[tokio::test]
    async fn synchronization_brackets_the_snapshot() {
        let (_store, manager) = setup(3);
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Identities, transport.clone())
            .unwrap();

        assert!(manager.deploy_client(client).await);
        let delivered = transport.delivered.lock().unwrap();
        // BeginSync + 3 ObjectChanged + EndSync.
        assert_eq!(delivered.len(), 5);

        let version = match &delivered[0].payload {
            NotificationPayload::BeginSync { version_id, amount } => {
                assert_eq!(*amount, 3);
                *version_id
            }
            other => panic!("expected BeginSync, got {other:?}"),
        };
        for notification in &delivered[1..4] {
            match &notification.payload {
                NotificationPayload::ObjectChanged(ChangeEvent::Identity { old, new }) => {
                    assert!(old.is_none());
                    assert_eq!(new.as_ref().unwrap().version_id(), version);
                }
                other => panic!("expected ObjectChanged, got {other:?}"),
            }
        }
        match &delivered[4].payload {
            NotificationPayload::EndSync { version_id } => assert_eq!(*version_id, version),
            other => panic!("expected EndSync, got {other:?}"),
        }

        // Indices are strictly increasing without gaps.
        for (expected, notification) in delivered.iter().enumerate() {
            assert_eq!(notification.index, expected as u64);
        }
    }

    #[tokio::test]
    async fn duplicate_kind_is_refused() {
        let (_store, manager) = setup(0);
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Trusts, transport.clone())
            .unwrap();
        assert!(matches!(
            manager.subscribe(client, ClientKind::Rpc, EventKind::Trusts, transport),
            Err(SubscriptionError::AlreadySubscribed(EventKind::Trusts))
        ));
    }

    #[tokio::test]
    async fn events_merge_into_one_indexed_queue() {
        let (store, manager) = setup(0);
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Identities, transport.clone())
            .unwrap();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Trusts, transport.clone())
            .unwrap();

        // One commit introducing an identity pair and a trust between
        // them: the identity events must precede the trust event.
        let mut txn = store.begin();
        let a = Identity::new(&RequestUri::new(IdentityId([1; 32]), 0), None, true, 0).unwrap();
        let b = Identity::new(&RequestUri::new(IdentityId([2; 32]), 0), None, true, 0).unwrap();
        let trust = vouch_model::Trust::new(*a.id(), *b.id(), 50, "", 0, 0).unwrap();
        txn.put_identity(a).unwrap();
        txn.put_identity(b).unwrap();
        txn.put_trust(trust).unwrap();
        let events = txn.commit();
        manager.on_events(&events);

        assert!(manager.deploy_client(client).await);
        let delivered = transport.delivered.lock().unwrap();
        let changes: Vec<&Notification> = delivered
            .iter()
            .filter(|n| matches!(n.payload, NotificationPayload::ObjectChanged(_)))
            .collect();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].kind, EventKind::Identities);
        assert_eq!(changes[1].kind, EventKind::Identities);
        assert_eq!(changes[2].kind, EventKind::Trusts);
        assert!(changes[0].index < changes[2].index);
    }

    #[tokio::test]
    async fn failure_limit_disconnects_the_client() {
        let (store, manager) = setup(0);
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Identities, transport.clone())
            .unwrap();
        assert!(manager.deploy_client(client).await);

        // Queue one change, then have the client report failure on every
        // delivery attempt.
        let mut txn = store.begin();
        let identity =
            Identity::new(&RequestUri::new(IdentityId([1; 32]), 0), None, true, 0).unwrap();
        txn.put_identity(identity).unwrap();
        manager.on_events(&txn.commit());

        *transport.mode.lock().unwrap() = Mode::Fail;
        for attempt in 1..=4 {
            assert!(!manager.deploy_client(client).await, "attempt {attempt}");
            assert!(manager.client_exists(client));
        }
        // Fifth failure reaches the limit: client, subscriptions and
        // notifications are gone.
        assert!(manager.deploy_client(client).await);
        assert!(!manager.client_exists(client));
        assert_eq!(manager.client_queue_len(client), 0);
        assert!(manager.subscriptions_of(client).is_empty());
    }

    #[tokio::test]
    async fn disconnect_preserves_the_queue_for_retry() {
        let (store, manager) = setup(0);
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Identities, transport.clone())
            .unwrap();
        assert!(manager.deploy_client(client).await);

        let mut txn = store.begin();
        let identity =
            Identity::new(&RequestUri::new(IdentityId([1; 32]), 0), None, true, 0).unwrap();
        txn.put_identity(identity).unwrap();
        manager.on_events(&txn.commit());

        *transport.mode.lock().unwrap() = Mode::Disconnect;
        assert!(!manager.deploy_client(client).await);
        assert!(manager.client_exists(client));
        assert_eq!(manager.client_queue_len(client), 1);

        // Reconnect: delivery resumes where it stopped.
        *transport.mode.lock().unwrap() = Mode::Ok;
        assert!(manager.deploy_client(client).await);
        assert_eq!(manager.client_queue_len(client), 0);
    }

    #[tokio::test]
    async fn start_wipes_clients_and_allows_one_lifecycle() {
        let store = Arc::new(GraphStore::new(Arc::new(MockClock::new(0))));
        let manager = SubscriptionManager::new(store, 5);

        // A client left over from before start (nothing survives a
        // restart) is wiped when the manager starts.
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        manager
            .subscribe(client, ClientKind::Rpc, EventKind::Scores, transport)
            .unwrap();
        assert!(manager.client_exists(client));

        manager.start(MockJob::new()).unwrap();
        assert!(!manager.client_exists(client));
        assert_eq!(manager.client_count(), 0);

        assert!(matches!(
            manager.start(MockJob::new()),
            Err(SubscriptionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_stops_new_notifications() {
        let (store, manager) = setup(0);
        let transport = Arc::new(RecordingTransport::default());
        let client = Uuid::new_v4();
        let subscription = manager
            .subscribe(client, ClientKind::Rpc, EventKind::Identities, transport.clone())
            .unwrap();
        assert!(manager.deploy_client(client).await);
        manager.unsubscribe(subscription).unwrap();
        assert!(matches!(
            manager.unsubscribe(subscription),
            Err(SubscriptionError::UnknownSubscription(_))
        ));

        let mut txn = store.begin();
        let identity =
            Identity::new(&RequestUri::new(IdentityId([1; 32]), 0), None, true, 0).unwrap();
        txn.put_identity(identity).unwrap();
        manager.on_events(&txn.commit());
        assert_eq!(manager.client_queue_len(client), 0);
    }
}
