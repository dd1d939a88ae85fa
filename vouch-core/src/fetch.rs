//! The fetcher port and fetch scheduler
//!
//! The fetcher is the outbound interface to the network layer: the
//! scheduler tells it which identity documents are worth retrieving and at
//! which edition to start looking. Retrieval results come back through the
//! import queue, tagged with the actual edition the network found.
//!
//! An identity is worth fetching while it has a positive score under at
//! least one owner. The scheduler diffs that wanted set after every commit
//! batch and issues start/cancel calls for the difference.

use crate::store::GraphStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::debug;
use vouch_model::{ChangeEvent, FetchState, IdentityId, RequestUri};

/// Outbound port to the network layer. Implementations own their threads;
/// they must not call back into the kernel from within these methods.
pub trait Fetcher: Send + Sync {
    /// Asks the network to retrieve the identity's document, starting the
    /// search at the given edition.
    fn start_fetch(&self, uri: &RequestUri);

    /// Stops retrieving the identity.
    fn cancel_fetch(&self, id: &IdentityId);
}

enum Action {
    Start(RequestUri),
    Cancel(IdentityId),
}

/// Keeps the fetcher pointed at the wanted set.
pub struct FetchScheduler {
    store: Arc<GraphStore>,
    fetcher: Arc<dyn Fetcher>,
    /// Editions currently requested, by identity.
    wanted: Mutex<BTreeMap<IdentityId, u64>>,
    /// Identities currently positive under some owner, to detect the
    /// distrusted-to-trusted transition.
    positive: Mutex<BTreeSet<IdentityId>>,
}

impl FetchScheduler {
    pub fn new(store: Arc<GraphStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            wanted: Mutex::new(BTreeMap::new()),
            positive: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reconciles every known identity. Called once at startup.
    pub fn rescan_all(&self) {
        let ids: Vec<IdentityId> = self
            .store
            .all_identities()
            .iter()
            .map(|i| *i.id())
            .collect();
        self.reconcile(&ids);
    }

    /// Reacts to a committed change batch. Returns the identities whose
    /// best score just turned positive and which therefore must be marked
    /// for refetch (their trust lists were imported while distrusted, so
    /// their trustees were never created).
    pub fn on_events(&self, events: &[ChangeEvent]) -> Vec<IdentityId> {
        let mut touched = BTreeSet::new();
        for event in events {
            match event {
                ChangeEvent::Score { old, new } => {
                    if let Some(s) = new.as_ref().or(old.as_ref()) {
                        touched.insert(*s.trustee());
                    }
                }
                ChangeEvent::Identity { old, new } => {
                    if let Some(i) = new.as_ref().or(old.as_ref()) {
                        touched.insert(*i.id());
                    }
                }
                ChangeEvent::Trust { .. } => {}
            }
        }
        let ids: Vec<IdentityId> = touched.into_iter().collect();
        self.reconcile(&ids)
    }

    fn reconcile(&self, ids: &[IdentityId]) -> Vec<IdentityId> {
        let mut refetch = Vec::new();
        let mut actions = Vec::new();
        {
            let mut wanted = self
                .wanted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut positive = self
                .positive
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for id in ids {
                let Some(identity) = self.store.get_identity(id) else {
                    positive.remove(id);
                    if wanted.remove(id).is_some() {
                        actions.push(Action::Cancel(*id));
                    }
                    continue;
                };
                let is_positive = self.store.has_positive_score(id);
                let was_positive = positive.contains(id);
                if is_positive && !was_positive {
                    positive.insert(*id);
                    // A formerly distrusted identity whose document was
                    // already imported needs a re-download: its trustees
                    // were not created while it was distrusted.
                    if identity.fetch_state() == FetchState::Fetched {
                        refetch.push(*id);
                    }
                } else if !is_positive && was_positive {
                    positive.remove(id);
                }

                if is_positive {
                    let edition = identity.edition().max(identity.edition_hint()) + 1;
                    if wanted.get(id) != Some(&edition) {
                        wanted.insert(*id, edition);
                        actions.push(Action::Start(
                            identity.request_uri().with_edition(edition),
                        ));
                    }
                } else if wanted.remove(id).is_some() {
                    actions.push(Action::Cancel(*id));
                }
            }
        }
        // Fetcher calls happen outside our locks.
        for action in actions {
            match action {
                Action::Start(uri) => {
                    debug!(identity = %uri.id(), edition = uri.edition(), "scheduling fetch");
                    self.fetcher.start_fetch(&uri);
                }
                Action::Cancel(id) => {
                    debug!(identity = %id, "cancelling fetch");
                    self.fetcher.cancel_fetch(&id);
                }
            }
        }
        refetch
    }
}
