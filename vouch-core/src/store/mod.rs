//! The graph store
//!
//! In-memory entity maps with secondary indices, guarded by a single
//! reader/writer lock. All mutation happens through a [`Transaction`]:
//! either all writes of the transaction become visible together on
//! `commit`, or none do. A global write lock serializes writers; readers
//! always see the last committed state.
//!
//! Everything handed out of the store is a deep clone carrying its own
//! timestamps. Store-internal entities are never exposed to consumers.

mod error;

pub use error::StoreError;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::trace;
use uuid::Uuid;
use vouch_model::{ChangeEvent, Clock, EventKind, Identity, IdentityId, Score, Trust};

const ID_MIN: IdentityId = IdentityId([0x00; 32]);
const ID_MAX: IdentityId = IdentityId([0xff; 32]);

/// The committed entity maps. `BTreeMap` throughout so every enumeration
/// is deterministic.
#[derive(Clone, Default)]
pub(crate) struct StoreState {
    identities: BTreeMap<IdentityId, Identity>,
    trusts: BTreeMap<(IdentityId, IdentityId), Trust>,
    trusts_by_trustee: BTreeMap<IdentityId, BTreeSet<IdentityId>>,
    scores: BTreeMap<(IdentityId, IdentityId), Score>,
    scores_by_target: BTreeMap<IdentityId, BTreeSet<IdentityId>>,
}

impl StoreState {
    pub(crate) fn identity(&self, id: &IdentityId) -> Option<&Identity> {
        self.identities.get(id)
    }

    pub(crate) fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub(crate) fn own_identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values().filter(|i| i.is_own())
    }

    pub(crate) fn trust(&self, truster: &IdentityId, trustee: &IdentityId) -> Option<&Trust> {
        self.trusts.get(&(*truster, *trustee))
    }

    pub(crate) fn trusts(&self) -> impl Iterator<Item = &Trust> {
        self.trusts.values()
    }

    pub(crate) fn given_trusts(&self, truster: &IdentityId) -> impl Iterator<Item = &Trust> {
        self.trusts
            .range((*truster, ID_MIN)..=(*truster, ID_MAX))
            .map(|(_, t)| t)
    }

    pub(crate) fn received_trusts<'a>(
        &'a self,
        trustee: &'a IdentityId,
    ) -> impl Iterator<Item = &'a Trust> + 'a {
        self.trusts_by_trustee
            .get(trustee)
            .into_iter()
            .flatten()
            .filter_map(move |truster| self.trusts.get(&(*truster, *trustee)))
    }

    pub(crate) fn score(&self, owner: &IdentityId, target: &IdentityId) -> Option<&Score> {
        self.scores.get(&(*owner, *target))
    }

    pub(crate) fn scores(&self) -> impl Iterator<Item = &Score> {
        self.scores.values()
    }

    pub(crate) fn scores_of_owner(&self, owner: &IdentityId) -> impl Iterator<Item = &Score> {
        self.scores
            .range((*owner, ID_MIN)..=(*owner, ID_MAX))
            .map(|(_, s)| s)
    }

    pub(crate) fn scores_for_target<'a>(
        &'a self,
        target: &'a IdentityId,
    ) -> impl Iterator<Item = &'a Score> + 'a {
        self.scores_by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(move |owner| self.scores.get(&(*owner, *target)))
    }

    pub(crate) fn has_positive_score(&self, target: &IdentityId) -> bool {
        self.scores_for_target(target).any(|s| s.value() > 0)
    }
}

/// The transactional graph store.
pub struct GraphStore {
    state: RwLock<StoreState>,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl GraphStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            write_lock: Mutex::new(()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Opens a transaction. Blocks until no other writer is active.
    /// Readers are not blocked while the transaction is being built, only
    /// for the brief atomic swap at commit.
    pub fn begin(&self) -> Transaction<'_> {
        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let work = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Transaction {
            store: self,
            _guard: guard,
            work,
            events: Vec::new(),
            now_ms: self.clock.now_ms(),
        }
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Clone-out read surface ---

    pub fn get_identity(&self, id: &IdentityId) -> Option<Identity> {
        self.read().identity(id).cloned()
    }

    pub fn identity(&self, id: &IdentityId) -> Result<Identity, StoreError> {
        self.get_identity(id).ok_or(StoreError::UnknownIdentity(*id))
    }

    pub fn all_identities(&self) -> Vec<Identity> {
        self.read().identities().cloned().collect()
    }

    pub fn own_identities(&self) -> Vec<Identity> {
        self.read().own_identities().cloned().collect()
    }

    pub fn trust(&self, truster: &IdentityId, trustee: &IdentityId) -> Result<Trust, StoreError> {
        self.read()
            .trust(truster, trustee)
            .cloned()
            .ok_or(StoreError::NotTrusted {
                truster: *truster,
                trustee: *trustee,
            })
    }

    pub fn all_trusts(&self) -> Vec<Trust> {
        self.read().trusts().cloned().collect()
    }

    pub fn given_trusts(&self, truster: &IdentityId) -> Vec<Trust> {
        self.read().given_trusts(truster).cloned().collect()
    }

    pub fn received_trusts(&self, trustee: &IdentityId) -> Vec<Trust> {
        self.read().received_trusts(trustee).cloned().collect()
    }

    pub fn score(&self, owner: &IdentityId, target: &IdentityId) -> Result<Score, StoreError> {
        self.read()
            .score(owner, target)
            .cloned()
            .ok_or(StoreError::NotInTrustTree {
                owner: *owner,
                target: *target,
            })
    }

    pub fn all_scores(&self) -> Vec<Score> {
        self.read().scores().cloned().collect()
    }

    pub fn scores_of_owner(&self, owner: &IdentityId) -> Vec<Score> {
        self.read().scores_of_owner(owner).cloned().collect()
    }

    pub fn scores_for_target(&self, target: &IdentityId) -> Vec<Score> {
        self.read().scores_for_target(target).cloned().collect()
    }

    /// Whether the identity has a positive score under any owner, i.e. is
    /// worth fetching.
    pub fn has_positive_score(&self, target: &IdentityId) -> bool {
        self.read().has_positive_score(target)
    }

    /// A consistent full snapshot of one entity kind, as creation events.
    /// Used to initialize new subscribers.
    pub fn snapshot_of(&self, kind: EventKind) -> Vec<ChangeEvent> {
        let state = self.read();
        match kind {
            EventKind::Identities => state
                .identities()
                .map(|i| ChangeEvent::Identity {
                    old: None,
                    new: Some(i.clone()),
                })
                .collect(),
            EventKind::Trusts => state
                .trusts()
                .map(|t| ChangeEvent::Trust {
                    old: None,
                    new: Some(t.clone()),
                })
                .collect(),
            EventKind::Scores => state
                .scores()
                .map(|s| ChangeEvent::Score {
                    old: None,
                    new: Some(s.clone()),
                })
                .collect(),
        }
    }
}

/// A buffered unit of work against the store.
///
/// Reads observe the last committed state plus this transaction's own
/// writes. Dropping the transaction discards everything.
pub struct Transaction<'a> {
    store: &'a GraphStore,
    _guard: MutexGuard<'a, ()>,
    work: StoreState,
    events: Vec<ChangeEvent>,
    now_ms: u64,
}

impl Transaction<'_> {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    // --- Reads ---

    pub fn get_identity(&self, id: &IdentityId) -> Option<&Identity> {
        self.work.identity(id)
    }

    pub fn identity(&self, id: &IdentityId) -> Result<&Identity, StoreError> {
        self.work.identity(id).ok_or(StoreError::UnknownIdentity(*id))
    }

    pub fn own_identity(&self, id: &IdentityId) -> Result<&Identity, StoreError> {
        let identity = self.identity(id)?;
        if !identity.is_own() {
            return Err(StoreError::NotOwnIdentity(*id));
        }
        Ok(identity)
    }

    pub fn own_identity_ids(&self) -> Vec<IdentityId> {
        self.work.own_identities().map(|i| *i.id()).collect()
    }

    pub fn get_trust(&self, truster: &IdentityId, trustee: &IdentityId) -> Option<&Trust> {
        self.work.trust(truster, trustee)
    }

    pub fn given_trusts(&self, truster: &IdentityId) -> Vec<Trust> {
        self.work.given_trusts(truster).cloned().collect()
    }

    pub fn received_trusts(&self, trustee: &IdentityId) -> Vec<Trust> {
        self.work.received_trusts(trustee).cloned().collect()
    }

    pub fn get_score(&self, owner: &IdentityId, target: &IdentityId) -> Option<&Score> {
        self.work.score(owner, target)
    }

    pub fn scores_of_owner(&self, owner: &IdentityId) -> Vec<Score> {
        self.work.scores_of_owner(owner).cloned().collect()
    }

    pub fn scores_for_target(&self, target: &IdentityId) -> Vec<Score> {
        self.work.scores_for_target(target).cloned().collect()
    }

    // --- Writes ---

    /// Inserts or updates an identity. A domain-equal update (timestamps
    /// only) is stored silently: no event, version id kept.
    pub fn put_identity(&mut self, identity: Identity) -> Result<(), StoreError> {
        let old = self.work.identities.get(identity.id()).cloned();
        if let Some(existing) = &old {
            if *existing == identity {
                self.work.identities.insert(*identity.id(), identity);
                return Ok(());
            }
        }
        let mut identity = identity;
        identity.set_version_id(Uuid::new_v4());
        trace!(identity = %identity.id(), created = old.is_none(), "store identity");
        self.work.identities.insert(*identity.id(), identity.clone());
        self.events.push(ChangeEvent::Identity {
            old,
            new: Some(identity),
        });
        Ok(())
    }

    /// Removes an identity row. All trusts and scores referencing it must
    /// have been removed first; leftovers are an internal error.
    pub fn delete_identity(&mut self, id: &IdentityId) -> Result<Identity, StoreError> {
        if self.work.given_trusts(id).next().is_some()
            || self.work.received_trusts(id).next().is_some()
        {
            return Err(StoreError::Internal(format!(
                "identity {id} still has trust edges"
            )));
        }
        if self.work.scores_of_owner(id).next().is_some()
            || self.work.scores_for_target(id).next().is_some()
        {
            return Err(StoreError::Internal(format!(
                "identity {id} still has score rows"
            )));
        }
        let old = self
            .work
            .identities
            .remove(id)
            .ok_or(StoreError::UnknownIdentity(*id))?;
        self.events.push(ChangeEvent::Identity {
            old: Some(old.clone()),
            new: None,
        });
        Ok(old)
    }

    /// Inserts or updates a trust edge. Both endpoints must exist. An
    /// update whose only difference is the asserting edition is stored
    /// silently.
    pub fn put_trust(&mut self, trust: Trust) -> Result<(), StoreError> {
        if self.work.identity(trust.truster()).is_none() {
            return Err(StoreError::UnknownIdentity(*trust.truster()));
        }
        if self.work.identity(trust.trustee()).is_none() {
            return Err(StoreError::UnknownIdentity(*trust.trustee()));
        }
        let key = (*trust.truster(), *trust.trustee());
        let old = self.work.trusts.get(&key).cloned();
        if let Some(existing) = &old {
            if *existing == trust {
                self.work.trusts.insert(key, trust);
                return Ok(());
            }
        }
        let mut trust = trust;
        trust.set_version_id(Uuid::new_v4());
        self.work.trusts.insert(key, trust.clone());
        self.work
            .trusts_by_trustee
            .entry(*trust.trustee())
            .or_default()
            .insert(*trust.truster());
        self.events.push(ChangeEvent::Trust {
            old,
            new: Some(trust),
        });
        Ok(())
    }

    pub fn delete_trust(
        &mut self,
        truster: &IdentityId,
        trustee: &IdentityId,
    ) -> Result<Trust, StoreError> {
        let old = self
            .work
            .trusts
            .remove(&(*truster, *trustee))
            .ok_or(StoreError::NotTrusted {
                truster: *truster,
                trustee: *trustee,
            })?;
        if let Some(trusters) = self.work.trusts_by_trustee.get_mut(trustee) {
            trusters.remove(truster);
            if trusters.is_empty() {
                self.work.trusts_by_trustee.remove(trustee);
            }
        }
        self.events.push(ChangeEvent::Trust {
            old: Some(old.clone()),
            new: None,
        });
        Ok(old)
    }

    /// Inserts or updates a score row. Only the score engine writes these.
    pub fn put_score(&mut self, score: Score) -> Result<(), StoreError> {
        match self.work.identity(score.owner()) {
            None => return Err(StoreError::UnknownIdentity(*score.owner())),
            Some(owner) if !owner.is_own() => {
                return Err(StoreError::NotOwnIdentity(*score.owner()))
            }
            Some(_) => {}
        }
        if self.work.identity(score.trustee()).is_none() {
            return Err(StoreError::UnknownIdentity(*score.trustee()));
        }
        let key = (*score.owner(), *score.trustee());
        let old = self.work.scores.get(&key).cloned();
        if let Some(existing) = &old {
            if *existing == score {
                return Ok(());
            }
        }
        let mut score = score;
        score.set_version_id(Uuid::new_v4());
        self.work.scores.insert(key, score.clone());
        self.work
            .scores_by_target
            .entry(*score.trustee())
            .or_default()
            .insert(*score.owner());
        self.events.push(ChangeEvent::Score {
            old,
            new: Some(score),
        });
        Ok(())
    }

    pub fn delete_score(
        &mut self,
        owner: &IdentityId,
        target: &IdentityId,
    ) -> Result<Score, StoreError> {
        let old = self
            .work
            .scores
            .remove(&(*owner, *target))
            .ok_or(StoreError::NotInTrustTree {
                owner: *owner,
                target: *target,
            })?;
        if let Some(owners) = self.work.scores_by_target.get_mut(target) {
            owners.remove(owner);
            if owners.is_empty() {
                self.work.scores_by_target.remove(target);
            }
        }
        self.events.push(ChangeEvent::Score {
            old: Some(old.clone()),
            new: None,
        });
        Ok(old)
    }

    /// Publishes all buffered writes atomically and returns the change
    /// events in mutation order.
    pub fn commit(self) -> Vec<ChangeEvent> {
        let mut state = self
            .store
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = self.work;
        self.events
    }

    /// Discards all buffered writes. Equivalent to dropping the
    /// transaction.
    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouch_model::{MockClock, RequestUri};

    fn store() -> GraphStore {
        GraphStore::new(Arc::new(MockClock::new(1000)))
    }

    fn identity(seed: u8, now: u64) -> Identity {
        Identity::new(
            &RequestUri::new(IdentityId([seed; 32]), 0),
            None,
            true,
            now,
        )
        .unwrap()
    }

    #[test]
    fn commit_makes_writes_visible_atomically() {
        let store = store();
        let a = identity(1, 0);
        let b = identity(2, 0);

        let mut txn = store.begin();
        txn.put_identity(a.clone()).unwrap();
        txn.put_identity(b.clone()).unwrap();
        assert!(store.get_identity(a.id()).is_none());

        let events = txn.commit();
        assert_eq!(events.len(), 2);
        assert!(store.get_identity(a.id()).is_some());
        assert!(store.get_identity(b.id()).is_some());
    }

    #[test]
    fn rollback_discards_writes() {
        let store = store();
        let a = identity(1, 0);
        let txn = {
            let mut txn = store.begin();
            txn.put_identity(a.clone()).unwrap();
            txn
        };
        txn.rollback();
        assert!(store.get_identity(a.id()).is_none());
    }

    #[test]
    fn put_identity_restamps_version_on_change_only() {
        let store = store();
        let a = identity(1, 0);
        let mut txn = store.begin();
        txn.put_identity(a.clone()).unwrap();
        txn.commit();
        let stored = store.get_identity(a.id()).unwrap();

        // Timestamp-only update: version kept, no event.
        let mut unchanged = stored.clone();
        unchanged.updated(5000);
        let mut txn = store.begin();
        txn.put_identity(unchanged).unwrap();
        let events = txn.commit();
        assert!(events.is_empty());
        assert_eq!(
            store.get_identity(a.id()).unwrap().version_id(),
            stored.version_id()
        );

        // Real change: version restamped, event emitted.
        let mut changed = store.get_identity(a.id()).unwrap();
        changed.set_edition(1, 6000).unwrap();
        let mut txn = store.begin();
        txn.put_identity(changed).unwrap();
        let events = txn.commit();
        assert_eq!(events.len(), 1);
        assert_ne!(
            store.get_identity(a.id()).unwrap().version_id(),
            stored.version_id()
        );
    }

    #[test]
    fn trust_requires_both_endpoints() {
        let store = store();
        let a = identity(1, 0);
        let mut txn = store.begin();
        txn.put_identity(a.clone()).unwrap();
        let trust = Trust::new(*a.id(), IdentityId([9; 32]), 50, "", 0, 0).unwrap();
        assert!(matches!(
            txn.put_trust(trust),
            Err(StoreError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn trust_indices_track_deletion() {
        let store = store();
        let a = identity(1, 0);
        let b = identity(2, 0);
        let mut txn = store.begin();
        txn.put_identity(a.clone()).unwrap();
        txn.put_identity(b.clone()).unwrap();
        txn.put_trust(Trust::new(*a.id(), *b.id(), 50, "", 0, 0).unwrap())
            .unwrap();
        txn.commit();

        assert_eq!(store.given_trusts(a.id()).len(), 1);
        assert_eq!(store.received_trusts(b.id()).len(), 1);

        let mut txn = store.begin();
        txn.delete_trust(a.id(), b.id()).unwrap();
        txn.commit();
        assert!(store.given_trusts(a.id()).is_empty());
        assert!(store.received_trusts(b.id()).is_empty());
        assert!(matches!(
            store.trust(a.id(), b.id()),
            Err(StoreError::NotTrusted { .. })
        ));
    }

    #[test]
    fn score_owner_must_be_own_identity() {
        let store = store();
        let a = identity(1, 0); // not own
        let b = identity(2, 0);
        let mut txn = store.begin();
        txn.put_identity(a.clone()).unwrap();
        txn.put_identity(b.clone()).unwrap();
        let score = Score::new(*a.id(), *b.id(), 10, 1, 40, 0).unwrap();
        assert!(matches!(
            txn.put_score(score),
            Err(StoreError::NotOwnIdentity(_))
        ));
    }

    #[test]
    fn delete_identity_refuses_dangling_references() {
        let store = store();
        let a = identity(1, 0);
        let b = identity(2, 0);
        let mut txn = store.begin();
        txn.put_identity(a.clone()).unwrap();
        txn.put_identity(b.clone()).unwrap();
        txn.put_trust(Trust::new(*a.id(), *b.id(), 50, "", 0, 0).unwrap())
            .unwrap();
        assert!(matches!(
            txn.delete_identity(a.id()),
            Err(StoreError::Internal(_))
        ));
        txn.delete_trust(a.id(), b.id()).unwrap();
        assert!(txn.delete_identity(a.id()).is_ok());
    }

    #[test]
    fn snapshot_is_creation_events() {
        let store = store();
        let mut txn = store.begin();
        txn.put_identity(identity(1, 0)).unwrap();
        txn.put_identity(identity(2, 0)).unwrap();
        txn.commit();

        let snapshot = store.snapshot_of(EventKind::Identities);
        assert_eq!(snapshot.len(), 2);
        for event in snapshot {
            match event {
                ChangeEvent::Identity { old, new } => {
                    assert!(old.is_none());
                    assert!(new.is_some());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
