//! The score engine
//!
//! Maintains the derived [`Score`] rows: for every own identity O and
//! identity T, a Score(O, T) exists exactly when there is a directed trust
//! path from O to T in which every intermediate identity has positive
//! capacity.
//!
//! Ranks are shortest hop distances. Negative trust does not forward
//! reachability, except that the owner's own edges always establish a rank
//! (so the owner's distrust yields a negative score without propagating
//! further). Capacity is a per-rank multiplier, forced to 0 for distrusted
//! identities; identities with capacity 0 contribute nothing.
//!
//! All recomputation is deterministic: nodes are finalized in
//! (rank, identity-id) order, so ties always resolve the same way.

use crate::store::{StoreError, Transaction};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};
use vouch_model::{
    capacity_for_rank, IdentityId, Score, Trust, OWN_CAPACITY, OWN_RANK, OWN_SCORE_VALUE,
};

/// Counters exposed through kernel statistics.
#[derive(Clone, Debug, Default)]
pub struct ScoreStats {
    pub incremental_updates: u64,
    pub full_recomputes: u64,
    pub full_recompute_ms_total: u64,
}

pub struct ScoreEngine {
    capacity_table: [u8; 6],
    stats: Mutex<ScoreStats>,
}

impl ScoreEngine {
    pub fn new(capacity_table: [u8; 6]) -> Self {
        Self {
            capacity_table,
            stats: Mutex::new(ScoreStats::default()),
        }
    }

    pub fn stats(&self) -> ScoreStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Creates the score tree for a freshly created or restored own
    /// identity, including its own rank-0 row.
    pub fn init_own_tree(
        &self,
        txn: &mut Transaction<'_>,
        owner: &IdentityId,
    ) -> Result<(), StoreError> {
        self.full_recompute_owner(txn, owner)
    }

    /// Reacts to a committed-to-be change of one trust edge. Recomputes
    /// the affected scores of every owner inside the same transaction; an
    /// internal inconsistency falls back to a full recompute for that
    /// owner.
    pub fn on_trust_changed(
        &self,
        txn: &mut Transaction<'_>,
        old: Option<&Trust>,
        new: Option<&Trust>,
    ) -> Result<(), StoreError> {
        let trustee = match (old, new) {
            (_, Some(t)) => *t.trustee(),
            (Some(t), None) => *t.trustee(),
            (None, None) => return Ok(()),
        };
        for owner in txn.own_identity_ids() {
            match self.incremental_update(txn, &owner, &trustee) {
                Ok(()) => {}
                Err(StoreError::Internal(reason)) => {
                    warn!(
                        owner = %owner,
                        %reason,
                        "incremental score update failed, falling back to full recompute"
                    );
                    self.full_recompute_owner(txn, &owner)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Recomputes one owner's entire tree. Counted and timed.
    pub fn full_recompute_owner(
        &self,
        txn: &mut Transaction<'_>,
        owner: &IdentityId,
    ) -> Result<(), StoreError> {
        let started = Instant::now();
        self.recompute_region(txn, owner, None)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.full_recomputes += 1;
        stats.full_recompute_ms_total += elapsed_ms;
        debug!(owner = %owner, elapsed_ms, "full score recompute");
        Ok(())
    }

    /// Recomputes every owner's tree.
    pub fn full_recompute_all(&self, txn: &mut Transaction<'_>) -> Result<(), StoreError> {
        for owner in txn.own_identity_ids() {
            self.full_recompute_owner(txn, &owner)?;
        }
        Ok(())
    }

    /// The incremental path: a change to an edge entering `changed` can
    /// only move ranks and values of `changed` and the identities reachable
    /// from it, so the two recompute passes are restricted to that region.
    fn incremental_update(
        &self,
        txn: &mut Transaction<'_>,
        owner: &IdentityId,
        changed: &IdentityId,
    ) -> Result<(), StoreError> {
        let mut region = BTreeSet::new();
        let mut stack = vec![*changed];
        while let Some(node) = stack.pop() {
            if region.insert(node) {
                for t in txn.given_trusts(&node) {
                    stack.push(*t.trustee());
                }
            }
        }
        self.recompute_region(txn, owner, Some(&region))?;
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .incremental_updates += 1;
        Ok(())
    }

    /// The shared recompute. With `region == None` this covers the whole
    /// tree; otherwise only the region, seeded with rank candidates over
    /// edges entering it from outside.
    ///
    /// Pass 1 finalizes nodes in (rank, id) order. Capacity is decided at
    /// finalization: the owner's direct trust is absolute; otherwise the
    /// trust sum over trusters already finalized with positive capacity.
    /// A non-positive sum forces capacity 0, which stops expansion.
    /// Pass 2 derives values from the fixed capacities.
    fn recompute_region(
        &self,
        txn: &mut Transaction<'_>,
        owner: &IdentityId,
        region: Option<&BTreeSet<IdentityId>>,
    ) -> Result<(), StoreError> {
        txn.own_identity(owner)?;
        let in_region = |id: &IdentityId| region.map_or(true, |r| r.contains(id));

        let mut finalized: BTreeMap<IdentityId, (u32, u8)> = BTreeMap::new();
        let mut heap: BinaryHeap<Reverse<(u32, IdentityId)>> = BinaryHeap::new();

        if in_region(owner) {
            heap.push(Reverse((OWN_RANK, *owner)));
        }
        if let Some(region) = region {
            // Rank candidates over edges entering the region. Trusters
            // outside the region keep their stored rank and capacity.
            for node in region {
                for t in txn.received_trusts(node) {
                    let truster = *t.truster();
                    if region.contains(&truster) {
                        continue;
                    }
                    let Some(s) = txn.get_score(owner, &truster) else {
                        continue;
                    };
                    if s.capacity() == 0 {
                        continue;
                    }
                    if s.rank() == OWN_RANK || t.value() >= 0 {
                        heap.push(Reverse((s.rank() + 1, *node)));
                    }
                }
            }
        }

        while let Some(Reverse((rank, node))) = heap.pop() {
            if finalized.contains_key(&node) {
                continue;
            }
            let capacity = if node == *owner {
                OWN_CAPACITY
            } else {
                let decisive: i64 = match txn.get_trust(owner, &node) {
                    Some(direct) => direct.value() as i64,
                    None => txn
                        .received_trusts(&node)
                        .iter()
                        .filter_map(|t| {
                            let truster = *t.truster();
                            let known = if in_region(&truster) {
                                finalized.get(&truster).copied()
                            } else {
                                txn.get_score(owner, &truster)
                                    .map(|s| (s.rank(), s.capacity()))
                            };
                            match known {
                                // Only trusters that finalize before this
                                // node may contribute; that keeps the
                                // decision identical between the full and
                                // the incremental pass.
                                Some((trank, tcap))
                                    if tcap > 0 && (trank, truster) < (rank, node) =>
                                {
                                    Some(t.value() as i64)
                                }
                                _ => None,
                            }
                        })
                        .sum(),
                };
                if decisive <= 0 {
                    0
                } else {
                    capacity_for_rank(&self.capacity_table, rank)
                }
            };
            finalized.insert(node, (rank, capacity));
            if capacity > 0 {
                for t in txn.given_trusts(&node) {
                    let trustee = *t.trustee();
                    if !in_region(&trustee) || finalized.contains_key(&trustee) {
                        continue;
                    }
                    if node == *owner || t.value() >= 0 {
                        heap.push(Reverse((rank + 1, trustee)));
                    }
                }
            }
        }

        // Pass 2: values from the fixed capacities.
        let mut values: BTreeMap<IdentityId, i32> = BTreeMap::new();
        for (node, _) in &finalized {
            let value = if node == owner {
                OWN_SCORE_VALUE
            } else if let Some(direct) = txn.get_trust(owner, node) {
                direct.value() as i32 * 100
            } else {
                let mut sum: i64 = 0;
                for t in txn.received_trusts(node) {
                    let truster = t.truster();
                    let cap = if in_region(truster) {
                        finalized.get(truster).map(|&(_, c)| c).unwrap_or(0)
                    } else {
                        txn.get_score(owner, truster)
                            .map(|s| s.capacity())
                            .unwrap_or(0)
                    };
                    if cap > 0 {
                        sum += t.value() as i64 * cap as i64 / 100;
                    }
                }
                sum.clamp(i32::MIN as i64, i32::MAX as i64) as i32
            };
            values.insert(*node, value);
        }

        // Write phase: upsert reached nodes, delete rows of region members
        // that are no longer reached.
        let now = txn.now_ms();
        for (node, &(rank, capacity)) in &finalized {
            let value = values[node];
            match txn.get_score(owner, node).cloned() {
                Some(mut existing) => {
                    existing.set_value(value, now);
                    existing.set_rank(rank, now);
                    existing.set_capacity(capacity, now);
                    txn.put_score(existing)?;
                }
                None => {
                    let score = Score::new(*owner, *node, value, rank, capacity, now)
                        .map_err(|e| StoreError::Internal(format!("derived score invalid: {e}")))?;
                    txn.put_score(score)?;
                }
            }
        }
        let stale: Vec<IdentityId> = match region {
            Some(region) => region
                .iter()
                .filter(|&n| !finalized.contains_key(n) && txn.get_score(owner, n).is_some())
                .cloned()
                .collect(),
            None => txn
                .scores_of_owner(owner)
                .iter()
                .map(|s| *s.trustee())
                .filter(|n| !finalized.contains_key(n))
                .collect(),
        };
        for node in stale {
            txn.delete_score(owner, &node)?;
        }
        Ok(())
    }
}
