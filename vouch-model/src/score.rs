//! Scores
//!
//! A score is the derived opinion of one own identity (the tree owner)
//! about a target identity: a signed value, the rank (hop distance from
//! the owner), and the capacity with which the target's own trusts are
//! weighted during propagation. Scores exist only for identities reachable
//! in the owner's trust tree and are written by nothing but the score
//! engine.

use crate::error::ValidationError;
use crate::types::IdentityId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capacity by rank. Ranks beyond the table have capacity 0.
pub const DEFAULT_CAPACITY_TABLE: [u8; 6] = [100, 40, 16, 6, 2, 1];

/// Sentinel score value of an own identity about itself.
pub const OWN_SCORE_VALUE: i32 = i32::MAX;

/// Rank of an own identity in its own tree.
pub const OWN_RANK: u32 = 0;

/// Capacity of an own identity in its own tree.
pub const OWN_CAPACITY: u8 = 100;

/// Looks up the capacity for a rank in the given table.
pub fn capacity_for_rank(table: &[u8; 6], rank: u32) -> u8 {
    table.get(rank as usize).copied().unwrap_or(0)
}

/// The derived (owner, target) reputation tuple.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Score {
    owner: IdentityId,
    trustee: IdentityId,
    value: i32,
    rank: u32,
    capacity: u8,
    created_ms: u64,
    last_changed_ms: u64,
    version_id: Uuid,
}

impl Score {
    pub fn new(
        owner: IdentityId,
        trustee: IdentityId,
        value: i32,
        rank: u32,
        capacity: u8,
        now_ms: u64,
    ) -> Result<Self, ValidationError> {
        if !DEFAULT_CAPACITY_TABLE.contains(&capacity) && capacity != 0 {
            return Err(ValidationError::InvalidCapacity(capacity));
        }
        if rank == OWN_RANK && owner != trustee {
            return Err(ValidationError::RankCapacityMismatch(rank, capacity));
        }
        Ok(Self {
            owner,
            trustee,
            value,
            rank,
            capacity,
            created_ms: now_ms,
            last_changed_ms: now_ms,
            version_id: Uuid::new_v4(),
        })
    }

    pub fn owner(&self) -> &IdentityId {
        &self.owner
    }

    pub fn trustee(&self) -> &IdentityId {
        &self.trustee
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn last_changed_ms(&self) -> u64 {
        self.last_changed_ms
    }

    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn set_value(&mut self, value: i32, now_ms: u64) {
        if self.value != value {
            self.value = value;
            self.last_changed_ms = now_ms;
        }
    }

    pub fn set_rank(&mut self, rank: u32, now_ms: u64) {
        if self.rank != rank {
            self.rank = rank;
            self.last_changed_ms = now_ms;
        }
    }

    pub fn set_capacity(&mut self, capacity: u8, now_ms: u64) {
        if self.capacity != capacity {
            self.capacity = capacity;
            self.last_changed_ms = now_ms;
        }
    }

    pub fn set_version_id(&mut self, version_id: Uuid) {
        self.version_id = version_id;
    }
}

/// Domain equality: compares all attributes except timestamps and the
/// version id.
impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
            && self.trustee == other.trustee
            && self.value == other.value
            && self.rank == other.rank
            && self.capacity == other.capacity
    }
}

impl Eq for Score {}
