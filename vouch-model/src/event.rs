//! Change events
//!
//! Every committed mutation of an identity, trust or score produces a
//! change event carrying deep clones of the entity before and after the
//! change. Exactly one side is absent for creations and deletions.

use crate::identity::Identity;
use crate::score::Score;
use crate::trust::Trust;
use serde::{Deserialize, Serialize};

/// The kinds of entity a client can subscribe to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum EventKind {
    Identities,
    Trusts,
    Scores,
}

/// A committed change to one entity.
///
/// `old` is absent for creations, `new` is absent for deletions; both are
/// present (with equal id) for modifications. Entities are clones: the
/// store never hands out its internal objects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    Identity {
        old: Option<Identity>,
        new: Option<Identity>,
    },
    Trust {
        old: Option<Trust>,
        new: Option<Trust>,
    },
    Score {
        old: Option<Score>,
        new: Option<Score>,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Identity { .. } => EventKind::Identities,
            ChangeEvent::Trust { .. } => EventKind::Trusts,
            ChangeEvent::Score { .. } => EventKind::Scores,
        }
    }

    /// Whether both sides are absent, which would be a meaningless event.
    pub fn is_empty(&self) -> bool {
        match self {
            ChangeEvent::Identity { old, new } => old.is_none() && new.is_none(),
            ChangeEvent::Trust { old, new } => old.is_none() && new.is_none(),
            ChangeEvent::Score { old, new } => old.is_none() && new.is_none(),
        }
    }
}
