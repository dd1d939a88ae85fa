//! Wire messages
//!
//! Serde-tagged request and reply types exchanged with remote clients.
//! The tag field `message` names the message kind; entity payloads are
//! the serialized entities themselves.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vouch_core::{Notification, NotificationPayload};
use vouch_model::{ChangeEvent, EventKind, Identity, IdentityId, Score, Trust};

/// Messages a client sends to the kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum Request {
    Subscribe {
        to: EventKind,
    },
    Unsubscribe {
        subscription: Uuid,
    },
    GetIdentity {
        identity: IdentityId,
    },
    GetTrust {
        truster: IdentityId,
        trustee: IdentityId,
    },
    GetScore {
        owner: IdentityId,
        trustee: IdentityId,
    },
}

/// Messages the kernel sends to a client: direct replies and event
/// deliveries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum Message {
    Subscribed {
        subscription: Uuid,
    },
    Unsubscribed,
    UnknownSubscription {
        subscription: Uuid,
    },
    Identity {
        identity: Identity,
    },
    Trust {
        trust: Trust,
    },
    Score {
        score: Score,
    },
    UnknownIdentity {
        identity: IdentityId,
    },
    NotTrusted {
        truster: IdentityId,
        trustee: IdentityId,
    },
    NotInTrustTree {
        owner: IdentityId,
        trustee: IdentityId,
    },
    Error {
        description: String,
    },
    BeginSync {
        version_id: Uuid,
        amount: u64,
    },
    EndSync {
        version_id: Uuid,
    },
    IdentityChanged {
        old: Option<Identity>,
        new: Option<Identity>,
    },
    TrustChanged {
        old: Option<Trust>,
        new: Option<Trust>,
    },
    ScoreChanged {
        old: Option<Score>,
        new: Option<Score>,
    },
}

impl Message {
    /// Translates a queued notification into its wire form.
    pub fn from_notification(notification: &Notification) -> Self {
        match &notification.payload {
            NotificationPayload::BeginSync { version_id, amount } => Message::BeginSync {
                version_id: *version_id,
                amount: *amount,
            },
            NotificationPayload::EndSync { version_id } => Message::EndSync {
                version_id: *version_id,
            },
            NotificationPayload::ObjectChanged(event) => match event.clone() {
                ChangeEvent::Identity { old, new } => Message::IdentityChanged { old, new },
                ChangeEvent::Trust { old, new } => Message::TrustChanged { old, new },
                ChangeEvent::Score { old, new } => Message::ScoreChanged { old, new },
            },
        }
    }
}
