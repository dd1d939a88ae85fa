//! Request handling
//!
//! Bridges client requests to kernel operations. Replies go back through
//! the client's reply sender; subscription event streams are delivered by
//! the subscription engine over the same sender.

use crate::messages::{Message, Request};
use crate::transport::{ReplySender, RpcTransport};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use vouch_core::{ClientKind, Kernel};

pub struct RpcHandler {
    kernel: Arc<Kernel>,
}

impl RpcHandler {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Handles one request from the client identified by `client`.
    ///
    /// For `Subscribe`, the initial synchronization is deployed to the
    /// subscribing client inline, so its replies arrive in order:
    /// BeginSync (announcing the entity count), one ObjectChanged per
    /// entity, EndSync, then the Subscribed confirmation. Later changes
    /// arrive through the deployment job.
    pub async fn handle(&self, client: Uuid, sender: &Arc<dyn ReplySender>, request: Request) {
        let reply = match request {
            Request::Subscribe { to } => {
                let transport = Arc::new(RpcTransport::new(sender.clone()));
                match self
                    .kernel
                    .subscriptions()
                    .subscribe(client, ClientKind::Rpc, to, transport)
                {
                    Ok(subscription) => {
                        self.kernel.subscriptions().deploy_client(client).await;
                        Message::Subscribed { subscription }
                    }
                    Err(e) => Message::Error {
                        description: e.to_string(),
                    },
                }
            }
            Request::Unsubscribe { subscription } => {
                match self.kernel.subscriptions().unsubscribe(subscription) {
                    Ok(()) => Message::Unsubscribed,
                    Err(_) => Message::UnknownSubscription { subscription },
                }
            }
            Request::GetIdentity { identity } => match self.kernel.identity(&identity) {
                Ok(identity) => Message::Identity { identity },
                Err(_) => Message::UnknownIdentity { identity },
            },
            Request::GetTrust { truster, trustee } => match self.kernel.trust(&truster, &trustee) {
                Ok(trust) => Message::Trust { trust },
                Err(_) => Message::NotTrusted { truster, trustee },
            },
            Request::GetScore { owner, trustee } => match self.kernel.score(&owner, &trustee) {
                Ok(score) => Message::Score { score },
                Err(_) => Message::NotInTrustTree { owner, trustee },
            },
        };
        if let Err(e) = sender.send(&reply) {
            debug!(client = %client, error = %e, "dropping reply to unreachable client");
        }
    }
}
