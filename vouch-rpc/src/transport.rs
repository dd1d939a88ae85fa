//! Reply-sender port and the notification transport adapter
//!
//! A [`ReplySender`] is the kernel's view of one connected client: a
//! synchronous send whose return value is the client's acknowledgement.
//! [`RpcTransport`] adapts a reply sender to the subscription engine's
//! notification transport by translating notifications into wire
//! messages.

use crate::messages::Message;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;
use vouch_core::{Notification, NotificationTransport, TransportError};

/// Delivery port for one client connection. `send` blocks until the
/// client has processed the message and reports the outcome.
pub trait ReplySender: Send + Sync {
    fn send(&self, message: &Message) -> Result<(), TransportError>;
}

/// Notification transport over a reply sender.
pub struct RpcTransport {
    sender: Arc<dyn ReplySender>,
}

impl RpcTransport {
    pub fn new(sender: Arc<dyn ReplySender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl NotificationTransport for RpcTransport {
    async fn send(&self, _client: Uuid, notification: &Notification) -> Result<(), TransportError> {
        self.sender.send(&Message::from_notification(notification))
    }
}
