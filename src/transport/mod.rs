//! The `transport` module is the broker's boundary toward the underlying
//! pub/sub layer and toward clients.
//!
//! - [`Transport`] is how the delivery engine hands a message to a
//!   subscriber's inbox. A failed send leaves the sequence pending, so the
//!   redelivery timer retries it.
//! - [`LocalTransport`] routes inboxes to in-process channels.
//! - `websocket` implements the client-facing WebSocket server, translating
//!   JSON protocol messages (`message`) into broker operations.

pub mod message;
pub mod websocket;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::broker::message::MsgDelivery;
use crate::utils::{BrokerError, Result};

/// Delivers messages to subscriber inboxes.
pub trait Transport: Send + Sync {
    fn send(&self, inbox: &str, delivery: &MsgDelivery) -> Result<()>;
}

/// Inbox name -> in-process receiver.
#[derive(Debug, Default)]
pub struct LocalTransport {
    inboxes: Mutex<HashMap<String, UnboundedSender<MsgDelivery>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UnboundedSender<MsgDelivery>>> {
        self.inboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates (or replaces) an inbox and returns its receiving end.
    pub fn register(&self, inbox: &str) -> UnboundedReceiver<MsgDelivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(inbox.to_string(), tx);
        rx
    }

    pub fn unregister(&self, inbox: &str) {
        self.lock().remove(inbox);
    }
}

impl Transport for LocalTransport {
    fn send(&self, inbox: &str, delivery: &MsgDelivery) -> Result<()> {
        let inboxes = self.lock();
        let sender = inboxes
            .get(inbox)
            .ok_or_else(|| BrokerError::Transport(format!("no route to inbox `{inbox}`")))?;
        sender
            .send(delivery.clone())
            .map_err(|_| BrokerError::Transport(format!("inbox `{inbox}` is closed")))
    }
}
