//! The `persistence` module defines the contract a storage backend must
//! satisfy and ships two backends.
//!
//! A backend stores, per channel, an append-only message log ([`MsgStore`])
//! and the subscription records bound to it ([`SubStore`]), plus the set of
//! connected clients. On startup the broker rebuilds every channel,
//! subscription and client from [`Store::recover`].
//!
//! Every call may block the calling thread (a SQL backend would do a network
//! round trip, `sled` may fsync). The delivery engine never assumes a call
//! completes inline with anything else: sequence assignment is serialized by
//! the channel, and subscription mutations by the subscription's own lock.
//!
//! - [`MemoryStore`] keeps everything in memory; a broker built on the same
//!   `Arc<MemoryStore>` after a restart recovers the full state.
//! - [`SledStore`] keeps everything in an embedded `sled` database.

pub mod memory_store;
pub mod sled_store;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::message::{Message, SubscriptionRequest};
use crate::client::ClientInfo;
use crate::utils::Result;

pub use memory_store::MemoryStore;
pub use sled_store::SledStore;

/// Per-channel retention, applied when a message is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreLimits {
    /// Maximum number of messages kept per channel. `0` means unlimited.
    pub max_msgs: usize,
    /// Messages older than this are evicted.
    pub max_age: Option<Duration>,
}

/// Persisted state of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubState {
    pub id: u64,
    pub channel: String,
    pub client_id: String,
    pub inbox: String,
    pub durable_name: Option<String>,
    pub queue_group: Option<String>,
    pub max_in_flight: usize,
    pub ack_wait_ms: u64,
    /// Highest sequence ever sent to this subscription. Never decreases.
    pub last_sent: u64,
    pub is_durable: bool,
    pub is_closed: bool,
    /// Replicated log entry that last created or re-bound this subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_index: Option<u64>,
}

impl SubState {
    pub fn from_request(id: u64, req: &SubscriptionRequest, last_sent: u64) -> Self {
        Self {
            id,
            channel: req.channel.clone(),
            client_id: req.client_id.clone(),
            inbox: req.inbox.clone(),
            durable_name: req.durable_name.clone(),
            queue_group: req.queue_group.clone(),
            max_in_flight: req.max_in_flight,
            ack_wait_ms: req.ack_wait_ms,
            last_sent,
            is_durable: req.durable_name.is_some(),
            is_closed: false,
            log_index: None,
        }
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

/// Append-only message log of one channel.
pub trait MsgStore: Send + Sync {
    /// Durably append `msg` at `msg.sequence` and return the stored sequence.
    ///
    /// Fails if the sequence is not greater than the last stored one.
    fn store(&self, msg: &Message) -> Result<u64>;

    /// The message at `seq`, or `None` if it was never stored or was evicted.
    fn lookup(&self, seq: u64) -> Result<Option<Message>>;

    /// First available sequence. When the log is empty this is `last + 1`.
    fn first_sequence(&self) -> Result<u64>;

    /// Last stored sequence, `0` when nothing was ever stored.
    fn last_sequence(&self) -> Result<u64>;

    /// First sequence whose timestamp is at or after `timestamp` (ms), or
    /// `last + 1` when every message is older.
    fn get_sequence_from_timestamp(&self, timestamp: i64) -> Result<u64>;

    /// Drop every message. The next stored sequence may be anything greater
    /// than zero.
    fn empty(&self) -> Result<()>;

    /// On an empty log, declare that the log starts at `seq`: `first` becomes
    /// `seq` and `last` becomes `seq - 1`. Ignored when messages are stored.
    fn set_first_sequence(&self, seq: u64) -> Result<()>;
}

/// Subscription records of one channel.
pub trait SubStore: Send + Sync {
    fn create_sub(&self, state: &SubState) -> Result<()>;

    /// Overwrite the stored record. The pending set is not touched.
    fn update_sub(&self, state: &SubState) -> Result<()>;

    /// Delete the record and its pending set.
    fn delete_sub(&self, sub_id: u64) -> Result<()>;

    /// Record `seq` as sent and unacknowledged. Raises the persisted
    /// `last_sent` to `seq` if it is greater.
    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<()>;

    /// Remove `seq` from the pending set. Unknown sequences are ignored.
    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<()>;
}

/// Store handles of one channel.
#[derive(Clone)]
pub struct ChannelStore {
    pub msgs: Arc<dyn MsgStore>,
    pub subs: Arc<dyn SubStore>,
}

impl std::fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStore")
            .field("msgs", &"dyn MsgStore")
            .field("subs", &"dyn SubStore")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveredSubscription {
    pub state: SubState,
    pub pending: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
pub struct RecoveredChannel {
    pub name: String,
    pub store: ChannelStore,
    pub subscriptions: Vec<RecoveredSubscription>,
}

/// Everything a store knows, as returned by [`Store::recover`].
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub clients: Vec<ClientInfo>,
    pub channels: Vec<RecoveredChannel>,
}

/// A persistence backend.
pub trait Store: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Create the storage of a new channel.
    fn create_channel(&self, name: &str) -> Result<ChannelStore>;

    /// Delete a channel with its messages and subscriptions.
    fn delete_channel(&self, name: &str) -> Result<()>;

    fn add_client(&self, info: &ClientInfo) -> Result<()>;

    fn delete_client(&self, client_id: &str) -> Result<()>;

    /// Full state, or `None` when the store has never been written to.
    fn recover(&self) -> Result<Option<RecoveredState>>;

    /// Index of the last replicated log entry whose effects are stored.
    fn last_applied_index(&self) -> Result<u64>;

    fn set_last_applied_index(&self, index: u64) -> Result<()>;
}

#[cfg(test)]
mod tests;
