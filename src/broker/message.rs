//! Message definitions for the broker
//!
//! `Message` is the canonical stored representation: once a channel assigns
//! it a sequence and the store accepts it, it is never mutated. `MsgDelivery`
//! is what a subscriber's inbox receives, and `SubscriptionRequest` is the
//! client-facing subscribe call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A message stored in a channel's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Per-channel sequence, assigned at store time. `0` means "not assigned yet".
    pub sequence: u64,
    pub channel: String,
    pub payload: Vec<u8>,
    /// Milliseconds since UNIX epoch.
    pub timestamp: i64,
    /// Replicated log entry that published this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<LogPosition>,
}

/// Index of a replicated log entry and the message's offset in its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub index: u64,
    pub offset: u32,
}

impl Message {
    /// Build an unsequenced message stamped with the current time.
    pub fn new(channel: &str, payload: Vec<u8>) -> Self {
        Self {
            sequence: 0,
            channel: channel.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            position: None,
        }
    }
}

/// A message as handed to a subscriber's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDelivery {
    pub subscription_id: u64,
    pub channel: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub timestamp: i64,
    pub redelivered: bool,
    /// Number of redeliveries so far; `0` on the first delivery.
    pub redelivery_count: u32,
}

impl MsgDelivery {
    pub fn new(subscription_id: u64, msg: &Message, redelivery_count: u32) -> Self {
        Self {
            subscription_id,
            channel: msg.channel.clone(),
            sequence: msg.sequence,
            payload: msg.payload.clone(),
            timestamp: msg.timestamp,
            redelivered: redelivery_count > 0,
            redelivery_count,
        }
    }
}

/// Where a new subscription starts in the channel log.
///
/// Ignored when a durable subscription re-binds or a member joins an
/// existing queue group: those resume from the persisted cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StartPosition {
    /// Only messages published after the subscription is created.
    #[default]
    NewOnly,
    /// The last stored message, then everything after it.
    LastReceived,
    /// Messages stored within the given delta before now.
    TimeDeltaStart(#[serde(with = "duration_ms")] Duration),
    /// Messages stored at or after the given millisecond timestamp.
    ///
    /// `TimeDeltaStart` is resolved into this before replication so every
    /// node computes the same starting sequence.
    AtTime(i64),
    /// Start at the given sequence.
    SequenceStart(u64),
    /// Everything still available in the channel.
    First,
}

/// Client-facing subscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub client_id: String,
    pub channel: String,
    /// Delivery target on the underlying transport.
    pub inbox: String,
    pub durable_name: Option<String>,
    pub queue_group: Option<String>,
    pub max_in_flight: usize,
    pub ack_wait_ms: u64,
    #[serde(default)]
    pub start: StartPosition,
}

impl SubscriptionRequest {
    /// A plain subscription with the given window and a 30s ack wait.
    pub fn new(client_id: &str, channel: &str, inbox: &str, max_in_flight: usize) -> Self {
        Self {
            client_id: client_id.to_string(),
            channel: channel.to_string(),
            inbox: inbox.to_string(),
            durable_name: None,
            queue_group: None,
            max_in_flight,
            ack_wait_ms: 30_000,
            start: StartPosition::NewOnly,
        }
    }

    pub fn durable(mut self, name: &str) -> Self {
        self.durable_name = Some(name.to_string());
        self
    }

    pub fn queue(mut self, group: &str) -> Self {
        self.queue_group = Some(group.to_string());
        self
    }

    pub fn start_at(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait_ms = ack_wait.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> crate::utils::Result<()> {
        use crate::utils::BrokerError;
        if self.channel.is_empty() {
            return Err(BrokerError::InvalidRequest("empty channel name".into()));
        }
        if self.inbox.is_empty() {
            return Err(BrokerError::InvalidRequest("empty inbox".into()));
        }
        if self.max_in_flight == 0 {
            return Err(BrokerError::InvalidRequest("max_in_flight must be > 0".into()));
        }
        if self.ack_wait_ms == 0 {
            return Err(BrokerError::InvalidRequest("ack_wait must be > 0".into()));
        }
        if matches!(self.durable_name.as_deref(), Some("")) {
            return Err(BrokerError::InvalidRequest("empty durable name".into()));
        }
        if matches!(self.queue_group.as_deref(), Some("")) {
            return Err(BrokerError::InvalidRequest("empty queue group".into()));
        }
        Ok(())
    }
}

/// Returned to the subscriber once its subscription is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: u64,
    pub channel: String,
    pub inbox: String,
    pub durable_name: Option<String>,
    pub queue_group: Option<String>,
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
