//! Replicated operations, snapshots and control messages
//!
//! Everything here is serialized with `serde_json`: a [`LogEntry`] is the
//! payload of one consensus log entry, a [`ServerSnapshot`] the payload of a
//! snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::broker::message::{Message, SubscriptionInfo, SubscriptionRequest};
use crate::broker::subscription::SubscriptionSnapshot;
use crate::client::ClientInfo;
use crate::utils::Result;

/// One state mutation, applied identically on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicatedOp {
    Connect {
        client_id: String,
        /// Registration time stamped by the proposer.
        connected_at: i64,
    },
    Disconnect {
        client_id: String,
    },
    /// Unsequenced messages; each node assigns sequences at apply time.
    PublishBatch {
        messages: Vec<Message>,
    },
    Subscribe {
        request: SubscriptionRequest,
    },
    RemoveSubscription {
        channel: String,
        sub_id: u64,
    },
    CloseSubscription {
        channel: String,
        sub_id: u64,
    },
    /// Sequences the leader sent to, and received acks from, one subscription.
    SendAndAck {
        channel: String,
        sub_id: u64,
        sent: Vec<u64>,
        acked: Vec<u64>,
    },
    DeleteChannel {
        channel: String,
    },
}

impl ReplicatedOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::PublishBatch { .. } => "publish_batch",
            Self::Subscribe { .. } => "subscribe",
            Self::RemoveSubscription { .. } => "remove_subscription",
            Self::CloseSubscription { .. } => "close_subscription",
            Self::SendAndAck { .. } => "send_and_ack",
            Self::DeleteChannel { .. } => "delete_channel",
        }
    }

    /// Folds `next` into `self` when both can be committed as one entry
    /// without changing the outcome. Returns `next` back otherwise.
    pub fn merge(&mut self, next: ReplicatedOp) -> std::result::Result<(), ReplicatedOp> {
        match (self, next) {
            (Self::PublishBatch { messages }, Self::PublishBatch { messages: more }) => {
                messages.extend(more);
                Ok(())
            }
            (
                Self::SendAndAck {
                    channel,
                    sub_id,
                    sent,
                    acked,
                },
                Self::SendAndAck {
                    channel: next_channel,
                    sub_id: next_sub,
                    sent: more_sent,
                    acked: more_acked,
                },
            ) if *channel == next_channel && *sub_id == next_sub => {
                sent.extend(more_sent);
                acked.extend(more_acked);
                Ok(())
            }
            (_, next) => Err(next),
        }
    }
}

/// Payload of one consensus log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Node that proposed the entry.
    pub origin: String,
    pub op: ReplicatedOp,
}

impl LogEntry {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Result of applying one entry on the local state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResponse {
    Done,
    /// The entry was at or below the last applied index.
    Skipped,
    /// Sequences assigned to a `PublishBatch`, in message order.
    Published(Vec<u64>),
    Subscribed(SubscriptionInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub first: u64,
    pub last: u64,
    pub next_sub_id: u64,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

/// Full replicated state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub last_applied: u64,
    pub clients: Vec<ClientInfo>,
    pub channels: Vec<ChannelSnapshot>,
}

impl ServerSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Heartbeat,
    PartitionCheck,
    /// Sent by old servers. Decoded and ignored.
    #[deprecated(note = "use Heartbeat")]
    LegacyPing,
}

/// A message exchanged between cluster members outside the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub kind: ControlKind,
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<u8>>,
}

impl ControlMessage {
    pub fn heartbeat(server_id: &str) -> Self {
        Self {
            kind: ControlKind::Heartbeat,
            server_id: server_id.to_string(),
            context: None,
        }
    }

    pub fn partition_check(server_id: &str, context: Vec<u8>) -> Self {
        Self {
            kind: ControlKind::PartitionCheck,
            server_id: server_id.to_string(),
            context: Some(context),
        }
    }

    /// Our own message looping back through the transport.
    pub fn is_own(&self, server_id: &str) -> bool {
        self.server_id == server_id
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Heartbeat-based liveness of the other cluster members.
#[derive(Debug)]
pub struct Heartbeats {
    server_id: String,
    timeout: Duration,
    last_seen: HashMap<String, Instant>,
}

impl Heartbeats {
    pub fn new(server_id: &str, timeout: Duration) -> Self {
        Self {
            server_id: server_id.to_string(),
            timeout,
            last_seen: HashMap::new(),
        }
    }

    /// Records a control message. Returns `false` for messages that carry no
    /// liveness information: our own, and deprecated kinds.
    #[allow(deprecated)]
    pub fn observe(&mut self, msg: &ControlMessage, now: Instant) -> bool {
        if msg.is_own(&self.server_id) {
            return false;
        }
        match msg.kind {
            ControlKind::Heartbeat | ControlKind::PartitionCheck => {
                self.last_seen.insert(msg.server_id.clone(), now);
                true
            }
            ControlKind::LegacyPing => false,
        }
    }

    pub fn is_alive(&self, server_id: &str, now: Instant) -> bool {
        self.last_seen
            .get(server_id)
            .is_some_and(|seen| now.saturating_duration_since(*seen) <= self.timeout)
    }

    /// Servers heard from within the timeout, sorted.
    pub fn alive(&self, now: Instant) -> Vec<String> {
        let mut alive: Vec<String> = self
            .last_seen
            .keys()
            .filter(|id| self.is_alive(id, now))
            .cloned()
            .collect();
        alive.sort();
        alive
    }
}
