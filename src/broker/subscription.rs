//! Subscription state machine
//!
//! A `Subscription` is one delivery cursor on a channel: the persisted
//! [`SubState`] (`last_sent`, window, ack wait, durable/closed flags), the
//! set of sent-but-unacknowledged sequences with their redelivery deadlines,
//! and the handle of the redelivery timer task.
//!
//! States:
//!
//! ```text
//! Active --window full--> Stalled --ack--> Active
//! Active/Stalled --close (durable)--> Closed --unsubscribe--> Removed
//! any --close (non-durable) / unsubscribe--> Removed
//! ```
//!
//! Everything in [`SubInner`] is mutated under the subscription lock: the
//! delivery scan, the ack handler and the redelivery timer all take it, so
//! `pending.len() <= max_in_flight` holds at every observable instant and a
//! sequence is never delivered on two threads at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::persistence::SubState;

/// A sent, unacknowledged sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAck {
    pub deadline: Instant,
    pub redeliveries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    Active,
    /// Window full: `pending == max_in_flight`.
    Stalled,
    /// Durable, not delivering, cursor retained.
    Closed,
    Removed,
}

/// Point-in-time view of a subscription: persisted state plus pending set.
///
/// This is also the per-subscription record of a replication snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub state: SubState,
    pub pending: Vec<u64>,
}

pub(crate) struct SubInner {
    pub state: SubState,
    pub pending: BTreeMap<u64, PendingAck>,
    pub removed: bool,
    /// Armed redelivery timer and the deadline it fires at.
    pub timer: Option<(Instant, JoinHandle<()>)>,
    /// Dispatch tick of the last delivery, for least-recently-used queue dispatch.
    pub last_used: u64,
}

impl SubInner {
    pub fn has_capacity(&self) -> bool {
        !self.removed && !self.state.is_closed && self.pending.len() < self.state.max_in_flight
    }

    pub fn status(&self) -> SubStatus {
        if self.removed {
            SubStatus::Removed
        } else if self.state.is_closed {
            SubStatus::Closed
        } else if self.pending.len() >= self.state.max_in_flight {
            SubStatus::Stalled
        } else {
            SubStatus::Active
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn cancel_timer(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
    }

    /// Give every pending sequence a fresh deadline of `now + ack_wait`.
    pub fn reset_deadlines(&mut self, now: Instant) {
        let deadline = now + self.state.ack_wait();
        for pending in self.pending.values_mut() {
            pending.deadline = deadline;
        }
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            state: self.state.clone(),
            pending: self.pending.keys().copied().collect(),
        }
    }
}

/// One delivery cursor on a channel.
pub struct Subscription {
    pub id: u64,
    pub channel: String,
    inner: Mutex<SubInner>,
}

impl Subscription {
    /// Builds a subscription from persisted state. Recovered pending
    /// sequences are due at `now + ack_wait`.
    pub fn new(state: SubState, pending: impl IntoIterator<Item = u64>) -> Arc<Self> {
        let deadline = Instant::now() + state.ack_wait();
        let pending = pending
            .into_iter()
            .map(|seq| {
                (
                    seq,
                    PendingAck {
                        deadline,
                        redeliveries: 0,
                    },
                )
            })
            .collect();
        Arc::new(Self {
            id: state.id,
            channel: state.channel.clone(),
            inner: Mutex::new(SubInner {
                state,
                pending,
                removed: false,
                timer: None,
                last_used: 0,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SubInner> {
        // A panic mid-update cannot leave the map half-written, keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.lock().snapshot()
    }

    pub fn status(&self) -> SubStatus {
        self.lock().status()
    }

    pub fn client_id(&self) -> String {
        self.lock().state.client_id.clone()
    }

    pub fn is_durable(&self) -> bool {
        self.lock().state.is_durable
    }

    /// Stop the timer and mark the subscription removed so in-flight
    /// deliveries and timers become no-ops.
    pub(crate) fn mark_removed(&self) {
        let mut inner = self.lock();
        inner.removed = true;
        inner.cancel_timer();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Durable key of a non-queue durable: bound to the owning client.
pub(crate) fn durable_key(client_id: &str, durable_name: &str) -> String {
    format!("{client_id}:{durable_name}")
}
