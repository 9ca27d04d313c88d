//! Queue groups
//!
//! Members of a queue group share one cursor: every message goes to exactly
//! one member, the least recently used one with room in its window. The
//! group lock is taken before any member lock.
//!
//! A member leaving with unacknowledged messages is *retired*: it stays in
//! the group until each of its pending sequences has been handed to a
//! remaining member. When the last member of a durable group closes, it
//! stays behind as the group's *shadow* so the cursor and pending set
//! survive until a new member joins.

use std::sync::{Arc, Mutex, MutexGuard};

use super::subscription::Subscription;

pub(crate) struct QueueInner {
    /// Highest sequence dispatched to any member.
    pub last_sent: u64,
    pub members: Vec<Arc<Subscription>>,
    pub retired: Vec<Arc<Subscription>>,
    pub shadow: Option<Arc<Subscription>>,
    /// Dispatch counter feeding `SubInner::last_used`.
    pub tick: u64,
    /// Set once the group is gone from its channel. A subscriber that raced
    /// the removal must look the group up again.
    pub deleted: bool,
}

impl QueueInner {
    /// The least recently used member with room in its window.
    pub fn pick_member(&self) -> Option<Arc<Subscription>> {
        self.members
            .iter()
            .filter_map(|member| {
                let inner = member.lock();
                inner.has_capacity().then_some((inner.last_used, member))
            })
            .min_by_key(|(last_used, _)| *last_used)
            .map(|(_, member)| member.clone())
    }

    pub fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.retired.is_empty() && self.shadow.is_none()
    }
}

pub struct QueueGroup {
    pub name: String,
    pub durable_name: Option<String>,
    /// Key under which the channel indexes this group.
    pub key: String,
    inner: Mutex<QueueInner>,
}

impl QueueGroup {
    pub fn new(name: &str, durable_name: Option<&str>, last_sent: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            durable_name: durable_name.map(str::to_string),
            key: queue_key(name, durable_name),
            inner: Mutex::new(QueueInner {
                last_sent,
                members: Vec::new(),
                retired: Vec::new(),
                shadow: None,
                tick: 0,
                deleted: false,
            }),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_sent(&self) -> u64 {
        self.lock().last_sent
    }
}

impl std::fmt::Debug for QueueGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueGroup")
            .field("name", &self.name)
            .field("durable_name", &self.durable_name)
            .finish()
    }
}

/// Durable queue groups are keyed by durable name and group name, so a
/// durable and a non-durable group with the same name never mix.
pub(crate) fn queue_key(group: &str, durable_name: Option<&str>) -> String {
    match durable_name {
        Some(durable) => format!("{durable}:{group}"),
        None => group.to_string(),
    }
}
