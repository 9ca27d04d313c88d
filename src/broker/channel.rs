//! Channels
//!
//! A channel owns its store handles, assigns sequences and indexes the
//! subscriptions bound to it.
//!
//! Lock order inside a channel: queue group -> subscription. The `subs`
//! index lock and the publish lock are leaves: nothing else is locked while
//! they are held.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;

use tracing::warn;

use super::message::{LogPosition, Message, StartPosition};
use super::queue::QueueGroup;
use super::subscription::Subscription;
use crate::persistence::{ChannelStore, Store};
use crate::utils::{BrokerError, Result};

/// Upper bound on the time `Channel::lookup` spends sleeping between retries.
pub const LOOKUP_RETRY_BUDGET: Duration = Duration::from_millis(500);

/// A subscription together with the queue group it belongs to, if any.
#[derive(Debug, Clone)]
pub(crate) struct SubEntry {
    pub sub: Arc<Subscription>,
    pub group: Option<Arc<QueueGroup>>,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelSubs {
    /// Every subscription record of the channel, including closed durables,
    /// retired queue members and queue shadows.
    pub index: BTreeMap<u64, SubEntry>,
    /// Durable key -> subscription id, non-queue durables only.
    pub durables: HashMap<String, u64>,
    /// Queue key -> group.
    pub queues: BTreeMap<String, Arc<QueueGroup>>,
}

/// A named, ordered message log with its subscriptions.
pub struct Channel {
    pub name: String,
    store: ChannelStore,
    publish_lock: Mutex<()>,
    last_seq: AtomicU64,
    next_sub_id: AtomicU64,
    subs: Mutex<ChannelSubs>,
}

impl Channel {
    pub fn new(name: &str, store: ChannelStore) -> Result<Self> {
        let last = store.msgs.last_sequence()?;
        Ok(Self {
            name: name.to_string(),
            store,
            publish_lock: Mutex::new(()),
            last_seq: AtomicU64::new(last),
            next_sub_id: AtomicU64::new(1),
            subs: Mutex::new(ChannelSubs::default()),
        })
    }

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    /// Highest sequence assigned on this channel.
    pub fn last_sequence(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub fn first_sequence(&self) -> Result<u64> {
        self.store.msgs.first_sequence()
    }

    /// Assigns the next sequence to `msg` and stores it.
    ///
    /// Sequence assignment and the store call happen under the publish lock,
    /// so sequences are gap-free in assignment order. The cursor only moves
    /// once the store accepted the message.
    pub fn append(&self, mut msg: Message) -> Result<u64> {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        let seq = self.last_sequence() + 1;
        msg.sequence = seq;
        msg.channel = self.name.clone();
        let stored = self.store.msgs.store(&msg)?;
        if stored != seq {
            warn!(
                "{}",
                BrokerError::SequenceGap {
                    channel: self.name.clone(),
                    expected: seq,
                    got: stored,
                }
            );
        }
        self.last_seq.store(seq.max(stored), Ordering::Release);
        Ok(seq)
    }

    /// Looks up `seq`, retrying failed store calls with a doubling backoff.
    ///
    /// The backoff sleeps on the calling thread, which may hold subscription
    /// or queue locks. Sleeping stops once `LOOKUP_RETRY_BUDGET` is spent,
    /// whatever `retries` says.
    pub fn lookup(&self, seq: u64, retries: u32) -> Result<Option<Message>> {
        let mut delay = Duration::from_millis(10);
        let mut slept = Duration::ZERO;
        let mut attempt = 0;
        loop {
            match self.store.msgs.lookup(seq) {
                Ok(found) => return Ok(found),
                Err(err) if attempt < retries && slept < LOOKUP_RETRY_BUDGET => {
                    warn!(channel = %self.name, seq, attempt, error = %err, "message lookup failed, retrying");
                    let pause = delay.min(LOOKUP_RETRY_BUDGET - slept);
                    thread::sleep(pause);
                    slept += pause;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sequence of the stored message published at `position`.
    ///
    /// Positions only grow along a channel's log, so the walk stops at the
    /// first message tagged before `position`'s entry.
    pub fn find_position(&self, position: LogPosition) -> Result<Option<u64>> {
        let first = self.first_sequence()?;
        let mut seq = self.last_sequence();
        while seq >= first && seq > 0 {
            let Some(msg) = self.store.msgs.lookup(seq)? else {
                seq -= 1;
                continue;
            };
            match msg.position {
                Some(found) if found == position => return Ok(Some(seq)),
                Some(found) if found.index >= position.index => seq -= 1,
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Next sequence to deliver after `last_sent`, skipping evicted messages.
    pub fn next_after(&self, last_sent: u64) -> Result<Option<u64>> {
        let last = self.last_sequence();
        if last_sent >= last {
            return Ok(None);
        }
        let next = (last_sent + 1).max(self.first_sequence()?);
        Ok((next <= last).then_some(next))
    }

    /// The `last_sent` cursor a new subscription starts from.
    pub fn start_cursor(&self, start: StartPosition) -> Result<u64> {
        let last = self.last_sequence();
        let cursor = match start {
            StartPosition::NewOnly => last,
            StartPosition::LastReceived => last.saturating_sub(1),
            StartPosition::First => self.first_sequence()?.saturating_sub(1),
            StartPosition::SequenceStart(seq) => {
                let first = self.first_sequence()?;
                seq.max(first).min(last + 1) - 1
            }
            StartPosition::AtTime(ts) => self
                .store
                .msgs
                .get_sequence_from_timestamp(ts)?
                .saturating_sub(1),
            StartPosition::TimeDeltaStart(delta) => {
                let ts = chrono::Utc::now().timestamp_millis() - delta.as_millis() as i64;
                self.store
                    .msgs
                    .get_sequence_from_timestamp(ts)?
                    .saturating_sub(1)
            }
        };
        Ok(cursor.min(last))
    }

    pub fn allocate_sub_id(&self) -> u64 {
        self.next_sub_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_sub_id(&self) -> u64 {
        self.next_sub_id.load(Ordering::Acquire)
    }

    /// Makes sure ids handed out later are above `id`.
    pub fn reserve_sub_id(&self, id: u64) {
        self.next_sub_id.fetch_max(id + 1, Ordering::AcqRel);
    }

    /// Raises the sequence cursor, for a channel restored with trailing
    /// messages missing from the log.
    pub fn restore_last_sequence(&self, last: u64) {
        self.last_seq.fetch_max(last, Ordering::AcqRel);
    }

    pub(crate) fn subs(&self) -> MutexGuard<'_, ChannelSubs> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn find(&self, sub_id: u64) -> Option<SubEntry> {
        self.subs().index.get(&sub_id).cloned()
    }

    /// Delivery targets: non-queue subscriptions and queue groups.
    pub(crate) fn targets(&self) -> (Vec<Arc<Subscription>>, Vec<Arc<QueueGroup>>) {
        let subs = self.subs();
        let plain = subs
            .index
            .values()
            .filter(|e| e.group.is_none())
            .map(|e| e.sub.clone())
            .collect();
        (plain, subs.queues.values().cloned().collect())
    }

    pub(crate) fn all_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subs().index.values().map(|e| e.sub.clone()).collect()
    }

    pub(crate) fn index(&self, sub: Arc<Subscription>, group: Option<Arc<QueueGroup>>) {
        self.subs().index.insert(sub.id, SubEntry { sub, group });
    }

    pub(crate) fn unindex(&self, sub_id: u64) {
        self.subs().index.remove(&sub_id);
    }

    pub fn subscription_count(&self) -> usize {
        self.subs().index.len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("last_seq", &self.last_sequence())
            .finish()
    }
}

/// Channel name -> channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// The channel named `name`, created in `store` on first use.
    pub fn get_or_create(&self, name: &str, store: &dyn Store) -> Result<Arc<Channel>> {
        if let Some(channel) = self.get(name) {
            return Ok(channel);
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }
        let channel = Arc::new(Channel::new(name, store.create_channel(name)?)?);
        channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    pub fn insert(&self, channel: Arc<Channel>) {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.name.clone(), channel);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.channels.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
