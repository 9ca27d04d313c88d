//! In-memory store
//!
//! Everything lives behind mutexes inside the `MemoryStore`. It is the
//! default backend for tests and for single-process deployments that do not
//! need to survive a process exit; a broker rebuilt on the same
//! `Arc<MemoryStore>` recovers exactly like one rebuilt on a file store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use super::{
    ChannelStore, MsgStore, RecoveredChannel, RecoveredState, RecoveredSubscription, Store,
    StoreLimits, SubState, SubStore,
};
use crate::broker::message::Message;
use crate::client::ClientInfo;
use crate::utils::{BrokerError, Result};

#[derive(Debug)]
struct MemLog {
    msgs: BTreeMap<u64, Message>,
    first: u64,
    last: u64,
}

/// Message log of one channel.
#[derive(Debug)]
pub struct MemMsgStore {
    limits: StoreLimits,
    log: RwLock<MemLog>,
}

impl MemMsgStore {
    fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            log: RwLock::new(MemLog {
                msgs: BTreeMap::new(),
                first: 1,
                last: 0,
            }),
        }
    }

    fn enforce_limits(&self, log: &mut MemLog) {
        if self.limits.max_msgs > 0 {
            while log.msgs.len() > self.limits.max_msgs {
                log.msgs.pop_first();
            }
        }
        if let Some(max_age) = self.limits.max_age {
            let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
            while let Some(entry) = log.msgs.first_entry() {
                if entry.get().timestamp >= cutoff {
                    break;
                }
                entry.remove();
            }
        }
        log.first = log.msgs.keys().next().copied().unwrap_or(log.last + 1);
    }
}

impl MsgStore for MemMsgStore {
    fn store(&self, msg: &Message) -> Result<u64> {
        let mut log = self.log.write().map_err(poisoned)?;
        if msg.sequence <= log.last {
            return Err(BrokerError::Storage(format!(
                "sequence {} is not greater than last stored {}",
                msg.sequence, log.last
            )));
        }
        if log.msgs.is_empty() {
            log.first = msg.sequence;
        }
        log.msgs.insert(msg.sequence, msg.clone());
        log.last = msg.sequence;
        self.enforce_limits(&mut log);
        Ok(msg.sequence)
    }

    fn lookup(&self, seq: u64) -> Result<Option<Message>> {
        let log = self.log.read().map_err(poisoned)?;
        Ok(log.msgs.get(&seq).cloned())
    }

    fn first_sequence(&self) -> Result<u64> {
        Ok(self.log.read().map_err(poisoned)?.first)
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(self.log.read().map_err(poisoned)?.last)
    }

    fn get_sequence_from_timestamp(&self, timestamp: i64) -> Result<u64> {
        let log = self.log.read().map_err(poisoned)?;
        Ok(log
            .msgs
            .values()
            .find(|m| m.timestamp >= timestamp)
            .map(|m| m.sequence)
            .unwrap_or(log.last + 1))
    }

    fn empty(&self) -> Result<()> {
        let mut log = self.log.write().map_err(poisoned)?;
        log.msgs.clear();
        log.first = 1;
        log.last = 0;
        Ok(())
    }

    fn set_first_sequence(&self, seq: u64) -> Result<()> {
        let mut log = self.log.write().map_err(poisoned)?;
        if log.msgs.is_empty() && seq > 0 {
            log.first = seq;
            log.last = seq - 1;
        }
        Ok(())
    }
}

/// Subscription records of one channel: state plus pending set.
#[derive(Debug, Default)]
pub struct MemSubStore {
    subs: Mutex<BTreeMap<u64, (SubState, BTreeSet<u64>)>>,
}

impl MemSubStore {
    fn snapshot(&self) -> Result<Vec<RecoveredSubscription>> {
        let subs = self.subs.lock().map_err(poisoned)?;
        Ok(subs
            .values()
            .map(|(state, pending)| RecoveredSubscription {
                state: state.clone(),
                pending: pending.clone(),
            })
            .collect())
    }

    fn with_sub<T>(
        &self,
        sub_id: u64,
        f: impl FnOnce(&mut (SubState, BTreeSet<u64>)) -> T,
    ) -> Result<T> {
        let mut subs = self.subs.lock().map_err(poisoned)?;
        subs.get_mut(&sub_id)
            .map(f)
            .ok_or_else(|| BrokerError::not_found("subscription", sub_id.to_string()))
    }
}

impl SubStore for MemSubStore {
    fn create_sub(&self, state: &SubState) -> Result<()> {
        let mut subs = self.subs.lock().map_err(poisoned)?;
        if subs.contains_key(&state.id) {
            return Err(BrokerError::already_exists("subscription", state.id.to_string()));
        }
        subs.insert(state.id, (state.clone(), BTreeSet::new()));
        Ok(())
    }

    fn update_sub(&self, state: &SubState) -> Result<()> {
        self.with_sub(state.id, |entry| entry.0 = state.clone())
    }

    fn delete_sub(&self, sub_id: u64) -> Result<()> {
        self.subs.lock().map_err(poisoned)?.remove(&sub_id);
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<()> {
        self.with_sub(sub_id, |(state, pending)| {
            pending.insert(seq);
            state.last_sent = state.last_sent.max(seq);
        })
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<()> {
        self.with_sub(sub_id, |(_, pending)| {
            pending.remove(&seq);
        })
    }
}

#[derive(Default)]
struct MemState {
    channels: BTreeMap<String, (Arc<MemMsgStore>, Arc<MemSubStore>)>,
    clients: BTreeMap<String, ClientInfo>,
    last_applied: u64,
    written: bool,
}

/// A store that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    limits: StoreLimits,
    state: Mutex<MemState>,
}

impl MemoryStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(MemState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemState>> {
        self.state.lock().map_err(poisoned)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("limits", &self.limits)
            .finish()
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create_channel(&self, name: &str) -> Result<ChannelStore> {
        let mut state = self.state()?;
        if state.channels.contains_key(name) {
            return Err(BrokerError::already_exists("channel", name));
        }
        let msgs = Arc::new(MemMsgStore::new(self.limits));
        let subs = Arc::new(MemSubStore::default());
        state
            .channels
            .insert(name.to_string(), (msgs.clone(), subs.clone()));
        state.written = true;
        Ok(ChannelStore { msgs, subs })
    }

    fn delete_channel(&self, name: &str) -> Result<()> {
        self.state()?.channels.remove(name);
        Ok(())
    }

    fn add_client(&self, info: &ClientInfo) -> Result<()> {
        let mut state = self.state()?;
        state.clients.insert(info.id.clone(), info.clone());
        state.written = true;
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<()> {
        self.state()?.clients.remove(client_id);
        Ok(())
    }

    fn recover(&self) -> Result<Option<RecoveredState>> {
        let state = self.state()?;
        if !state.written {
            return Ok(None);
        }
        let mut channels = Vec::with_capacity(state.channels.len());
        for (name, (msgs, subs)) in &state.channels {
            channels.push(RecoveredChannel {
                name: name.clone(),
                store: ChannelStore {
                    msgs: msgs.clone(),
                    subs: subs.clone(),
                },
                subscriptions: subs.snapshot()?,
            });
        }
        Ok(Some(RecoveredState {
            clients: state.clients.values().cloned().collect(),
            channels,
        }))
    }

    fn last_applied_index(&self) -> Result<u64> {
        Ok(self.state()?.last_applied)
    }

    fn set_last_applied_index(&self, index: u64) -> Result<()> {
        let mut state = self.state()?;
        state.last_applied = index;
        state.written = true;
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> BrokerError {
    BrokerError::Storage("memory store lock poisoned".into())
}
