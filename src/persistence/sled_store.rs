//! Persistence layer backed by `sled`
//!
//! Layout of the database:
//! - `channels`: channel name -> empty value
//! - `clients`: client id -> JSON `ClientInfo`
//! - `meta`: `last_applied` and per-channel `last/<name>` watermarks
//! - `msgs/<name>`: big-endian sequence -> JSON `Message`
//! - `subs/<name>`: big-endian subscription id -> JSON `SubState`
//! - `pending/<name>`: big-endian (subscription id, sequence) -> empty value
//!
//! Big-endian keys make tree iteration follow sequence order, which the
//! retention and timestamp scans rely on.
//!
//! Configuration options supported:
//! - `limits`: optional per-channel retention (message count and age);
//!   oldest messages are removed as new ones are stored
//! - `fsync`: flush every write before returning

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};

use super::{
    ChannelStore, MsgStore, RecoveredChannel, RecoveredState, RecoveredSubscription, Store,
    StoreLimits, SubState, SubStore,
};
use crate::broker::message::Message;
use crate::client::ClientInfo;
use crate::utils::{BrokerError, Result};

const LAST_APPLIED_KEY: &[u8] = b"last_applied";

fn last_key(channel: &str) -> Vec<u8> {
    format!("last/{channel}").into_bytes()
}

fn pending_key(sub_id: u64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&sub_id.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn decode_u64(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| BrokerError::Codec(format!("expected 8 bytes, got {}", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[derive(Debug, Clone, Copy)]
struct Watermarks {
    first: u64,
    last: u64,
    count: usize,
}

/// Message log of one channel in the `msgs/<name>` tree.
pub struct SledMsgStore {
    channel: String,
    tree: Tree,
    meta: Tree,
    limits: StoreLimits,
    fsync: bool,
    marks: Mutex<Watermarks>,
}

impl SledMsgStore {
    fn open(channel: &str, tree: Tree, meta: Tree, limits: StoreLimits, fsync: bool) -> Result<Self> {
        let saved_last = match meta.get(last_key(channel))? {
            Some(raw) => decode_u64(&raw)?,
            None => 0,
        };
        let tree_last = match tree.last()? {
            Some((key, _)) => decode_u64(&key)?,
            None => 0,
        };
        let last = saved_last.max(tree_last);
        let first = match tree.first()? {
            Some((key, _)) => decode_u64(&key)?,
            None => last + 1,
        };
        let count = tree.len();
        Ok(Self {
            channel: channel.to_string(),
            tree,
            meta,
            limits,
            fsync,
            marks: Mutex::new(Watermarks { first, last, count }),
        })
    }

    fn marks(&self) -> Result<std::sync::MutexGuard<'_, Watermarks>> {
        self.marks
            .lock()
            .map_err(|_| BrokerError::Storage("sled watermark lock poisoned".into()))
    }

    fn enforce_limits(&self, marks: &mut Watermarks) -> Result<()> {
        if self.limits.max_msgs > 0 {
            while marks.count > self.limits.max_msgs {
                if self.tree.pop_min()?.is_none() {
                    break;
                }
                marks.count -= 1;
            }
        }
        if let Some(max_age) = self.limits.max_age {
            let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
            while let Some((key, raw)) = self.tree.first()? {
                let msg: Message = serde_json::from_slice(&raw)?;
                if msg.timestamp >= cutoff {
                    break;
                }
                self.tree.remove(key)?;
                marks.count = marks.count.saturating_sub(1);
            }
        }
        marks.first = match self.tree.first()? {
            Some((key, _)) => decode_u64(&key)?,
            None => marks.last + 1,
        };
        Ok(())
    }
}

impl MsgStore for SledMsgStore {
    fn store(&self, msg: &Message) -> Result<u64> {
        let mut marks = self.marks()?;
        if msg.sequence <= marks.last {
            return Err(BrokerError::Storage(format!(
                "sequence {} is not greater than last stored {} on `{}`",
                msg.sequence, marks.last, self.channel
            )));
        }
        let serialized = serde_json::to_vec(msg)?;
        self.tree.insert(msg.sequence.to_be_bytes(), serialized)?;
        self.meta
            .insert(last_key(&self.channel), &msg.sequence.to_be_bytes()[..])?;
        if marks.count == 0 {
            marks.first = msg.sequence;
        }
        marks.last = msg.sequence;
        marks.count += 1;
        self.enforce_limits(&mut marks)?;
        if self.fsync {
            self.tree.flush()?;
            self.meta.flush()?;
        }
        Ok(msg.sequence)
    }

    fn lookup(&self, seq: u64) -> Result<Option<Message>> {
        match self.tree.get(seq.to_be_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn first_sequence(&self) -> Result<u64> {
        Ok(self.marks()?.first)
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(self.marks()?.last)
    }

    fn get_sequence_from_timestamp(&self, timestamp: i64) -> Result<u64> {
        for entry in self.tree.iter() {
            let (_, raw) = entry?;
            let msg: Message = serde_json::from_slice(&raw)?;
            if msg.timestamp >= timestamp {
                return Ok(msg.sequence);
            }
        }
        Ok(self.marks()?.last + 1)
    }

    fn empty(&self) -> Result<()> {
        let mut marks = self.marks()?;
        self.tree.clear()?;
        self.meta.remove(last_key(&self.channel))?;
        *marks = Watermarks {
            first: 1,
            last: 0,
            count: 0,
        };
        Ok(())
    }

    fn set_first_sequence(&self, seq: u64) -> Result<()> {
        let mut marks = self.marks()?;
        if marks.count > 0 || seq == 0 {
            return Ok(());
        }
        self.meta
            .insert(last_key(&self.channel), &(seq - 1).to_be_bytes()[..])?;
        marks.first = seq;
        marks.last = seq - 1;
        Ok(())
    }
}

/// Subscription records of one channel in `subs/<name>` and `pending/<name>`.
pub struct SledSubStore {
    subs: Tree,
    pending: Tree,
    fsync: bool,
}

impl SledSubStore {
    fn load(&self) -> Result<Vec<RecoveredSubscription>> {
        let mut out = Vec::new();
        for entry in self.subs.iter() {
            let (key, raw) = entry?;
            let state: SubState = serde_json::from_slice(&raw)?;
            let mut pending = BTreeSet::new();
            for p in self.pending.scan_prefix(&key) {
                let (pkey, _) = p?;
                pending.insert(decode_u64(&pkey[8..])?);
            }
            out.push(RecoveredSubscription { state, pending });
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        if self.fsync {
            self.subs.flush()?;
            self.pending.flush()?;
        }
        Ok(())
    }
}

impl SubStore for SledSubStore {
    fn create_sub(&self, state: &SubState) -> Result<()> {
        let key = state.id.to_be_bytes();
        if self.subs.contains_key(key)? {
            return Err(BrokerError::already_exists("subscription", state.id.to_string()));
        }
        self.subs.insert(key, serde_json::to_vec(state)?)?;
        self.flush()
    }

    fn update_sub(&self, state: &SubState) -> Result<()> {
        self.subs
            .insert(state.id.to_be_bytes(), serde_json::to_vec(state)?)?;
        self.flush()
    }

    fn delete_sub(&self, sub_id: u64) -> Result<()> {
        self.subs.remove(sub_id.to_be_bytes())?;
        let keys: Vec<_> = self
            .pending
            .scan_prefix(sub_id.to_be_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            self.pending.remove(key)?;
        }
        self.flush()
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<()> {
        let sub_key = sub_id.to_be_bytes();
        let pkey = pending_key(sub_id, seq);
        let res = (&self.subs, &self.pending).transaction(|(subs, pending)| {
            let Some(raw) = subs.get(&sub_key[..])? else {
                return Err(ConflictableTransactionError::Abort(BrokerError::not_found(
                    "subscription",
                    sub_id.to_string(),
                )));
            };
            let mut state: SubState = serde_json::from_slice(&raw)
                .map_err(|e| ConflictableTransactionError::Abort(BrokerError::from(e)))?;
            pending.insert(&pkey[..], &b""[..])?;
            if seq > state.last_sent {
                state.last_sent = seq;
                let encoded = serde_json::to_vec(&state)
                    .map_err(|e| ConflictableTransactionError::Abort(BrokerError::from(e)))?;
                subs.insert(&sub_key[..], encoded)?;
            }
            Ok(())
        });
        res.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => err.into(),
        })?;
        self.flush()
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<()> {
        self.pending.remove(pending_key(sub_id, seq))?;
        self.flush()
    }
}

/// A store kept in an embedded `sled` database.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    channels: Tree,
    clients: Tree,
    meta: Tree,
    limits: StoreLimits,
    fsync: bool,
}

impl SledStore {
    /// Open or create a sled database at `path` with the given policy.
    pub fn open(path: impl AsRef<Path>, limits: StoreLimits, fsync: bool) -> Result<Self> {
        Self::with_db(sled::open(path)?, limits, fsync)
    }

    /// A database removed when the store is dropped.
    pub fn temporary(limits: StoreLimits) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, limits, false)
    }

    fn with_db(db: Db, limits: StoreLimits, fsync: bool) -> Result<Self> {
        Ok(Self {
            channels: db.open_tree("channels")?,
            clients: db.open_tree("clients")?,
            meta: db.open_tree("meta")?,
            db,
            limits,
            fsync,
        })
    }

    fn open_channel(&self, name: &str) -> Result<(Arc<SledMsgStore>, Arc<SledSubStore>)> {
        let msgs = SledMsgStore::open(
            name,
            self.db.open_tree(format!("msgs/{name}"))?,
            self.meta.clone(),
            self.limits,
            self.fsync,
        )?;
        let subs = SledSubStore {
            subs: self.db.open_tree(format!("subs/{name}"))?,
            pending: self.db.open_tree(format!("pending/{name}"))?,
            fsync: self.fsync,
        };
        Ok((Arc::new(msgs), Arc::new(subs)))
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("limits", &self.limits)
            .finish()
    }
}

impl Store for SledStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn create_channel(&self, name: &str) -> Result<ChannelStore> {
        if self.channels.contains_key(name)? {
            return Err(BrokerError::already_exists("channel", name));
        }
        let (msgs, subs) = self.open_channel(name)?;
        self.channels.insert(name, &b""[..])?;
        if self.fsync {
            self.channels.flush()?;
        }
        Ok(ChannelStore { msgs, subs })
    }

    fn delete_channel(&self, name: &str) -> Result<()> {
        self.channels.remove(name)?;
        self.meta.remove(last_key(name))?;
        for tree in [
            format!("msgs/{name}"),
            format!("subs/{name}"),
            format!("pending/{name}"),
        ] {
            self.db.drop_tree(tree)?;
        }
        Ok(())
    }

    fn add_client(&self, info: &ClientInfo) -> Result<()> {
        self.clients
            .insert(info.id.as_bytes(), serde_json::to_vec(info)?)?;
        if self.fsync {
            self.clients.flush()?;
        }
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<()> {
        self.clients.remove(client_id.as_bytes())?;
        Ok(())
    }

    fn recover(&self) -> Result<Option<RecoveredState>> {
        if self.channels.is_empty() && self.clients.is_empty() && self.meta.is_empty() {
            return Ok(None);
        }
        let mut state = RecoveredState::default();
        for entry in self.clients.iter() {
            let (_, raw) = entry?;
            state.clients.push(serde_json::from_slice(&raw)?);
        }
        for entry in self.channels.iter() {
            let (key, _) = entry?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| BrokerError::Codec(e.to_string()))?;
            let (msgs, subs) = self.open_channel(&name)?;
            let subscriptions = subs.load()?;
            state.channels.push(RecoveredChannel {
                name,
                store: ChannelStore { msgs, subs },
                subscriptions,
            });
        }
        Ok(Some(state))
    }

    fn last_applied_index(&self) -> Result<u64> {
        match self.meta.get(LAST_APPLIED_KEY)? {
            Some(raw) => decode_u64(&raw),
            None => Ok(0),
        }
    }

    fn set_last_applied_index(&self, index: u64) -> Result<()> {
        self.meta.insert(LAST_APPLIED_KEY, &index.to_be_bytes()[..])?;
        if self.fsync {
            self.meta.flush()?;
        }
        Ok(())
    }
}
