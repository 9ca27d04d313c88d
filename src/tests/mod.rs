//! End-to-end scenarios across the broker, its stores and the transports.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::broker::message::{Message, MsgDelivery};
use crate::client::ClientInfo;
use crate::persistence::{ChannelStore, MemoryStore, MsgStore, RecoveredState, Store};
use crate::utils::{BrokerError, Result};

/// A memory store whose message logs are wrapped by `wrap`, for injecting
/// faults and latency into the message half of the contract.
pub(crate) struct WrappedStore<F> {
    inner: MemoryStore,
    wrap: F,
    /// While set, recording the applied index fails.
    pub fail_index_writes: AtomicBool,
}

impl<F> WrappedStore<F>
where
    F: Fn(Arc<dyn MsgStore>) -> Arc<dyn MsgStore> + Send + Sync,
{
    pub fn new(wrap: F) -> Self {
        Self {
            inner: MemoryStore::default(),
            wrap,
            fail_index_writes: AtomicBool::new(false),
        }
    }
}

impl<F> Store for WrappedStore<F>
where
    F: Fn(Arc<dyn MsgStore>) -> Arc<dyn MsgStore> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "wrapped-memory"
    }

    fn create_channel(&self, name: &str) -> Result<ChannelStore> {
        let store = self.inner.create_channel(name)?;
        Ok(ChannelStore {
            msgs: (self.wrap)(store.msgs),
            subs: store.subs,
        })
    }

    fn delete_channel(&self, name: &str) -> Result<()> {
        self.inner.delete_channel(name)
    }

    fn add_client(&self, info: &ClientInfo) -> Result<()> {
        self.inner.add_client(info)
    }

    fn delete_client(&self, client_id: &str) -> Result<()> {
        self.inner.delete_client(client_id)
    }

    fn recover(&self) -> Result<Option<RecoveredState>> {
        self.inner.recover()
    }

    fn last_applied_index(&self) -> Result<u64> {
        self.inner.last_applied_index()
    }

    fn set_last_applied_index(&self, index: u64) -> Result<()> {
        if self.fail_index_writes.load(Ordering::Acquire) {
            return Err(BrokerError::Storage(format!("writing applied index {index} failed")));
        }
        self.inner.set_last_applied_index(index)
    }
}

/// A message log that silently drops one sequence, slows lookups down or
/// fails them.
pub(crate) struct FaultyMsgs {
    inner: Arc<dyn MsgStore>,
    /// Not stored; the previous sequence is reported instead.
    drop_seq: Option<u64>,
    lookup_delay: Duration,
    /// Lookups left to fail before they go through again.
    failing_lookups: Arc<AtomicU32>,
}

impl FaultyMsgs {
    pub fn dropping(seq: u64) -> impl Fn(Arc<dyn MsgStore>) -> Arc<dyn MsgStore> + Send + Sync {
        move |inner: Arc<dyn MsgStore>| -> Arc<dyn MsgStore> {
            Arc::new(Self {
                inner,
                drop_seq: Some(seq),
                lookup_delay: Duration::ZERO,
                failing_lookups: Arc::default(),
            })
        }
    }

    pub fn slow(delay: Duration) -> impl Fn(Arc<dyn MsgStore>) -> Arc<dyn MsgStore> + Send + Sync {
        move |inner: Arc<dyn MsgStore>| -> Arc<dyn MsgStore> {
            Arc::new(Self {
                inner,
                drop_seq: None,
                lookup_delay: delay,
                failing_lookups: Arc::default(),
            })
        }
    }

    /// Fails as many lookups as `failures` holds when they are attempted.
    pub fn flaky(failures: Arc<AtomicU32>) -> impl Fn(Arc<dyn MsgStore>) -> Arc<dyn MsgStore> + Send + Sync {
        move |inner: Arc<dyn MsgStore>| -> Arc<dyn MsgStore> {
            Arc::new(Self {
                inner,
                drop_seq: None,
                lookup_delay: Duration::ZERO,
                failing_lookups: failures.clone(),
            })
        }
    }
}

impl MsgStore for FaultyMsgs {
    fn store(&self, msg: &Message) -> Result<u64> {
        if self.drop_seq == Some(msg.sequence) {
            return Ok(msg.sequence - 1);
        }
        self.inner.store(msg)
    }

    fn lookup(&self, seq: u64) -> Result<Option<Message>> {
        if !self.lookup_delay.is_zero() {
            std::thread::sleep(self.lookup_delay);
        }
        let failed = self
            .failing_lookups
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BrokerError::Storage(format!("lookup of {seq} failed")));
        }
        self.inner.lookup(seq)
    }

    fn first_sequence(&self) -> Result<u64> {
        self.inner.first_sequence()
    }

    fn last_sequence(&self) -> Result<u64> {
        self.inner.last_sequence()
    }

    fn get_sequence_from_timestamp(&self, timestamp: i64) -> Result<u64> {
        self.inner.get_sequence_from_timestamp(timestamp)
    }

    fn empty(&self) -> Result<()> {
        self.inner.empty()
    }

    fn set_first_sequence(&self, seq: u64) -> Result<()> {
        self.inner.set_first_sequence(seq)
    }
}

pub(crate) fn drain(rx: &mut UnboundedReceiver<MsgDelivery>) -> Vec<MsgDelivery> {
    let mut out = Vec::new();
    while let Ok(d) = rx.try_recv() {
        out.push(d);
    }
    out
}
