//! Proposal batching
//!
//! Every proposal goes through one queue drained by a single task, so
//! entries are committed in proposal order. The task folds runs of
//! consecutive publishes, and consecutive send/ack records of the same
//! subscription, into one log entry before committing it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::consensus::ConsensusLog;
use super::ops::{ApplyResponse, LogEntry, ReplicatedOp};
use crate::config::ClusterSettings;
use crate::utils::{BrokerError, Result};

type Reply = oneshot::Sender<Result<ApplyResponse>>;

struct Proposal {
    op: ReplicatedOp,
    reply: Option<Reply>,
}

/// One log entry and the proposers waiting on it.
struct Batch {
    op: ReplicatedOp,
    /// Each waiter with the number of published messages it contributed.
    waiters: Vec<(Option<Reply>, usize)>,
}

/// Routes broker mutations through a [`ConsensusLog`].
pub struct ReplicationController {
    log: Arc<dyn ConsensusLog>,
    node_id: String,
    queue: mpsc::UnboundedSender<Proposal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationController {
    /// Spawns the batching task on the current tokio runtime.
    pub fn start(log: Arc<dyn ConsensusLog>, settings: &ClusterSettings) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| {
            BrokerError::InvalidRequest("replication must start inside a tokio runtime".into())
        })?;
        let (queue, rx) = mpsc::unbounded_channel();
        let node_id = log.node_id().to_string();
        let task = runtime.spawn(run_batcher(
            log.clone(),
            rx,
            node_id.clone(),
            settings.proposal_timeout(),
            settings.max_batch.max(1),
        ));
        Ok(Arc::new(Self {
            log,
            node_id,
            queue,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    pub fn leader_id(&self) -> Option<String> {
        self.log.leader_id()
    }

    /// Commits `op` and returns the local apply result.
    ///
    /// Rejected right away with `NotLeader` on a follower, and with
    /// `Timeout` if consensus does not commit within the proposal timeout.
    pub async fn propose(&self, op: ReplicatedOp) -> Result<ApplyResponse> {
        if !self.is_leader() {
            return Err(BrokerError::NotLeader {
                leader: self.leader_id(),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Proposal { op, reply: Some(tx) })
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)?
    }

    /// Queues `op` without waiting for its commit.
    pub fn replicate(&self, op: ReplicatedOp) {
        if self.queue.send(Proposal { op, reply: None }).is_err() {
            debug!("replication queue closed, dropping operation");
        }
    }

    pub async fn shutdown(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for ReplicationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationController")
            .field("node_id", &self.node_id)
            .finish()
    }
}

async fn run_batcher(
    log: Arc<dyn ConsensusLog>,
    mut rx: mpsc::UnboundedReceiver<Proposal>,
    node_id: String,
    timeout: Duration,
    max_batch: usize,
) {
    let mut pending = Vec::with_capacity(max_batch);
    while let Some(first) = rx.recv().await {
        pending.push(first);
        while pending.len() < max_batch {
            match rx.try_recv() {
                Ok(next) => pending.push(next),
                Err(_) => break,
            }
        }
        for batch in coalesce(std::mem::take(&mut pending)) {
            commit(&*log, &node_id, timeout, batch).await;
        }
    }
}

/// Merges runs of compatible proposals. Order is preserved and nothing is
/// merged across a proposal of another kind or entity.
fn coalesce(proposals: Vec<Proposal>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for Proposal { op, reply } in proposals {
        let published = match &op {
            ReplicatedOp::PublishBatch { messages } => messages.len(),
            _ => 0,
        };
        let op = match batches.last_mut() {
            Some(batch) => match batch.op.merge(op) {
                Ok(()) => {
                    batch.waiters.push((reply, published));
                    continue;
                }
                Err(op) => op,
            },
            None => op,
        };
        batches.push(Batch {
            op,
            waiters: vec![(reply, published)],
        });
    }
    batches
}

async fn commit(log: &dyn ConsensusLog, node_id: &str, timeout: Duration, batch: Batch) {
    let kind = batch.op.kind();
    let entry = LogEntry {
        origin: node_id.to_string(),
        op: batch.op,
    };
    let result = match entry.encode() {
        Ok(bytes) => match tokio::time::timeout(timeout, log.client_write(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(format!("commit of {kind}"))),
        },
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        if batch.waiters.iter().all(|(reply, _)| reply.is_none()) {
            debug!(op = kind, error = %err, "background replication failed");
        } else {
            warn!(op = kind, error = %err, "proposal failed");
        }
    }

    let mut offset = 0;
    for (reply, published) in batch.waiters {
        let share = match &result {
            Ok(ApplyResponse::Published(seqs)) => {
                let end = (offset + published).min(seqs.len());
                let start = offset.min(end);
                offset += published;
                Ok(ApplyResponse::Published(seqs[start..end].to_vec()))
            }
            other => other.clone(),
        };
        if let Some(reply) = reply {
            let _ = reply.send(share);
        }
    }
}
