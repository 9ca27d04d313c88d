//! Consensus contract and an in-process log
//!
//! [`ConsensusLog`] is the seam toward a consensus implementation: a proposal
//! resolves once the entry is committed and applied on the local
//! [`StateMachine`]. [`InProcessCluster`] implements it for N nodes living
//! in one process, which is enough to run a replicated broker in tests and
//! single-host deployments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::ops::ApplyResponse;
use crate::broker::message::Message;
use crate::utils::{BrokerError, Result};

/// A replicated log as seen by one node.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    fn node_id(&self) -> &str;

    fn is_leader(&self) -> bool;

    fn leader_id(&self) -> Option<String>;

    /// Appends `entry` and resolves after it is committed and applied on
    /// this node's state machine, with the local apply result.
    ///
    /// Fails with `NotLeader` on a follower.
    async fn client_write(&self, entry: Vec<u8>) -> Result<ApplyResponse>;
}

/// The deterministic state a consensus log drives.
pub trait StateMachine: Send + Sync {
    /// Applies the committed entry at `index`. Entries at or below
    /// [`StateMachine::last_applied`] must be skipped.
    fn apply(&self, index: u64, data: &[u8]) -> Result<ApplyResponse>;

    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces all state with `data`, pulling message bodies from `source`.
    fn restore(&self, data: &[u8], source: &dyn MessageSource) -> Result<()>;

    fn last_applied(&self) -> u64;

    fn leadership_changed(&self, is_leader: bool);
}

/// Where a restoring node reads message bodies a snapshot refers to.
pub trait MessageSource: Send + Sync {
    fn fetch(&self, channel: &str, seq: u64) -> Result<Option<Message>>;
}

struct Member {
    fsm: Weak<dyn StateMachine>,
    source: Weak<dyn MessageSource>,
    connected: bool,
}

#[derive(Default)]
struct LogState {
    /// Uncompacted entries, ascending by index.
    entries: Vec<(u64, Vec<u8>)>,
    /// Compaction point: `(index, snapshot)`.
    snapshot: Option<(u64, Vec<u8>)>,
    last_index: u64,
}

/// A consensus log shared by every node of an in-process cluster.
///
/// Commits are immediate once the configured commit latency has elapsed.
/// Every connected node applies each entry in index order; a disconnected
/// node catches up when reconnected, through the compaction snapshot if it
/// fell behind it.
pub struct InProcessCluster {
    log: Mutex<LogState>,
    members: RwLock<BTreeMap<String, Member>>,
    leader: RwLock<Option<String>>,
    commit_latency: RwLock<Duration>,
}

impl InProcessCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(LogState::default()),
            members: RwLock::new(BTreeMap::new()),
            leader: RwLock::new(None),
            commit_latency: RwLock::new(Duration::ZERO),
        })
    }

    fn log(&self) -> MutexGuard<'_, LogState> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a node and returns its view of the log. The node catches up
    /// with everything committed so far.
    pub fn add_node<T>(self: &Arc<Self>, node_id: &str, node: &Arc<T>) -> Result<Arc<ClusterNode>>
    where
        T: StateMachine + MessageSource + 'static,
    {
        let fsm: Arc<dyn StateMachine> = node.clone();
        let source: Arc<dyn MessageSource> = node.clone();
        {
            let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
            if members.contains_key(node_id) {
                return Err(BrokerError::already_exists("node", node_id));
            }
            members.insert(
                node_id.to_string(),
                Member {
                    fsm: Arc::downgrade(&fsm),
                    source: Arc::downgrade(&source),
                    connected: true,
                },
            );
        }
        let log = self.log();
        self.catch_up(&log, node_id);
        drop(log);
        info!(node = node_id, "node joined cluster");
        Ok(Arc::new(ClusterNode {
            cluster: self.clone(),
            node_id: node_id.to_string(),
        }))
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Makes `node_id` the leader. The new leader first catches up with the
    /// log; then the old leader is told it lost leadership and the new one
    /// that it gained it.
    pub fn set_leader(&self, node_id: &str) -> Result<()> {
        let new_fsm = self
            .fsm(node_id)
            .ok_or_else(|| BrokerError::not_found("node", node_id))?;
        {
            let log = self.log();
            self.catch_up(&log, node_id);
        }
        let previous = self
            .leader
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(node_id.to_string());
        if previous.as_deref() == Some(node_id) {
            return Ok(());
        }
        if let Some(old) = previous.as_deref().and_then(|id| self.fsm(id)) {
            old.leadership_changed(false);
        }
        new_fsm.leadership_changed(true);
        info!(leader = node_id, previous = ?previous, "leader elected");
        Ok(())
    }

    /// Cuts `node_id` off: it stops applying entries. A cut-off leader loses
    /// leadership.
    pub fn disconnect(&self, node_id: &str) {
        self.set_connected(node_id, false);
        let was_leader = {
            let mut leader = self.leader.write().unwrap_or_else(|e| e.into_inner());
            if leader.as_deref() == Some(node_id) {
                *leader = None;
                true
            } else {
                false
            }
        };
        if was_leader {
            if let Some(fsm) = self.fsm(node_id) {
                fsm.leadership_changed(false);
            }
        }
        info!(node = node_id, "node disconnected");
    }

    /// Reconnects `node_id` and applies everything it missed.
    pub fn reconnect(&self, node_id: &str) {
        self.set_connected(node_id, true);
        let log = self.log();
        self.catch_up(&log, node_id);
        info!(node = node_id, "node reconnected");
    }

    /// Delay between a proposal and its commit.
    pub fn set_commit_latency(&self, latency: Duration) {
        *self.commit_latency.write().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Replaces every entry up to the leader's applied index with a snapshot
    /// of the leader's state.
    pub fn compact(&self) -> Result<u64> {
        let leader = self.leader().ok_or(BrokerError::NotLeader { leader: None })?;
        let fsm = self
            .fsm(&leader)
            .ok_or_else(|| BrokerError::not_found("node", leader.clone()))?;
        let mut log = self.log();
        let index = fsm.last_applied();
        let data = fsm.snapshot()?;
        log.entries.retain(|(i, _)| *i > index);
        log.snapshot = Some((index, data));
        debug!(index, remaining = log.entries.len(), "log compacted");
        Ok(index)
    }

    /// Index of the last committed entry.
    pub fn last_index(&self) -> u64 {
        self.log().last_index
    }

    fn set_connected(&self, node_id: &str, connected: bool) {
        if let Some(member) = self
            .members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(node_id)
        {
            member.connected = connected;
        }
    }

    fn fsm(&self, node_id: &str) -> Option<Arc<dyn StateMachine>> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .and_then(|m| m.fsm.upgrade())
    }

    fn source_of_leader(&self) -> Option<Arc<dyn MessageSource>> {
        let leader = self.leader()?;
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&leader)
            .and_then(|m| m.source.upgrade())
    }

    /// Brings one connected node up to the end of the log. Returns the
    /// result of applying the last entry, if this call applied it.
    fn catch_up(&self, log: &LogState, node_id: &str) -> Option<Result<ApplyResponse>> {
        let (fsm, connected) = {
            let members = self.members.read().unwrap_or_else(|e| e.into_inner());
            let member = members.get(node_id)?;
            (member.fsm.upgrade()?, member.connected)
        };
        if !connected {
            return None;
        }
        let mut applied = fsm.last_applied();
        if let Some((index, data)) = &log.snapshot {
            if applied < *index {
                let source = self.source_of_leader()?;
                if let Err(err) = fsm.restore(data, &*source) {
                    warn!(node = node_id, error = %err, "snapshot install failed");
                    return None;
                }
                applied = *index;
                info!(node = node_id, index, "snapshot installed from leader");
            }
        }
        let mut last = None;
        for (index, data) in log.entries.iter().filter(|(i, _)| *i > applied) {
            let result = fsm.apply(*index, data);
            if let Err(err) = &result {
                debug!(node = node_id, index, error = %err, "entry applied with error");
            }
            last = Some(result);
            if fsm.last_applied() < *index {
                // Later entries wait until this one is recorded.
                warn!(node = node_id, index, "entry not recorded as applied, pausing catch-up");
                break;
            }
        }
        last
    }

    async fn write(&self, node_id: &str, entry: Vec<u8>) -> Result<ApplyResponse> {
        let leader = self.leader();
        if leader.as_deref() != Some(node_id) {
            return Err(BrokerError::NotLeader { leader });
        }
        let latency = *self.commit_latency.read().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut log = self.log();
        // Leadership may have moved while the entry was in flight.
        let leader = self.leader();
        if leader.as_deref() != Some(node_id) {
            return Err(BrokerError::NotLeader { leader });
        }
        log.last_index += 1;
        let index = log.last_index;
        log.entries.push((index, entry));

        let mut local = None;
        let ids: Vec<String> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            let result = self.catch_up(&log, &id);
            if id == node_id {
                local = result;
            }
        }
        local.unwrap_or(Ok(ApplyResponse::Skipped))
    }
}

impl std::fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessCluster")
            .field("leader", &self.leader())
            .field("last_index", &self.last_index())
            .finish()
    }
}

/// One node's handle on an [`InProcessCluster`].
#[derive(Debug)]
pub struct ClusterNode {
    cluster: Arc<InProcessCluster>,
    node_id: String,
}

impl ClusterNode {
    pub fn cluster(&self) -> &Arc<InProcessCluster> {
        &self.cluster
    }
}

#[async_trait]
impl ConsensusLog for ClusterNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn is_leader(&self) -> bool {
        self.cluster.leader().as_deref() == Some(self.node_id.as_str())
    }

    fn leader_id(&self) -> Option<String> {
        self.cluster.leader()
    }

    async fn client_write(&self, entry: Vec<u8>) -> Result<ApplyResponse> {
        self.cluster.write(&self.node_id, entry).await
    }
}
