//! The `cluster` module replicates broker state across nodes.
//!
//! - `ops`: the replicated operations, snapshots and control messages.
//! - `consensus`: the [`ConsensusLog`] / [`StateMachine`] contract and the
//!   in-process log ([`InProcessCluster`]).
//! - `controller`: [`ReplicationController`], the batching proposal queue the
//!   broker routes its mutations through.
//!
//! A clustered node is a [`Broker`] built with [`Broker::new_clustered`],
//! registered with the log, with a controller attached. [`join`] does all
//! three.

pub mod consensus;
pub mod controller;
pub mod ops;

use std::sync::Arc;

use crate::broker::Broker;
use crate::config::ClusterSettings;
use crate::utils::Result;

pub use consensus::{ClusterNode, ConsensusLog, InProcessCluster, MessageSource, StateMachine};
pub use controller::ReplicationController;
pub use ops::{
    ApplyResponse, ChannelSnapshot, ControlKind, ControlMessage, Heartbeats, LogEntry,
    ReplicatedOp, ServerSnapshot,
};

/// Registers `broker` with `cluster` under `settings.node_id` and attaches a
/// replication controller to it.
pub fn join(
    cluster: &Arc<InProcessCluster>,
    broker: &Arc<Broker>,
    settings: &ClusterSettings,
) -> Result<Arc<ReplicationController>> {
    let node = cluster.add_node(&settings.node_id, broker)?;
    let controller = ReplicationController::start(node, settings)?;
    broker.attach_replication(controller.clone())?;
    Ok(controller)
}
