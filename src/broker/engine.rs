use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelRegistry};
use super::message::{
    LogPosition, Message, MsgDelivery, StartPosition, SubscriptionInfo, SubscriptionRequest,
};
use super::queue::{QueueGroup, QueueInner, queue_key};
use super::subscription::{
    PendingAck, SubInner, SubStatus, Subscription, SubscriptionSnapshot, durable_key,
};
use crate::client::{ClientInfo, ClientRegistry};
use crate::cluster::consensus::{MessageSource, StateMachine};
use crate::cluster::controller::ReplicationController;
use crate::cluster::ops::{ApplyResponse, ChannelSnapshot, LogEntry, ReplicatedOp, ServerSnapshot};
use crate::config::DeliverySettings;
use crate::persistence::{RecoveredChannel, RecoveredState, RecoveredSubscription, Store, SubState};
use crate::transport::Transport;
use crate::utils::{BrokerError, Result};

/// Summary of one channel, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub subscriptions: usize,
}

/// The delivery engine.
///
/// Owns the channels, the connected clients and the redelivery timers. Every
/// client-facing operation is async: with replication attached it is
/// proposed to the consensus log and takes effect when the committed entry
/// is applied, otherwise it applies locally right away.
///
/// Only the replication leader (or a standalone broker) delivers messages and
/// runs redelivery timers.
pub struct Broker {
    settings: DeliverySettings,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    channels: ChannelRegistry,
    clients: ClientRegistry,
    replication: OnceLock<Arc<ReplicationController>>,
    runtime: Handle,
    self_ref: Weak<Broker>,
    last_applied: AtomicU64,
    /// Serializes apply, snapshot and restore.
    apply_lock: Mutex<()>,
    shutdown: AtomicBool,
    /// Delivers without a controller. Clustered brokers wait for one.
    standalone: bool,
}

impl Broker {
    /// Builds a standalone broker, recovering whatever `store` holds, and
    /// resumes delivery. Must be called from inside a tokio runtime.
    pub fn new(
        settings: DeliverySettings,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let broker = Self::build(settings, store, transport, true)?;
        broker.resume_delivery();
        Ok(broker)
    }

    /// Builds a broker that will be driven by a consensus log. It recovers
    /// `store` but stays silent until [`Broker::attach_replication`] and a
    /// leadership change tell it to deliver.
    pub fn new_clustered(
        settings: DeliverySettings,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        Self::build(settings, store, transport, false)
    }

    fn build(
        settings: DeliverySettings,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        standalone: bool,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| {
            BrokerError::InvalidRequest("broker must be created inside a tokio runtime".into())
        })?;
        let last_applied = store.last_applied_index()?;
        let recovered = store.recover()?;
        let broker = Arc::new_cyclic(|self_ref| Self {
            settings,
            store,
            transport,
            channels: ChannelRegistry::new(),
            clients: ClientRegistry::new(),
            replication: OnceLock::new(),
            runtime,
            self_ref: self_ref.clone(),
            last_applied: AtomicU64::new(last_applied),
            apply_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            standalone,
        });
        if let Some(state) = recovered {
            broker.recover(state)?;
        }
        Ok(broker)
    }

    /// Routes every later client-facing operation through `controller`.
    pub fn attach_replication(&self, controller: Arc<ReplicationController>) -> Result<()> {
        self.replication.set(controller).map_err(|_| {
            BrokerError::InvalidRequest("replication is already attached".into())
        })
    }

    pub fn replication(&self) -> Option<&Arc<ReplicationController>> {
        self.replication.get()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    fn node_id(&self) -> Option<&str> {
        self.replication.get().map(|r| r.node_id())
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown);
        }
        Ok(())
    }

    /// Whether this node delivers messages and runs redelivery timers.
    pub fn is_delivering(&self) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        match self.replication.get() {
            Some(r) => r.is_leader(),
            None => self.standalone,
        }
    }

    // ---------------------------------------------------------------------
    // Client-facing API
    // ---------------------------------------------------------------------

    /// Registers a client. Fails with `AlreadyExists` if the id is connected.
    pub async fn connect(&self, client_id: &str) -> Result<()> {
        self.check_running()?;
        let info = ClientInfo::new(client_id);
        match self.replication.get() {
            Some(r) => r
                .propose(ReplicatedOp::Connect {
                    client_id: info.id,
                    connected_at: info.connected_at,
                })
                .await
                .map(|_| ()),
            None => self.connect_local(info),
        }
    }

    /// Unregisters a client: its non-durable subscriptions are removed, its
    /// durable ones closed.
    pub async fn disconnect(&self, client_id: &str) -> Result<()> {
        self.check_running()?;
        match self.replication.get() {
            Some(r) => r
                .propose(ReplicatedOp::Disconnect {
                    client_id: client_id.to_string(),
                })
                .await
                .map(|_| ()),
            None => self.disconnect_local(client_id),
        }
    }

    /// Stores `payload` on `channel` and returns its sequence.
    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64> {
        self.check_running()?;
        if channel.is_empty() {
            return Err(BrokerError::InvalidRequest("empty channel name".into()));
        }
        let msg = Message::new(channel, payload);
        let seqs = match self.replication.get() {
            Some(r) => match r
                .propose(ReplicatedOp::PublishBatch {
                    messages: vec![msg],
                })
                .await?
            {
                ApplyResponse::Published(seqs) => seqs,
                other => return Err(unexpected("publish", &other)),
            },
            None => self.publish_local(vec![msg])?,
        };
        seqs.first()
            .copied()
            .ok_or_else(|| BrokerError::Storage("publish returned no sequence".into()))
    }

    /// Creates a subscription, or re-binds a closed durable one.
    pub async fn subscribe(&self, mut request: SubscriptionRequest) -> Result<SubscriptionInfo> {
        self.check_running()?;
        request.validate()?;
        if let StartPosition::TimeDeltaStart(delta) = request.start {
            let ts = chrono::Utc::now().timestamp_millis() - delta.as_millis() as i64;
            request.start = StartPosition::AtTime(ts);
        }
        match self.replication.get() {
            Some(r) => match r.propose(ReplicatedOp::Subscribe { request }).await? {
                ApplyResponse::Subscribed(info) => Ok(info),
                other => Err(unexpected("subscribe", &other)),
            },
            None => self.subscribe_local(&request, None),
        }
    }

    /// Acknowledges `seq` on a subscription. Acks for sequences that are not
    /// pending are ignored.
    pub async fn ack(&self, channel: &str, sub_id: u64, seq: u64) -> Result<()> {
        self.check_running()?;
        if let Some(r) = self.replication.get() {
            if !r.is_leader() {
                return Err(BrokerError::NotLeader {
                    leader: r.leader_id(),
                });
            }
        }
        self.ack_local(channel, sub_id, seq)
    }

    /// Closes a subscription. A durable one keeps its cursor for a later
    /// re-bind; anything else is removed.
    pub async fn close_subscription(&self, channel: &str, sub_id: u64) -> Result<()> {
        self.check_running()?;
        match self.replication.get() {
            Some(r) => r
                .propose(ReplicatedOp::CloseSubscription {
                    channel: channel.to_string(),
                    sub_id,
                })
                .await
                .map(|_| ()),
            None => self.remove_local(channel, sub_id, true),
        }
    }

    /// Removes a subscription and its cursor.
    pub async fn unsubscribe(&self, channel: &str, sub_id: u64) -> Result<()> {
        self.check_running()?;
        match self.replication.get() {
            Some(r) => r
                .propose(ReplicatedOp::RemoveSubscription {
                    channel: channel.to_string(),
                    sub_id,
                })
                .await
                .map(|_| ()),
            None => self.remove_local(channel, sub_id, false),
        }
    }

    pub async fn delete_channel(&self, channel: &str) -> Result<()> {
        self.check_running()?;
        match self.replication.get() {
            Some(r) => r
                .propose(ReplicatedOp::DeleteChannel {
                    channel: channel.to_string(),
                })
                .await
                .map(|_| ()),
            None => self.delete_channel_local(channel),
        }
    }

    /// Stops every timer and the replication batcher. Later calls fail with
    /// `Shutdown`.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_timers();
        if let Some(r) = self.replication.get() {
            r.shutdown().await;
        }
        info!("broker shut down");
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn channel_info(&self, name: &str) -> Option<ChannelInfo> {
        let channel = self.channels.get(name)?;
        Some(ChannelInfo {
            name: channel.name.clone(),
            first_sequence: channel.first_sequence().ok()?,
            last_sequence: channel.last_sequence(),
            subscriptions: channel.subscription_count(),
        })
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.names()
    }

    pub fn subscription_snapshot(&self, channel: &str, sub_id: u64) -> Option<SubscriptionSnapshot> {
        let entry = self.channels.get(channel)?.find(sub_id)?;
        Some(entry.sub.snapshot())
    }

    pub fn subscription_status(&self, channel: &str, sub_id: u64) -> Option<SubStatus> {
        let entry = self.channels.get(channel)?.find(sub_id)?;
        Some(entry.sub.status())
    }

    /// Every subscription of `channel`, ordered by id.
    pub fn subscriptions(&self, channel: &str) -> Vec<SubscriptionSnapshot> {
        self.channels
            .get(channel)
            .map(|c| c.all_subscriptions().iter().map(|s| s.snapshot()).collect())
            .unwrap_or_default()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.ids()
    }

    /// Cursor of a queue group.
    pub fn queue_last_sent(&self, channel: &str, group: &str, durable_name: Option<&str>) -> Option<u64> {
        let channel = self.channels.get(channel)?;
        let group = channel.subs().queues.get(&queue_key(group, durable_name)).cloned()?;
        Some(group.last_sent())
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Local mutations, also used by apply
    // ---------------------------------------------------------------------

    pub(crate) fn connect_local(&self, info: ClientInfo) -> Result<()> {
        if info.id.is_empty() {
            return Err(BrokerError::InvalidRequest("empty client id".into()));
        }
        self.clients.register(info.clone())?;
        if let Err(err) = self.store.add_client(&info) {
            self.clients.unregister(&info.id);
            return Err(err);
        }
        info!(client = %info.id, "client connected");
        Ok(())
    }

    pub(crate) fn disconnect_local(&self, client_id: &str) -> Result<()> {
        if !self.clients.contains(client_id) {
            return Err(BrokerError::not_found("client", client_id));
        }
        self.store.delete_client(client_id)?;
        let subs = self.clients.unregister(client_id).unwrap_or_default();
        for (channel, sub_id) in subs {
            if let Err(err) = self.remove_local(&channel, sub_id, true) {
                warn!(client = %client_id, %channel, sub_id, error = %err, "failed to close subscription of disconnected client");
            }
        }
        info!(client = %client_id, "client disconnected");
        Ok(())
    }

    /// Appends `messages` in order and offers them to every subscription.
    ///
    /// A message tagged with a log position that is already stored is not
    /// appended again; its existing sequence is returned.
    pub(crate) fn publish_local(&self, messages: Vec<Message>) -> Result<Vec<u64>> {
        let mut seqs = Vec::with_capacity(messages.len());
        let mut touched: Vec<Arc<Channel>> = Vec::new();
        for msg in messages {
            if msg.channel.is_empty() {
                return Err(BrokerError::InvalidRequest("empty channel name".into()));
            }
            let channel = self.channels.get_or_create(&msg.channel, &*self.store)?;
            let stored = match msg.position {
                Some(position) => channel.find_position(position)?,
                None => None,
            };
            if let Some(seq) = stored {
                debug!(channel = %channel.name, seq, "message already stored");
                seqs.push(seq);
                continue;
            }
            let seq = channel.append(msg)?;
            debug!(channel = %channel.name, seq, "message stored");
            seqs.push(seq);
            if !touched.iter().any(|c| Arc::ptr_eq(c, &channel)) {
                touched.push(channel);
            }
        }
        for channel in touched {
            self.deliver_channel(&channel);
        }
        Ok(seqs)
    }

    /// Creates or re-binds a subscription. `log_index` is recorded on the
    /// subscription when the call comes from a replicated entry.
    pub(crate) fn subscribe_local(
        &self,
        request: &SubscriptionRequest,
        log_index: Option<u64>,
    ) -> Result<SubscriptionInfo> {
        request.validate()?;
        if !self.clients.contains(&request.client_id) {
            return Err(BrokerError::not_found("client", request.client_id.clone()));
        }
        let channel = self.channels.get_or_create(&request.channel, &*self.store)?;
        if request.queue_group.is_some() {
            return self.add_queue_member(&channel, request, log_index);
        }

        if let Some(durable) = &request.durable_name {
            let key = durable_key(&request.client_id, durable);
            let existing = {
                let subs = channel.subs();
                subs.durables
                    .get(&key)
                    .and_then(|id| subs.index.get(id))
                    .map(|e| e.sub.clone())
            };
            if let Some(sub) = existing {
                return self.rebind_durable(&channel, &sub, request, &key, log_index);
            }
        }

        let last_sent = channel.start_cursor(request.start)?;
        let id = channel.allocate_sub_id();
        let mut state = SubState::from_request(id, request, last_sent);
        state.log_index = log_index;
        channel.store().subs.create_sub(&state)?;
        let sub = Subscription::new(state, []);
        {
            let mut subs = channel.subs();
            if let Some(durable) = &request.durable_name {
                subs.durables
                    .insert(durable_key(&request.client_id, durable), id);
            }
        }
        channel.index(sub.clone(), None);
        self.clients.add_sub(&request.client_id, &channel.name, id);
        info!(channel = %channel.name, sub_id = id, client = %request.client_id, last_sent, "subscription created");

        if let Err(err) = self.send_available_messages(&channel, &sub) {
            warn!(channel = %channel.name, sub_id = id, error = %err, "initial delivery failed");
        }
        Ok(info_of(&sub))
    }

    fn rebind_durable(
        &self,
        channel: &Channel,
        sub: &Arc<Subscription>,
        request: &SubscriptionRequest,
        key: &str,
        log_index: Option<u64>,
    ) -> Result<SubscriptionInfo> {
        {
            let mut guard = sub.lock();
            if !guard.state.is_closed {
                return Err(BrokerError::already_exists("durable", key));
            }
            check_rebind_window(guard.pending.len(), request.max_in_flight)?;
            let mut state = guard.state.clone();
            state.inbox = request.inbox.clone();
            state.max_in_flight = request.max_in_flight;
            state.ack_wait_ms = request.ack_wait_ms;
            state.is_closed = false;
            state.log_index = log_index;
            channel.store().subs.update_sub(&state)?;
            guard.state = state;
            self.redeliver_all(channel, sub, &mut guard);
        }
        self.clients.add_sub(&request.client_id, &channel.name, sub.id);
        info!(channel = %channel.name, sub_id = sub.id, durable = %key, "durable subscription re-bound");
        if let Err(err) = self.send_available_messages(channel, sub) {
            warn!(channel = %channel.name, sub_id = sub.id, error = %err, "delivery after re-bind failed");
        }
        Ok(info_of(sub))
    }

    fn add_queue_member(
        &self,
        channel: &Arc<Channel>,
        request: &SubscriptionRequest,
        log_index: Option<u64>,
    ) -> Result<SubscriptionInfo> {
        let group_name = request.queue_group.as_deref().unwrap_or_default();
        let durable = request.durable_name.as_deref();
        let key = queue_key(group_name, durable);
        let start = channel.start_cursor(request.start)?;

        let (group, member) = loop {
            let group = {
                let mut subs = channel.subs();
                subs.queues
                    .entry(key.clone())
                    .or_insert_with(|| QueueGroup::new(group_name, durable, start))
                    .clone()
            };
            let mut g = group.lock();
            if g.deleted {
                drop(g);
                let mut subs = channel.subs();
                if subs.queues.get(&key).is_some_and(|cur| Arc::ptr_eq(cur, &group)) {
                    subs.queues.remove(&key);
                }
                continue;
            }

            let member = if let Some(shadow) = g.shadow.take() {
                let mut guard = shadow.lock();
                if let Err(err) = check_rebind_window(guard.pending.len(), request.max_in_flight) {
                    drop(guard);
                    g.shadow = Some(shadow);
                    return Err(err);
                }
                let mut state = guard.state.clone();
                state.client_id = request.client_id.clone();
                state.inbox = request.inbox.clone();
                state.max_in_flight = request.max_in_flight;
                state.ack_wait_ms = request.ack_wait_ms;
                state.is_closed = false;
                state.log_index = log_index;
                if let Err(err) = channel.store().subs.update_sub(&state) {
                    drop(guard);
                    g.shadow = Some(shadow);
                    return Err(err);
                }
                guard.state = state;
                self.redeliver_all(channel, &shadow, &mut guard);
                drop(guard);
                shadow
            } else {
                let id = channel.allocate_sub_id();
                let mut state = SubState::from_request(id, request, g.last_sent);
                state.log_index = log_index;
                if let Err(err) = channel.store().subs.create_sub(&state) {
                    let empty = g.is_empty();
                    if empty {
                        g.deleted = true;
                    }
                    drop(g);
                    if empty {
                        channel.subs().queues.remove(&key);
                    }
                    return Err(err);
                }
                let member = Subscription::new(state, []);
                channel.index(member.clone(), Some(group.clone()));
                member
            };
            g.members.push(member.clone());
            drop(g);
            break (group, member);
        };

        self.clients.add_sub(&request.client_id, &channel.name, member.id);
        info!(channel = %channel.name, sub_id = member.id, queue = %key, "queue member joined");
        if let Err(err) = self.send_to_queue(channel, &group) {
            warn!(channel = %channel.name, queue = %key, error = %err, "queue delivery failed");
        }
        Ok(info_of(&member))
    }

    pub(crate) fn ack_local(&self, channel_name: &str, sub_id: u64, seq: u64) -> Result<()> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| BrokerError::not_found("channel", channel_name))?;
        let entry = channel
            .find(sub_id)
            .ok_or_else(|| BrokerError::not_found("subscription", sub_id.to_string()))?;
        {
            let mut guard = entry.sub.lock();
            if !guard.pending.contains_key(&seq) {
                debug!(channel = %channel_name, sub_id, seq, "ignoring ack for a sequence that is not pending");
                return Ok(());
            }
            channel.store().subs.ack_seq_pending(sub_id, seq)?;
            guard.pending.remove(&seq);
            if guard.pending.is_empty() {
                guard.cancel_timer();
            }
        }
        self.replicate_send_and_ack(channel_name, sub_id, Vec::new(), vec![seq]);
        self.dispatch(&channel, &entry.sub, entry.group.as_ref())
    }

    /// Closes (`close == true`) or removes a subscription.
    pub(crate) fn remove_local(&self, channel_name: &str, sub_id: u64, close: bool) -> Result<()> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| BrokerError::not_found("channel", channel_name))?;
        let entry = channel
            .find(sub_id)
            .ok_or_else(|| BrokerError::not_found("subscription", sub_id.to_string()))?;
        if let Some(group) = &entry.group {
            return self.remove_queue_member(&channel, group, &entry.sub, close);
        }

        let sub = &entry.sub;
        let (client_id, durable) = {
            let guard = sub.lock();
            (guard.state.client_id.clone(), guard.state.durable_name.clone())
        };
        if close && durable.is_some() {
            let mut guard = sub.lock();
            if guard.state.is_closed {
                return Ok(());
            }
            let mut state = guard.state.clone();
            state.is_closed = true;
            channel.store().subs.update_sub(&state)?;
            guard.state = state;
            guard.cancel_timer();
            info!(channel = %channel_name, sub_id, "durable subscription closed");
        } else {
            channel.store().subs.delete_sub(sub_id)?;
            sub.mark_removed();
            channel.unindex(sub_id);
            if let Some(durable) = durable {
                channel.subs().durables.remove(&durable_key(&client_id, &durable));
            }
            info!(channel = %channel_name, sub_id, "subscription removed");
        }
        self.clients.remove_sub(&client_id, channel_name, sub_id);
        Ok(())
    }

    fn remove_queue_member(
        &self,
        channel: &Arc<Channel>,
        group: &Arc<QueueGroup>,
        sub: &Arc<Subscription>,
        close: bool,
    ) -> Result<()> {
        let client_id = sub.client_id();
        let mut g = group.lock();

        let Some(idx) = g.members.iter().position(|m| m.id == sub.id) else {
            // A shadow or retired member: only an unsubscribe touches it.
            if close {
                return Ok(());
            }
            self.carry_queue_cursor(channel, &g, Some(sub.id))?;
            channel.store().subs.delete_sub(sub.id)?;
            sub.mark_removed();
            g.retired.retain(|m| m.id != sub.id);
            if g.shadow.as_ref().is_some_and(|s| s.id == sub.id) {
                g.shadow = None;
            }
            let empty = g.is_empty();
            if empty {
                g.deleted = true;
            }
            drop(g);
            channel.unindex(sub.id);
            if empty {
                channel.subs().queues.remove(&group.key);
            }
            return Ok(());
        };

        let last_member = g.members.len() == 1;
        let mut remove_group = false;
        if last_member && group.is_durable() && close {
            let mut guard = sub.lock();
            let mut state = guard.state.clone();
            state.is_closed = true;
            state.last_sent = state.last_sent.max(g.last_sent);
            channel.store().subs.update_sub(&state)?;
            guard.state = state;
            guard.cancel_timer();
            drop(guard);
            g.members.remove(idx);
            g.shadow = Some(sub.clone());
            info!(channel = %channel.name, sub_id = sub.id, queue = %group.key, "last durable queue member closed");
        } else if last_member {
            channel.store().subs.delete_sub(sub.id)?;
            for retired in std::mem::take(&mut g.retired) {
                channel.store().subs.delete_sub(retired.id)?;
                retired.mark_removed();
                channel.unindex(retired.id);
            }
            sub.mark_removed();
            g.members.remove(idx);
            g.deleted = true;
            remove_group = true;
            info!(channel = %channel.name, sub_id = sub.id, queue = %group.key, "queue group removed");
        } else {
            self.carry_queue_cursor(channel, &g, Some(sub.id))?;
            let mut guard = sub.lock();
            guard.cancel_timer();
            if guard.pending.is_empty() {
                channel.store().subs.delete_sub(sub.id)?;
                guard.removed = true;
                drop(guard);
                channel.unindex(sub.id);
            } else {
                let mut state = guard.state.clone();
                state.is_closed = true;
                channel.store().subs.update_sub(&state)?;
                guard.state = state;
                drop(guard);
                g.retired.push(sub.clone());
            }
            g.members.remove(idx);
            info!(channel = %channel.name, sub_id = sub.id, queue = %group.key, "queue member left");
        }
        drop(g);

        if remove_group {
            channel.unindex(sub.id);
            channel.subs().queues.remove(&group.key);
        }
        self.clients.remove_sub(&client_id, &channel.name, sub.id);
        if !remove_group {
            if let Err(err) = self.send_to_queue(channel, group) {
                warn!(channel = %channel.name, queue = %group.key, error = %err, "queue delivery failed");
            }
        }
        Ok(())
    }

    pub(crate) fn delete_channel_local(&self, name: &str) -> Result<()> {
        let channel = self
            .channels
            .remove(name)
            .ok_or_else(|| BrokerError::not_found("channel", name))?;
        for sub in channel.all_subscriptions() {
            sub.mark_removed();
        }
        self.clients.remove_channel(name);
        self.store.delete_channel(name)?;
        info!(channel = %name, "channel deleted");
        Ok(())
    }

    /// Applies sequences the leader sent and acks it received.
    fn apply_send_and_ack(&self, channel_name: &str, sub_id: u64, sent: &[u64], acked: &[u64]) -> Result<()> {
        let Some(channel) = self.channels.get(channel_name) else {
            debug!(channel = %channel_name, sub_id, "send/ack for unknown channel");
            return Ok(());
        };
        let Some(entry) = channel.find(sub_id) else {
            debug!(channel = %channel_name, sub_id, "send/ack for unknown subscription");
            return Ok(());
        };
        let group_guard = entry.group.as_ref().map(|g| g.lock());
        let mut guard = entry.sub.lock();
        let now = Instant::now();
        let deadline = now + guard.state.ack_wait();
        for &seq in sent {
            channel.store().subs.add_seq_pending(sub_id, seq)?;
            guard.state.last_sent = guard.state.last_sent.max(seq);
            guard.pending.insert(
                seq,
                PendingAck {
                    deadline,
                    redeliveries: 0,
                },
            );
        }
        for &seq in acked {
            channel.store().subs.ack_seq_pending(sub_id, seq)?;
            guard.pending.remove(&seq);
        }
        if let (Some(mut g), Some(max)) = (group_guard, sent.iter().max()) {
            g.last_sent = g.last_sent.max(*max);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Delivery
    // ---------------------------------------------------------------------

    /// Offers the available messages of `channel` to every subscription.
    fn deliver_channel(&self, channel: &Channel) {
        if !self.is_delivering() {
            return;
        }
        let (plain, queues) = channel.targets();
        for sub in plain {
            if let Err(err) = self.send_available_messages(channel, &sub) {
                warn!(channel = %channel.name, sub_id = sub.id, error = %err, "delivery failed");
            }
        }
        for group in queues {
            if let Err(err) = self.send_to_queue(channel, &group) {
                warn!(channel = %channel.name, queue = %group.key, error = %err, "queue delivery failed");
            }
        }
    }

    fn dispatch(&self, channel: &Channel, sub: &Arc<Subscription>, group: Option<&Arc<QueueGroup>>) -> Result<()> {
        match group {
            Some(group) => self.send_to_queue(channel, group),
            None => self.send_available_messages(channel, sub),
        }
    }

    /// Sends `last_sent + 1 ..= last` to a non-queue subscription while its
    /// window has room.
    ///
    /// The upper bound is read from the channel cursor before each lookup,
    /// so a lookup miss is a real gap, never a message still being stored.
    pub(crate) fn send_available_messages(&self, channel: &Channel, sub: &Arc<Subscription>) -> Result<()> {
        if !self.is_delivering() {
            return Ok(());
        }
        let mut guard = sub.lock();
        while guard.has_capacity() {
            let Some(next) = channel.next_after(guard.state.last_sent)? else {
                break;
            };
            match channel.lookup(next, self.settings.lookup_retries)? {
                Some(msg) => self.send_msg_to_sub(channel, sub, &mut guard, &msg)?,
                None => {
                    warn!(channel = %channel.name, sub_id = sub.id, seq = next, "skipping missing sequence");
                    let mut state = guard.state.clone();
                    state.last_sent = next;
                    channel.store().subs.update_sub(&state)?;
                    guard.state = state;
                }
            }
        }
        Ok(())
    }

    /// Dispatches new messages of a queue group, and first hands the pending
    /// sequences of retired members to members with room.
    fn send_to_queue(&self, channel: &Channel, group: &Arc<QueueGroup>) -> Result<()> {
        if !self.is_delivering() {
            return Ok(());
        }
        let mut g = group.lock();
        if g.deleted {
            return Ok(());
        }
        self.transfer_retired(channel, &mut g)?;
        loop {
            let Some(next) = channel.next_after(g.last_sent)? else {
                break;
            };
            let Some(member) = g.pick_member() else {
                break;
            };
            match channel.lookup(next, self.settings.lookup_retries)? {
                Some(msg) => {
                    let tick = g.next_tick();
                    let mut guard = member.lock();
                    self.send_msg_to_sub(channel, &member, &mut guard, &msg)?;
                    guard.last_used = tick;
                    g.last_sent = next;
                }
                None => {
                    warn!(channel = %channel.name, queue = %group.key, seq = next, "skipping missing sequence");
                    g.last_sent = next;
                    self.carry_queue_cursor(channel, &g, None)?;
                }
            }
        }
        Ok(())
    }

    fn transfer_retired(&self, channel: &Channel, g: &mut QueueInner) -> Result<()> {
        let retired = g.retired.clone();
        for leaver in retired {
            let seqs: Vec<u64> = leaver.lock().pending.keys().copied().collect();
            for seq in seqs {
                let Some(member) = g.pick_member() else {
                    return Ok(());
                };
                let msg = channel.lookup(seq, self.settings.lookup_retries)?;
                if msg.is_some() {
                    channel.store().subs.add_seq_pending(member.id, seq)?;
                }
                channel.store().subs.ack_seq_pending(leaver.id, seq)?;
                leaver.lock().pending.remove(&seq);
                if let Some(msg) = msg {
                    let tick = g.next_tick();
                    let mut guard = member.lock();
                    let redeliveries = 1;
                    let ack_wait = guard.state.ack_wait();
                    guard.state.last_sent = guard.state.last_sent.max(seq);
                    guard.pending.insert(
                        seq,
                        PendingAck {
                            deadline: Instant::now() + self.settings.redelivery_delay(ack_wait, redeliveries),
                            redeliveries,
                        },
                    );
                    guard.last_used = tick;
                    self.deliver(&guard.state, member.id, &msg, redeliveries);
                    self.arm_timer(&channel.name, &member, &mut guard);
                    self.replicate_send_and_ack(&channel.name, member.id, vec![seq], Vec::new());
                }
                self.replicate_send_and_ack(&channel.name, leaver.id, Vec::new(), vec![seq]);
                debug!(channel = %channel.name, seq, from = leaver.id, to = member.id, "pending sequence handed over");
            }
            if leaver.lock().pending.is_empty() {
                self.carry_queue_cursor(channel, g, Some(leaver.id))?;
                channel.store().subs.delete_sub(leaver.id)?;
                leaver.mark_removed();
                g.retired.retain(|m| m.id != leaver.id);
                channel.unindex(leaver.id);
            }
        }
        Ok(())
    }

    /// Raises the stored `last_sent` of a record that stays in the group
    /// (a member, else the shadow, else a retired member) to the group
    /// cursor. Must run before any other record of the group is deleted:
    /// recovery rebuilds the cursor from the records that are left.
    fn carry_queue_cursor(&self, channel: &Channel, g: &QueueInner, leaving: Option<u64>) -> Result<()> {
        let Some(keeper) = g
            .members
            .iter()
            .chain(g.shadow.iter())
            .chain(g.retired.iter())
            .find(|s| Some(s.id) != leaving)
        else {
            return Ok(());
        };
        let mut guard = keeper.lock();
        if guard.state.last_sent >= g.last_sent {
            return Ok(());
        }
        let mut state = guard.state.clone();
        state.last_sent = g.last_sent;
        channel.store().subs.update_sub(&state)?;
        guard.state = state;
        Ok(())
    }

    /// Records `msg` as pending, then hands it to the transport.
    ///
    /// The pending entry is persisted first: a crash after the send cannot
    /// lose track of it. A failed send leaves it pending for the timer.
    fn send_msg_to_sub(&self, channel: &Channel, sub: &Arc<Subscription>, guard: &mut SubInner, msg: &Message) -> Result<()> {
        channel.store().subs.add_seq_pending(sub.id, msg.sequence)?;
        guard.state.last_sent = guard.state.last_sent.max(msg.sequence);
        guard.pending.insert(
            msg.sequence,
            PendingAck {
                deadline: Instant::now() + guard.state.ack_wait(),
                redeliveries: 0,
            },
        );
        self.deliver(&guard.state, sub.id, msg, 0);
        self.arm_timer(&channel.name, sub, guard);
        self.replicate_send_and_ack(&channel.name, sub.id, vec![msg.sequence], Vec::new());
        Ok(())
    }

    fn deliver(&self, state: &SubState, sub_id: u64, msg: &Message, redeliveries: u32) {
        let delivery = MsgDelivery::new(sub_id, msg, redeliveries);
        match self.transport.send(&state.inbox, &delivery) {
            Ok(()) => debug!(channel = %msg.channel, sub_id, seq = msg.sequence, redeliveries, "message sent"),
            Err(err) => warn!(channel = %msg.channel, sub_id, seq = msg.sequence, error = %err, "send failed, left pending"),
        }
    }

    /// Sends every pending sequence again, flagged as redelivered.
    fn redeliver_all(&self, channel: &Channel, sub: &Arc<Subscription>, guard: &mut SubInner) {
        if !self.is_delivering() {
            return;
        }
        let now = Instant::now();
        let ack_wait = guard.state.ack_wait();
        let seqs: Vec<u64> = guard.pending.keys().copied().collect();
        for seq in seqs {
            let msg = match channel.lookup(seq, self.settings.lookup_retries) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(err) => {
                    warn!(channel = %channel.name, sub_id = sub.id, seq, error = %err, "lookup for redelivery failed");
                    continue;
                }
            };
            let Some(pending) = guard.pending.get_mut(&seq) else {
                continue;
            };
            pending.redeliveries += 1;
            pending.deadline = now + self.settings.redelivery_delay(ack_wait, pending.redeliveries);
            let redeliveries = pending.redeliveries;
            self.deliver(&guard.state, sub.id, &msg, redeliveries);
        }
        self.arm_timer(&channel.name, sub, guard);
    }

    /// Makes sure a timer fires at the earliest pending deadline.
    fn arm_timer(&self, channel: &str, sub: &Arc<Subscription>, guard: &mut SubInner) {
        let Some(deadline) = guard.next_deadline() else {
            guard.cancel_timer();
            return;
        };
        if !self.is_delivering() {
            return;
        }
        if guard.timer.as_ref().is_some_and(|(at, _)| *at <= deadline) {
            return;
        }
        guard.cancel_timer();
        let broker = self.self_ref.clone();
        let channel = channel.to_string();
        let sub_id = sub.id;
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(broker) = broker.upgrade() {
                broker.handle_ack_timeout(&channel, sub_id);
            }
        });
        guard.timer = Some((deadline, handle));
    }

    /// Redelivers every pending sequence whose deadline passed.
    ///
    /// Membership is re-checked under the subscription lock, so an ack that
    /// won the race cancels the redelivery.
    pub(crate) fn handle_ack_timeout(&self, channel_name: &str, sub_id: u64) {
        if !self.is_delivering() {
            return;
        }
        let Some(channel) = self.channels.get(channel_name) else {
            return;
        };
        let Some(entry) = channel.find(sub_id) else {
            return;
        };
        let sub = &entry.sub;
        let mut freed = false;
        {
            let mut guard = sub.lock();
            // Dropping our own handle detaches it; aborting would be a no-op.
            guard.timer.take();
            if guard.removed || guard.state.is_closed {
                return;
            }
            let now = Instant::now();
            let ack_wait = guard.state.ack_wait();
            let expired: Vec<u64> = guard
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in expired {
                match channel.lookup(seq, self.settings.lookup_retries) {
                    Ok(Some(msg)) => {
                        let Some(pending) = guard.pending.get_mut(&seq) else {
                            continue;
                        };
                        pending.redeliveries += 1;
                        pending.deadline = now + self.settings.redelivery_delay(ack_wait, pending.redeliveries);
                        let redeliveries = pending.redeliveries;
                        self.deliver(&guard.state, sub_id, &msg, redeliveries);
                    }
                    Ok(None) => {
                        debug!(channel = %channel_name, sub_id, seq, "pending message no longer stored, dropping it");
                        match channel.store().subs.ack_seq_pending(sub_id, seq) {
                            Ok(()) => {
                                guard.pending.remove(&seq);
                                freed = true;
                            }
                            Err(err) => {
                                warn!(channel = %channel_name, sub_id, seq, error = %err, "failed to drop evicted pending sequence");
                                if let Some(pending) = guard.pending.get_mut(&seq) {
                                    pending.deadline = now + ack_wait;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(channel = %channel_name, sub_id, seq, error = %err, "lookup for redelivery failed");
                        if let Some(pending) = guard.pending.get_mut(&seq) {
                            pending.deadline = now + ack_wait;
                        }
                    }
                }
            }
            self.arm_timer(channel_name, sub, &mut guard);
        }
        if freed {
            if let Err(err) = self.dispatch(&channel, sub, entry.group.as_ref()) {
                warn!(channel = %channel_name, sub_id, error = %err, "delivery after redelivery failed");
            }
        }
    }

    /// Re-arms timers and offers available messages everywhere.
    fn resume_delivery(&self) {
        if !self.is_delivering() {
            return;
        }
        for channel in self.channels.all() {
            for sub in channel.all_subscriptions() {
                let mut guard = sub.lock();
                if !guard.removed && !guard.state.is_closed {
                    self.arm_timer(&channel.name, &sub, &mut guard);
                }
            }
            self.deliver_channel(&channel);
        }
    }

    fn stop_timers(&self) {
        for channel in self.channels.all() {
            for sub in channel.all_subscriptions() {
                sub.lock().cancel_timer();
            }
        }
    }

    fn replicate_send_and_ack(&self, channel: &str, sub_id: u64, sent: Vec<u64>, acked: Vec<u64>) {
        if let Some(r) = self.replication.get() {
            r.replicate(ReplicatedOp::SendAndAck {
                channel: channel.to_string(),
                sub_id,
                sent,
                acked,
            });
        }
    }

    // ---------------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------------

    fn recover(&self, state: RecoveredState) -> Result<()> {
        for client in state.clients {
            if let Err(err) = self.clients.register(client) {
                warn!(error = %err, "duplicate client in store");
            }
        }
        let channel_count = state.channels.len();
        let mut sub_count = 0;
        for recovered in state.channels {
            sub_count += recovered.subscriptions.len();
            self.rebuild_channel(recovered, None)?;
        }
        info!(
            store = self.store.name(),
            clients = self.clients.len(),
            channels = channel_count,
            subscriptions = sub_count,
            "state recovered"
        );
        Ok(())
    }

    /// Rebuilds a channel, its subscriptions and queue groups from stored
    /// records. Pending sequences are due `ack_wait` from now.
    fn rebuild_channel(&self, recovered: RecoveredChannel, next_sub_id: Option<u64>) -> Result<Arc<Channel>> {
        let channel = Arc::new(Channel::new(&recovered.name, recovered.store)?);
        if let Some(next) = next_sub_id {
            channel.reserve_sub_id(next.saturating_sub(1));
        }
        let mut groups: Vec<(Arc<QueueGroup>, Vec<RecoveredSubscription>)> = Vec::new();

        for rs in recovered.subscriptions {
            channel.reserve_sub_id(rs.state.id);
            if let Some(group_name) = rs.state.queue_group.clone() {
                let key = queue_key(&group_name, rs.state.durable_name.as_deref());
                match groups.iter_mut().find(|(g, _)| g.key == key) {
                    Some((_, members)) => members.push(rs),
                    None => groups.push((
                        QueueGroup::new(&group_name, rs.state.durable_name.as_deref(), 0),
                        vec![rs],
                    )),
                }
                continue;
            }
            if !rs.state.is_durable && !self.clients.contains(&rs.state.client_id) {
                debug!(channel = %channel.name, sub_id = rs.state.id, "dropping subscription of a gone client");
                channel.store().subs.delete_sub(rs.state.id)?;
                continue;
            }
            let sub = Subscription::new(rs.state, rs.pending);
            let (client_id, durable, closed) = {
                let guard = sub.lock();
                (guard.state.client_id.clone(), guard.state.durable_name.clone(), guard.state.is_closed)
            };
            if let Some(durable) = durable {
                channel.subs().durables.insert(durable_key(&client_id, &durable), sub.id);
            }
            if !closed {
                self.clients.add_sub(&client_id, &channel.name, sub.id);
            }
            channel.index(sub, None);
        }

        for (group, records) in groups {
            self.rebuild_queue(&channel, &group, records)?;
        }
        self.channels.insert(channel.clone());
        Ok(channel)
    }

    fn rebuild_queue(&self, channel: &Channel, group: &Arc<QueueGroup>, records: Vec<RecoveredSubscription>) -> Result<()> {
        let mut g = group.lock();
        let any_active = records.iter().any(|r| !r.state.is_closed);
        let shadow_id = if !any_active && group.is_durable() {
            records.iter().max_by_key(|r| r.state.last_sent).map(|r| r.state.id)
        } else {
            None
        };
        g.last_sent = records.iter().map(|r| r.state.last_sent).fold(g.last_sent, u64::max);
        let mut dropped = Vec::new();
        for rs in records {
            let id = rs.state.id;
            let closed = rs.state.is_closed;
            let client_id = rs.state.client_id.clone();
            if !closed && !self.clients.contains(&client_id) && !group.is_durable() {
                dropped.push(id);
                continue;
            }
            if closed && Some(id) != shadow_id && (rs.pending.is_empty() || (!any_active && !group.is_durable())) {
                dropped.push(id);
                continue;
            }
            let sub = Subscription::new(rs.state, rs.pending);
            if Some(id) == shadow_id {
                g.shadow = Some(sub.clone());
            } else if closed {
                g.retired.push(sub.clone());
            } else {
                self.clients.add_sub(&client_id, &channel.name, id);
                g.members.push(sub.clone());
            }
            channel.index(sub, Some(group.clone()));
        }
        self.carry_queue_cursor(channel, &g, None)?;
        for id in dropped {
            channel.store().subs.delete_sub(id)?;
        }
        let empty = g.is_empty();
        drop(g);
        if !empty {
            channel.subs().queues.insert(group.key.clone(), group.clone());
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Replicated state machine
    // ---------------------------------------------------------------------

    /// Applies the decoded entry at `index`.
    ///
    /// Publishes and subscribes are tagged with `index`, so an entry that is
    /// applied again after a crash finds its own effects and leaves them be.
    /// The other operations leave the same state when repeated.
    fn apply_entry(&self, index: u64, entry: LogEntry) -> Result<ApplyResponse> {
        debug!(index, op = entry.op.kind(), origin = %entry.origin, "applying entry");
        match entry.op {
            ReplicatedOp::Connect {
                client_id,
                connected_at,
            } => self
                .connect_local(ClientInfo {
                    id: client_id,
                    connected_at,
                })
                .map(|_| ApplyResponse::Done),
            ReplicatedOp::Disconnect { client_id } => {
                self.disconnect_local(&client_id).map(|_| ApplyResponse::Done)
            }
            ReplicatedOp::PublishBatch { mut messages } => {
                for (offset, msg) in messages.iter_mut().enumerate() {
                    msg.position = Some(LogPosition {
                        index,
                        offset: offset as u32,
                    });
                }
                self.publish_local(messages).map(ApplyResponse::Published)
            }
            ReplicatedOp::Subscribe { request } => {
                if let Some(sub) = self.subscribed_at(&request.channel, index) {
                    debug!(index, sub_id = sub.id, "subscription already applied");
                    return Ok(ApplyResponse::Subscribed(info_of(&sub)));
                }
                self.subscribe_local(&request, Some(index))
                    .map(ApplyResponse::Subscribed)
            }
            ReplicatedOp::RemoveSubscription { channel, sub_id } => self
                .remove_local(&channel, sub_id, false)
                .map(|_| ApplyResponse::Done),
            ReplicatedOp::CloseSubscription { channel, sub_id } => self
                .remove_local(&channel, sub_id, true)
                .map(|_| ApplyResponse::Done),
            ReplicatedOp::SendAndAck {
                channel,
                sub_id,
                sent,
                acked,
            } => {
                // The delivering node already applied its own sends and acks.
                if self.node_id() == Some(entry.origin.as_str()) {
                    return Ok(ApplyResponse::Done);
                }
                self.apply_send_and_ack(&channel, sub_id, &sent, &acked)
                    .map(|_| ApplyResponse::Done)
            }
            ReplicatedOp::DeleteChannel { channel } => self
                .delete_channel_local(&channel)
                .map(|_| ApplyResponse::Done),
        }
    }

    /// The subscription on `channel` last created or re-bound by entry `index`.
    fn subscribed_at(&self, channel: &str, index: u64) -> Option<Arc<Subscription>> {
        self.channels
            .get(channel)?
            .all_subscriptions()
            .into_iter()
            .find(|sub| sub.lock().state.log_index == Some(index))
    }

    fn build_snapshot(&self) -> Result<ServerSnapshot> {
        let mut channels = Vec::new();
        for channel in self.channels.all() {
            let subscriptions = channel
                .all_subscriptions()
                .iter()
                .map(|s| s.snapshot())
                .collect();
            channels.push(ChannelSnapshot {
                name: channel.name.clone(),
                first: channel.first_sequence()?,
                last: channel.last_sequence(),
                next_sub_id: channel.next_sub_id(),
                subscriptions,
            });
        }
        Ok(ServerSnapshot {
            last_applied: self.last_applied.load(Ordering::Acquire),
            clients: self.clients.infos(),
            channels,
        })
    }

    fn install_snapshot(&self, snapshot: ServerSnapshot, source: &dyn MessageSource) -> Result<()> {
        self.stop_timers();
        for channel in self.channels.all() {
            for sub in channel.all_subscriptions() {
                sub.mark_removed();
            }
            self.store.delete_channel(&channel.name)?;
        }
        self.channels.clear();
        for id in self.clients.ids() {
            self.store.delete_client(&id)?;
        }
        self.clients.clear();

        for client in &snapshot.clients {
            self.store.add_client(client)?;
            self.clients.register(client.clone())?;
        }
        for cs in snapshot.channels {
            let store = match self.store.create_channel(&cs.name) {
                Ok(store) => store,
                Err(BrokerError::AlreadyExists { .. }) => {
                    self.store.delete_channel(&cs.name)?;
                    self.store.create_channel(&cs.name)?
                }
                Err(err) => return Err(err),
            };
            store.msgs.set_first_sequence(cs.first)?;
            let mut fetched = 0usize;
            for seq in cs.first..=cs.last {
                if let Some(msg) = source.fetch(&cs.name, seq)? {
                    store.msgs.store(&msg)?;
                    fetched += 1;
                }
            }
            let mut subscriptions = Vec::with_capacity(cs.subscriptions.len());
            for ss in cs.subscriptions {
                store.subs.create_sub(&ss.state)?;
                for &seq in &ss.pending {
                    store.subs.add_seq_pending(ss.state.id, seq)?;
                }
                subscriptions.push(RecoveredSubscription {
                    state: ss.state,
                    pending: ss.pending.into_iter().collect::<BTreeSet<u64>>(),
                });
            }
            let channel = self.rebuild_channel(
                RecoveredChannel {
                    name: cs.name.clone(),
                    store,
                    subscriptions,
                },
                Some(cs.next_sub_id),
            )?;
            channel.restore_last_sequence(cs.last);
            debug!(channel = %cs.name, first = cs.first, last = cs.last, fetched, "channel restored");
        }
        self.last_applied.store(snapshot.last_applied, Ordering::Release);
        self.store.set_last_applied_index(snapshot.last_applied)?;
        info!(index = snapshot.last_applied, "snapshot installed");
        self.resume_delivery();
        Ok(())
    }
}

impl StateMachine for Broker {
    fn apply(&self, index: u64, data: &[u8]) -> Result<ApplyResponse> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        if index <= self.last_applied.load(Ordering::Acquire) {
            debug!(index, "skipping already applied entry");
            return Ok(ApplyResponse::Skipped);
        }
        let result = LogEntry::decode(data).and_then(|entry| self.apply_entry(index, entry));
        // A deterministic failure fails the same way on every node: the
        // entry still counts as applied. An index that cannot be recorded
        // does not count, and the entry is applied again later.
        if let Err(err) = self.store.set_last_applied_index(index) {
            error!(index, error = %err, "failed to persist applied index");
            return Err(err);
        }
        self.last_applied.store(index, Ordering::Release);
        result
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.build_snapshot()?.encode()
    }

    fn restore(&self, data: &[u8], source: &dyn MessageSource) -> Result<()> {
        let snapshot = ServerSnapshot::decode(data)?;
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.install_snapshot(snapshot, source)
    }

    fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    fn leadership_changed(&self, is_leader: bool) {
        if is_leader {
            info!(node = ?self.node_id(), "gained leadership, resuming delivery");
            for channel in self.channels.all() {
                for sub in channel.all_subscriptions() {
                    sub.lock().reset_deadlines(Instant::now());
                }
            }
            self.resume_delivery();
        } else {
            info!(node = ?self.node_id(), "lost leadership, stopping delivery");
            self.stop_timers();
        }
    }
}

impl MessageSource for Broker {
    fn fetch(&self, channel: &str, seq: u64) -> Result<Option<Message>> {
        match self.channels.get(channel) {
            Some(c) => c.lookup(seq, self.settings.lookup_retries),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("store", &self.store.name())
            .field("channels", &self.channels.names())
            .field("clients", &self.clients.len())
            .finish()
    }
}

fn info_of(sub: &Subscription) -> SubscriptionInfo {
    let guard = sub.lock();
    SubscriptionInfo {
        id: sub.id,
        channel: sub.channel.clone(),
        inbox: guard.state.inbox.clone(),
        durable_name: guard.state.durable_name.clone(),
        queue_group: guard.state.queue_group.clone(),
    }
}

/// A re-bind keeps the pending set, so the new window has to hold it.
fn check_rebind_window(pending: usize, max_in_flight: usize) -> Result<()> {
    if max_in_flight < pending {
        return Err(BrokerError::InvalidRequest(format!(
            "max_in_flight {max_in_flight} is below the {pending} unacknowledged messages being re-bound"
        )));
    }
    Ok(())
}

fn unexpected(op: &str, response: &ApplyResponse) -> BrokerError {
    BrokerError::Codec(format!("unexpected response to {op}: {response:?}"))
}
