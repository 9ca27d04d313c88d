use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use super::channel::Channel;
use super::message::{Message, MsgDelivery, StartPosition, SubscriptionRequest};
use super::{Broker, SubStatus};
use crate::config::DeliverySettings;
use crate::persistence::{MemoryStore, Store, StoreLimits};
use crate::transport::LocalTransport;
use crate::utils::BrokerError;

struct Harness {
    broker: Arc<Broker>,
    transport: Arc<LocalTransport>,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(LocalTransport::new());
        let broker = Broker::new(
            DeliverySettings::default(),
            Arc::new(MemoryStore::default()),
            transport.clone(),
        )
        .unwrap();
        Self { broker, transport }
    }

    async fn client(&self, id: &str) -> UnboundedReceiver<MsgDelivery> {
        self.broker.connect(id).await.unwrap();
        self.transport.register(id)
    }

    async fn publish(&self, channel: &str, n: usize) -> Vec<u64> {
        let mut seqs = Vec::with_capacity(n);
        for i in 0..n {
            let seq = self
                .broker
                .publish(channel, format!("msg-{i}").into_bytes())
                .await
                .unwrap();
            seqs.push(seq);
        }
        seqs
    }
}

fn request(client: &str, channel: &str, max_in_flight: usize) -> SubscriptionRequest {
    SubscriptionRequest::new(client, channel, client, max_in_flight)
}

fn drain(rx: &mut UnboundedReceiver<MsgDelivery>) -> Vec<MsgDelivery> {
    let mut out = Vec::new();
    while let Ok(d) = rx.try_recv() {
        out.push(d);
    }
    out
}

fn seqs(deliveries: &[MsgDelivery]) -> Vec<u64> {
    deliveries.iter().map(|d| d.sequence).collect()
}

#[test]
fn test_channel_append_and_start_cursor() {
    let store = MemoryStore::default();
    let channel = Channel::new("foo", store.create_channel("foo").unwrap()).unwrap();
    for i in 1..=3 {
        let seq = channel.append(Message::new("ignored", vec![i])).unwrap();
        assert_eq!(seq, i as u64);
    }
    let stored = channel.lookup(2, 0).unwrap().unwrap();
    assert_eq!(stored.channel, "foo");
    assert_eq!(stored.payload, vec![2]);

    assert_eq!(channel.last_sequence(), 3);
    assert_eq!(channel.start_cursor(StartPosition::NewOnly).unwrap(), 3);
    assert_eq!(channel.start_cursor(StartPosition::LastReceived).unwrap(), 2);
    assert_eq!(channel.start_cursor(StartPosition::First).unwrap(), 0);
    assert_eq!(channel.start_cursor(StartPosition::SequenceStart(2)).unwrap(), 1);
    assert_eq!(channel.start_cursor(StartPosition::SequenceStart(0)).unwrap(), 0);
    assert_eq!(channel.start_cursor(StartPosition::SequenceStart(99)).unwrap(), 3);
    assert_eq!(channel.start_cursor(StartPosition::AtTime(0)).unwrap(), 0);
}

#[test]
fn test_channel_skips_evicted_messages() {
    let store = MemoryStore::new(StoreLimits {
        max_msgs: 2,
        max_age: None,
    });
    let channel = Channel::new("foo", store.create_channel("foo").unwrap()).unwrap();
    for _ in 0..4 {
        channel.append(Message::new("foo", b"x".to_vec())).unwrap();
    }
    assert_eq!(channel.first_sequence().unwrap(), 3);
    assert_eq!(channel.next_after(0).unwrap(), Some(3));
    assert_eq!(channel.next_after(3).unwrap(), Some(4));
    assert_eq!(channel.next_after(4).unwrap(), None);
    assert_eq!(channel.start_cursor(StartPosition::First).unwrap(), 2);
}

#[test]
fn test_broker_outside_runtime() {
    let err = Broker::new(
        DeliverySettings::default(),
        Arc::new(MemoryStore::default()),
        Arc::new(LocalTransport::new()),
    )
    .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_connect_duplicate_client() {
    let h = Harness::new();
    h.broker.connect("alice").await.unwrap();
    let err = h.broker.connect("alice").await.unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyExists { kind: "client", .. }));
    assert_eq!(h.broker.client_ids(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_subscribe_requires_connected_client() {
    let h = Harness::new();
    let err = h.broker.subscribe(request("ghost", "foo", 1)).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { kind: "client", .. }));
}

#[tokio::test]
async fn test_subscribe_rejects_invalid_request() {
    let h = Harness::new();
    let _rx = h.client("alice").await;
    let err = h.broker.subscribe(request("alice", "foo", 0)).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
    let err = h.broker.subscribe(request("alice", "", 1)).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_publish_delivers_in_order() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h.broker.subscribe(request("alice", "foo", 100)).await.unwrap();
    assert_eq!(info.id, 1);

    assert_eq!(h.publish("foo", 3).await, vec![1, 2, 3]);
    let got = drain(&mut rx);
    assert_eq!(seqs(&got), vec![1, 2, 3]);
    assert!(got.iter().all(|d| !d.redelivered && d.subscription_id == info.id));
    assert_eq!(got[0].payload, b"msg-0");

    let info = h.broker.channel_info("foo").unwrap();
    assert_eq!(info.first_sequence, 1);
    assert_eq!(info.last_sequence, 3);
    assert_eq!(info.subscriptions, 1);
}

#[tokio::test]
async fn test_start_positions() {
    let h = Harness::new();
    h.publish("foo", 3).await;

    let mut rx = h.client("first").await;
    h.broker
        .subscribe(request("first", "foo", 10).start_at(StartPosition::First))
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut rx)), vec![1, 2, 3]);

    let mut rx = h.client("last").await;
    h.broker
        .subscribe(request("last", "foo", 10).start_at(StartPosition::LastReceived))
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut rx)), vec![3]);

    let mut rx = h.client("new").await;
    h.broker.subscribe(request("new", "foo", 10)).await.unwrap();
    assert!(drain(&mut rx).is_empty());

    let mut rx = h.client("seq").await;
    h.broker
        .subscribe(request("seq", "foo", 10).start_at(StartPosition::SequenceStart(2)))
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut rx)), vec![2, 3]);

    let mut rx = h.client("delta").await;
    h.broker
        .subscribe(
            request("delta", "foo", 10)
                .start_at(StartPosition::TimeDeltaStart(Duration::from_secs(60))),
        )
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut rx)), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_window_bounds_pending() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h.broker.subscribe(request("alice", "foo", 2)).await.unwrap();
    h.publish("foo", 5).await;

    assert_eq!(seqs(&drain(&mut rx)), vec![1, 2]);
    let snap = h.broker.subscription_snapshot("foo", info.id).unwrap();
    assert_eq!(snap.pending, vec![1, 2]);
    assert_eq!(snap.state.last_sent, 2);

    let channel_subs = h.broker.subscriptions("foo");
    assert_eq!(channel_subs.len(), 1);

    h.broker.ack("foo", info.id, 2).await.unwrap();
    assert_eq!(seqs(&drain(&mut rx)), vec![3]);
    let snap = h.broker.subscription_snapshot("foo", info.id).unwrap();
    assert_eq!(snap.pending, vec![1, 3]);
}

#[tokio::test]
async fn test_late_and_duplicate_ack_ignored() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h.broker.subscribe(request("alice", "foo", 1)).await.unwrap();
    h.publish("foo", 2).await;
    assert_eq!(seqs(&drain(&mut rx)), vec![1]);

    // never sent
    h.broker.ack("foo", info.id, 2).await.unwrap();
    assert!(drain(&mut rx).is_empty());

    h.broker.ack("foo", info.id, 1).await.unwrap();
    assert_eq!(seqs(&drain(&mut rx)), vec![2]);
    h.broker.ack("foo", info.id, 1).await.unwrap();
    assert!(drain(&mut rx).is_empty());
    assert_eq!(
        h.broker.subscription_snapshot("foo", info.id).unwrap().pending,
        vec![2]
    );
}

#[tokio::test]
async fn test_ack_unknown_subscription() {
    let h = Harness::new();
    let err = h.broker.ack("nope", 1, 1).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { kind: "channel", .. }));

    h.publish("foo", 1).await;
    let err = h.broker.ack("foo", 42, 1).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { kind: "subscription", .. }));
}

#[tokio::test]
async fn test_redelivery_after_ack_wait() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h
        .broker
        .subscribe(request("alice", "foo", 1).ack_wait(Duration::from_millis(100)))
        .await
        .unwrap();
    h.publish("foo", 2).await;

    let first = rx.recv().await.unwrap();
    assert_eq!(first.sequence, 1);
    assert!(!first.redelivered);

    let again = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(again.sequence, 1);
    assert!(again.redelivered);
    assert_eq!(again.redelivery_count, 1);

    h.broker.ack("foo", info.id, 1).await.unwrap();
    let next = rx.recv().await.unwrap();
    assert_eq!(next.sequence, 2);
    assert!(!next.redelivered);
}

#[tokio::test]
async fn test_ack_cancels_redelivery() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h
        .broker
        .subscribe(request("alice", "foo", 5).ack_wait(Duration::from_millis(100)))
        .await
        .unwrap();
    h.publish("foo", 1).await;
    assert_eq!(seqs(&drain(&mut rx)), vec![1]);
    h.broker.ack("foo", info.id, 1).await.unwrap();

    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "acked message must not come back"
    );
}

#[tokio::test]
async fn test_failed_send_stays_pending() {
    let h = Harness::new();
    h.broker.connect("alice").await.unwrap();
    let info = h
        .broker
        .subscribe(request("alice", "foo", 1).ack_wait(Duration::from_millis(100)))
        .await
        .unwrap();
    h.publish("foo", 1).await;
    assert_eq!(
        h.broker.subscription_snapshot("foo", info.id).unwrap().pending,
        vec![1]
    );

    let mut rx = h.transport.register("alice");
    let d = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(d.sequence, 1);
    assert!(d.redelivered);
}

#[tokio::test]
async fn test_durable_close_and_rebind() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h
        .broker
        .subscribe(request("alice", "foo", 10).durable("dur"))
        .await
        .unwrap();
    h.publish("foo", 3).await;
    assert_eq!(seqs(&drain(&mut rx)), vec![1, 2, 3]);
    h.broker.ack("foo", info.id, 1).await.unwrap();

    h.broker.close_subscription("foo", info.id).await.unwrap();
    let snap = h.broker.subscription_snapshot("foo", info.id).unwrap();
    assert!(snap.state.is_closed);
    assert_eq!(snap.pending, vec![2, 3]);

    h.publish("foo", 1).await;
    assert!(drain(&mut rx).is_empty());

    let again = h
        .broker
        .subscribe(request("alice", "foo", 10).durable("dur"))
        .await
        .unwrap();
    assert_eq!(again.id, info.id);
    let got = drain(&mut rx);
    assert_eq!(seqs(&got), vec![2, 3, 4]);
    assert!(got[0].redelivered && got[1].redelivered);
    assert!(!got[2].redelivered);
}

#[tokio::test]
async fn test_rebind_rejects_window_below_pending() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h
        .broker
        .subscribe(request("alice", "foo", 5).durable("dur"))
        .await
        .unwrap();
    h.publish("foo", 5).await;
    assert_eq!(drain(&mut rx).len(), 5);
    h.broker.close_subscription("foo", info.id).await.unwrap();

    let err = h
        .broker
        .subscribe(request("alice", "foo", 1).durable("dur"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
    let snap = h.broker.subscription_snapshot("foo", info.id).unwrap();
    assert!(snap.state.is_closed);
    assert_eq!(snap.state.max_in_flight, 5);
    assert_eq!(snap.pending.len(), 5);
    assert!(drain(&mut rx).is_empty());

    let again = h
        .broker
        .subscribe(request("alice", "foo", 5).durable("dur"))
        .await
        .unwrap();
    assert_eq!(again.id, info.id);
    let snap = h.broker.subscription_snapshot("foo", info.id).unwrap();
    assert!(snap.pending.len() <= snap.state.max_in_flight);
    assert_eq!(drain(&mut rx).len(), 5);
}

#[tokio::test]
async fn test_active_durable_duplicate() {
    let h = Harness::new();
    let _rx = h.client("alice").await;
    h.broker
        .subscribe(request("alice", "foo", 10).durable("dur"))
        .await
        .unwrap();
    let err = h
        .broker
        .subscribe(request("alice", "foo", 10).durable("dur"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyExists { kind: "durable", .. }));

    // same durable name, other client: a different durable
    let _rx = h.client("bob").await;
    h.broker
        .subscribe(request("bob", "foo", 10).durable("dur"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_and_unsubscribe_remove() {
    let h = Harness::new();
    let _rx = h.client("alice").await;
    let plain = h.broker.subscribe(request("alice", "foo", 1)).await.unwrap();
    let durable = h
        .broker
        .subscribe(request("alice", "foo", 1).durable("dur"))
        .await
        .unwrap();

    h.broker.close_subscription("foo", plain.id).await.unwrap();
    assert!(h.broker.subscription_snapshot("foo", plain.id).is_none());

    h.broker.unsubscribe("foo", durable.id).await.unwrap();
    assert!(h.broker.subscription_snapshot("foo", durable.id).is_none());
    let err = h.broker.unsubscribe("foo", durable.id).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));

    // the durable name is free again and starts a fresh cursor
    let fresh = h
        .broker
        .subscribe(request("alice", "foo", 1).durable("dur"))
        .await
        .unwrap();
    assert_ne!(fresh.id, durable.id);
}

#[tokio::test]
async fn test_disconnect_closes_durables() {
    let h = Harness::new();
    let _rx = h.client("alice").await;
    let plain = h.broker.subscribe(request("alice", "foo", 1)).await.unwrap();
    let durable = h
        .broker
        .subscribe(request("alice", "foo", 1).durable("dur"))
        .await
        .unwrap();

    h.broker.disconnect("alice").await.unwrap();
    assert!(h.broker.client_ids().is_empty());
    assert!(h.broker.subscription_snapshot("foo", plain.id).is_none());
    let snap = h.broker.subscription_snapshot("foo", durable.id).unwrap();
    assert!(snap.state.is_closed);

    let err = h.broker.disconnect("alice").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { kind: "client", .. }));

    // reconnect and re-bind
    let _rx = h.client("alice").await;
    let again = h
        .broker
        .subscribe(request("alice", "foo", 1).durable("dur"))
        .await
        .unwrap();
    assert_eq!(again.id, durable.id);
}

#[tokio::test]
async fn test_queue_group_distribution() {
    let h = Harness::new();
    let mut a = h.client("a").await;
    let mut b = h.client("b").await;
    let qa = h
        .broker
        .subscribe(request("a", "foo", 1).queue("workers"))
        .await
        .unwrap();
    let qb = h
        .broker
        .subscribe(request("b", "foo", 1).queue("workers"))
        .await
        .unwrap();

    h.publish("foo", 3).await;
    let got_a = drain(&mut a);
    let got_b = drain(&mut b);
    assert_eq!(seqs(&got_a), vec![1]);
    assert_eq!(seqs(&got_b), vec![2]);
    assert_eq!(h.broker.queue_last_sent("foo", "workers", None), Some(2));

    h.broker.ack("foo", qb.id, 2).await.unwrap();
    assert_eq!(seqs(&drain(&mut b)), vec![3]);
    assert!(drain(&mut a).is_empty());

    h.broker.ack("foo", qa.id, 1).await.unwrap();
    h.publish("foo", 1).await;
    assert_eq!(seqs(&drain(&mut a)), vec![4]);
}

#[tokio::test]
async fn test_queue_member_inherits_group_cursor() {
    let h = Harness::new();
    let mut a = h.client("a").await;
    h.broker
        .subscribe(request("a", "foo", 10).queue("workers"))
        .await
        .unwrap();
    h.publish("foo", 2).await;
    assert_eq!(seqs(&drain(&mut a)), vec![1, 2]);

    let mut b = h.client("b").await;
    h.broker
        .subscribe(
            request("b", "foo", 10)
                .queue("workers")
                .start_at(StartPosition::First),
        )
        .await
        .unwrap();
    assert!(drain(&mut b).is_empty());
}

#[tokio::test]
async fn test_queue_member_leave_hands_over_pending() {
    let h = Harness::new();
    let mut a = h.client("a").await;
    let mut b = h.client("b").await;
    let qa = h
        .broker
        .subscribe(request("a", "foo", 10).queue("workers"))
        .await
        .unwrap();
    let qb = h
        .broker
        .subscribe(request("b", "foo", 10).queue("workers"))
        .await
        .unwrap();
    h.publish("foo", 2).await;
    assert_eq!(seqs(&drain(&mut a)), vec![1]);
    assert_eq!(seqs(&drain(&mut b)), vec![2]);

    h.broker.close_subscription("foo", qa.id).await.unwrap();
    let handed = drain(&mut b);
    assert_eq!(seqs(&handed), vec![1]);
    assert!(handed[0].redelivered);

    assert!(h.broker.subscription_snapshot("foo", qa.id).is_none());
    assert_eq!(
        h.broker.subscription_snapshot("foo", qb.id).unwrap().pending,
        vec![1, 2]
    );
}

#[tokio::test]
async fn test_durable_queue_keeps_shadow() {
    let h = Harness::new();
    let mut a = h.client("a").await;
    let qa = h
        .broker
        .subscribe(request("a", "foo", 10).queue("workers").durable("dur"))
        .await
        .unwrap();
    h.publish("foo", 2).await;
    assert_eq!(seqs(&drain(&mut a)), vec![1, 2]);
    h.broker.ack("foo", qa.id, 1).await.unwrap();

    h.broker.close_subscription("foo", qa.id).await.unwrap();
    let shadow = h.broker.subscription_snapshot("foo", qa.id).unwrap();
    assert!(shadow.state.is_closed);
    h.publish("foo", 1).await;
    assert!(drain(&mut a).is_empty());
    assert_eq!(h.broker.queue_last_sent("foo", "workers", Some("dur")), Some(2));

    let mut b = h.client("b").await;
    let qb = h
        .broker
        .subscribe(request("b", "foo", 10).queue("workers").durable("dur"))
        .await
        .unwrap();
    assert_eq!(qb.id, qa.id);
    let got = drain(&mut b);
    assert_eq!(seqs(&got), vec![2, 3]);
    assert!(got[0].redelivered);
    assert!(!got[1].redelivered);
    assert_eq!(h.broker.queue_last_sent("foo", "workers", Some("dur")), Some(3));
}

#[tokio::test]
async fn test_shadow_rebind_rejects_window_below_pending() {
    let h = Harness::new();
    let mut a = h.client("a").await;
    let qa = h
        .broker
        .subscribe(request("a", "foo", 3).queue("workers").durable("dur"))
        .await
        .unwrap();
    h.publish("foo", 3).await;
    assert_eq!(drain(&mut a).len(), 3);
    h.broker.close_subscription("foo", qa.id).await.unwrap();

    let mut b = h.client("b").await;
    let err = h
        .broker
        .subscribe(request("b", "foo", 2).queue("workers").durable("dur"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
    let shadow = h.broker.subscription_snapshot("foo", qa.id).unwrap();
    assert!(shadow.state.is_closed);
    assert_eq!(shadow.pending, vec![1, 2, 3]);
    assert!(drain(&mut b).is_empty());

    let qb = h
        .broker
        .subscribe(request("b", "foo", 3).queue("workers").durable("dur"))
        .await
        .unwrap();
    assert_eq!(qb.id, qa.id);
    assert_eq!(seqs(&drain(&mut b)), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unsubscribe_last_queue_member_removes_group() {
    let h = Harness::new();
    let _a = h.client("a").await;
    let qa = h
        .broker
        .subscribe(request("a", "foo", 10).queue("workers").durable("dur"))
        .await
        .unwrap();
    h.publish("foo", 1).await;
    h.broker.unsubscribe("foo", qa.id).await.unwrap();
    assert_eq!(h.broker.queue_last_sent("foo", "workers", Some("dur")), None);
    assert!(h.broker.subscriptions("foo").is_empty());

    // a new group starts from its own position
    let mut b = h.client("b").await;
    h.broker
        .subscribe(
            request("b", "foo", 10)
                .queue("workers")
                .durable("dur")
                .start_at(StartPosition::First),
        )
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut b)), vec![1]);
}

#[tokio::test]
async fn test_delete_channel() {
    let h = Harness::new();
    let mut rx = h.client("alice").await;
    let info = h.broker.subscribe(request("alice", "foo", 10)).await.unwrap();
    h.publish("foo", 2).await;
    drain(&mut rx);

    h.broker.delete_channel("foo").await.unwrap();
    assert!(h.broker.channel_info("foo").is_none());
    assert!(h.broker.subscription_snapshot("foo", info.id).is_none());
    let err = h.broker.delete_channel("foo").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { kind: "channel", .. }));

    // recreated lazily, from scratch
    assert_eq!(h.publish("foo", 1).await, vec![1]);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_shutdown_rejects_operations() {
    let h = Harness::new();
    h.broker.shutdown().await;
    assert!(!h.broker.is_delivering());
    let err = h.broker.publish("foo", b"x".to_vec()).await.unwrap_err();
    assert_eq!(err, BrokerError::Shutdown);
}

#[tokio::test]
async fn test_subscription_status_transitions() {
    let h = Harness::new();
    let _rx = h.client("alice").await;
    let info = h
        .broker
        .subscribe(request("alice", "foo", 1).durable("dur"))
        .await
        .unwrap();
    let status = || h.broker.subscription_status("foo", info.id);
    assert_eq!(status(), Some(SubStatus::Active));

    h.publish("foo", 1).await;
    assert_eq!(status(), Some(SubStatus::Stalled));

    h.broker.ack("foo", info.id, 1).await.unwrap();
    assert_eq!(status(), Some(SubStatus::Active));

    h.broker.close_subscription("foo", info.id).await.unwrap();
    assert_eq!(status(), Some(SubStatus::Closed));

    h.broker.unsubscribe("foo", info.id).await.unwrap();
    assert_eq!(status(), None);
}
