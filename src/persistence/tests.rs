use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tempfile::tempdir;

use super::{MemoryStore, SledStore, Store, StoreLimits, SubState};
use crate::broker::message::{Message, SubscriptionRequest};
use crate::client::ClientInfo;
use crate::utils::BrokerError;

fn msg(channel: &str, seq: u64, payload: &str) -> Message {
    let mut m = Message::new(channel, payload.as_bytes().to_vec());
    m.sequence = seq;
    m
}

fn sub_state(id: u64, channel: &str) -> SubState {
    let req = SubscriptionRequest::new("client-1", channel, "inbox-1", 10);
    SubState::from_request(id, &req, 0)
}

fn stores() -> Vec<Arc<dyn Store>> {
    vec![
        Arc::new(MemoryStore::default()),
        Arc::new(SledStore::temporary(StoreLimits::default()).unwrap()),
    ]
}

#[test]
fn test_store_and_lookup_message() {
    for store in stores() {
        let channel = store.create_channel("orders").unwrap();
        assert_eq!(channel.msgs.last_sequence().unwrap(), 0);
        assert_eq!(channel.msgs.first_sequence().unwrap(), 1);

        assert_eq!(channel.msgs.store(&msg("orders", 1, "a")).unwrap(), 1);
        assert_eq!(channel.msgs.store(&msg("orders", 2, "b")).unwrap(), 2);

        let found = channel.msgs.lookup(2).unwrap().unwrap();
        assert_eq!(found.payload, b"b");
        assert_eq!(found.sequence, 2);
        assert!(channel.msgs.lookup(3).unwrap().is_none(), "{}", store.name());
        assert_eq!(channel.msgs.first_sequence().unwrap(), 1);
        assert_eq!(channel.msgs.last_sequence().unwrap(), 2);
    }
}

#[test]
fn test_store_rejects_non_increasing_sequence() {
    for store in stores() {
        let channel = store.create_channel("orders").unwrap();
        channel.msgs.store(&msg("orders", 5, "a")).unwrap();
        let err = channel.msgs.store(&msg("orders", 5, "b")).unwrap_err();
        assert!(matches!(err, BrokerError::Storage(_)), "{}", store.name());
        // a gap is fine as long as the sequence increases
        assert_eq!(channel.msgs.store(&msg("orders", 7, "c")).unwrap(), 7);
        assert!(channel.msgs.lookup(6).unwrap().is_none());
    }
}

#[test]
fn test_create_channel_twice_fails() {
    for store in stores() {
        store.create_channel("orders").unwrap();
        let err = store.create_channel("orders").unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists { .. }));
    }
}

#[test]
fn test_max_messages_limit() {
    let limits = StoreLimits {
        max_msgs: 3,
        max_age: None,
    };
    let all: Vec<Arc<dyn Store>> = vec![
        Arc::new(MemoryStore::new(limits)),
        Arc::new(SledStore::temporary(limits).unwrap()),
    ];
    for store in all {
        let channel = store.create_channel("limited").unwrap();
        for seq in 1..=5 {
            channel
                .msgs
                .store(&msg("limited", seq, &format!("msg{seq}")))
                .unwrap();
        }
        assert_eq!(channel.msgs.first_sequence().unwrap(), 3, "{}", store.name());
        assert_eq!(channel.msgs.last_sequence().unwrap(), 5);
        assert!(channel.msgs.lookup(2).unwrap().is_none());
        assert_eq!(channel.msgs.lookup(3).unwrap().unwrap().payload, b"msg3");
    }
}

#[test]
fn test_ttl_removes_old_messages() {
    let limits = StoreLimits {
        max_msgs: 0,
        max_age: Some(Duration::from_millis(50)),
    };
    let store = MemoryStore::new(limits);
    let channel = store.create_channel("ttl").unwrap();
    channel.msgs.store(&msg("ttl", 1, "old")).unwrap();
    sleep(Duration::from_millis(120));
    channel.msgs.store(&msg("ttl", 2, "new")).unwrap();

    assert!(channel.msgs.lookup(1).unwrap().is_none());
    assert_eq!(channel.msgs.first_sequence().unwrap(), 2);
}

#[test]
fn test_sequence_from_timestamp() {
    for store in stores() {
        let channel = store.create_channel("ts").unwrap();
        for seq in 1..=3 {
            let mut m = msg("ts", seq, "x");
            m.timestamp = 1_000 * seq as i64;
            channel.msgs.store(&m).unwrap();
        }
        assert_eq!(channel.msgs.get_sequence_from_timestamp(0).unwrap(), 1);
        assert_eq!(channel.msgs.get_sequence_from_timestamp(1_500).unwrap(), 2);
        assert_eq!(channel.msgs.get_sequence_from_timestamp(3_000).unwrap(), 3);
        assert_eq!(channel.msgs.get_sequence_from_timestamp(9_000).unwrap(), 4);
    }
}

#[test]
fn test_empty_message_log() {
    for store in stores() {
        let channel = store.create_channel("e").unwrap();
        channel.msgs.store(&msg("e", 1, "x")).unwrap();
        channel.msgs.empty().unwrap();
        assert_eq!(channel.msgs.last_sequence().unwrap(), 0);
        assert!(channel.msgs.lookup(1).unwrap().is_none());
        channel.msgs.store(&msg("e", 4, "y")).unwrap();
        assert_eq!(channel.msgs.first_sequence().unwrap(), 4);
    }
}

#[test]
fn test_pending_raises_last_sent() {
    for store in stores() {
        let channel = store.create_channel("subs").unwrap();
        channel.subs.create_sub(&sub_state(1, "subs")).unwrap();
        channel.subs.add_seq_pending(1, 3).unwrap();
        channel.subs.add_seq_pending(1, 2).unwrap();
        channel.subs.ack_seq_pending(1, 3).unwrap();
        // acking an unknown sequence is not an error
        channel.subs.ack_seq_pending(1, 42).unwrap();

        let recovered = store.recover().unwrap().unwrap();
        let sub = &recovered.channels[0].subscriptions[0];
        assert_eq!(sub.state.last_sent, 3, "{}", store.name());
        assert_eq!(sub.pending.iter().copied().collect::<Vec<_>>(), vec![2]);
    }
}

#[test]
fn test_pending_on_unknown_subscription_fails() {
    for store in stores() {
        let channel = store.create_channel("subs").unwrap();
        let err = channel.subs.add_seq_pending(9, 1).unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { .. }), "{}", store.name());
    }
}

#[test]
fn test_delete_sub_drops_pending() {
    for store in stores() {
        let channel = store.create_channel("subs").unwrap();
        channel.subs.create_sub(&sub_state(1, "subs")).unwrap();
        channel.subs.create_sub(&sub_state(2, "subs")).unwrap();
        channel.subs.add_seq_pending(1, 1).unwrap();
        channel.subs.delete_sub(1).unwrap();

        let recovered = store.recover().unwrap().unwrap();
        let subs = &recovered.channels[0].subscriptions;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].state.id, 2);
        assert!(subs[0].pending.is_empty());
    }
}

#[test]
fn test_recover_fresh_store_is_none() {
    for store in stores() {
        assert!(store.recover().unwrap().is_none(), "{}", store.name());
    }
}

#[test]
fn test_recover_clients_and_channels() {
    for store in stores() {
        store.add_client(&ClientInfo::new("alice")).unwrap();
        store.add_client(&ClientInfo::new("bob")).unwrap();
        store.delete_client("bob").unwrap();
        store.create_channel("a").unwrap();
        store.create_channel("b").unwrap();
        store.delete_channel("b").unwrap();

        let recovered = store.recover().unwrap().unwrap();
        let clients: Vec<_> = recovered.clients.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(clients, vec!["alice"]);
        let channels: Vec<_> = recovered.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(channels, vec!["a"]);
    }
}

#[test]
fn test_last_applied_index() {
    for store in stores() {
        assert_eq!(store.last_applied_index().unwrap(), 0);
        store.set_last_applied_index(17).unwrap();
        assert_eq!(store.last_applied_index().unwrap(), 17);
    }
}

#[test]
fn test_sled_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let store = SledStore::open(&path, StoreLimits::default(), true).unwrap();
        store.add_client(&ClientInfo::new("alice")).unwrap();
        let channel = store.create_channel("orders").unwrap();
        for seq in 1..=3 {
            channel.msgs.store(&msg("orders", seq, "x")).unwrap();
        }
        let mut state = sub_state(1, "orders");
        state.is_durable = true;
        state.durable_name = Some("dur".into());
        channel.subs.create_sub(&state).unwrap();
        channel.subs.add_seq_pending(1, 1).unwrap();
        channel.subs.add_seq_pending(1, 2).unwrap();
        channel.subs.ack_seq_pending(1, 1).unwrap();
        store.set_last_applied_index(5).unwrap();
    }

    let store = SledStore::open(&path, StoreLimits::default(), true).unwrap();
    let recovered = store.recover().unwrap().unwrap();
    assert_eq!(recovered.clients.len(), 1);
    assert_eq!(store.last_applied_index().unwrap(), 5);

    let channel = &recovered.channels[0];
    assert_eq!(channel.name, "orders");
    assert_eq!(channel.store.msgs.last_sequence().unwrap(), 3);
    assert_eq!(channel.store.msgs.first_sequence().unwrap(), 1);
    let sub = &channel.subscriptions[0];
    assert_eq!(sub.state.durable_name.as_deref(), Some("dur"));
    assert_eq!(sub.state.last_sent, 2);
    assert_eq!(sub.pending.iter().copied().collect::<Vec<_>>(), vec![2]);

    // the next sequence continues after the recovered watermark
    channel.store.msgs.store(&msg("orders", 4, "y")).unwrap();
    assert_eq!(channel.store.msgs.last_sequence().unwrap(), 4);
}

#[test]
fn test_set_first_sequence_on_empty_log() {
    for store in stores() {
        let channel = store.create_channel("restored").unwrap();
        channel.msgs.set_first_sequence(10).unwrap();
        assert_eq!(channel.msgs.first_sequence().unwrap(), 10, "{}", store.name());
        assert_eq!(channel.msgs.last_sequence().unwrap(), 9);
        assert!(channel.msgs.store(&msg("restored", 9, "old")).is_err());
        channel.msgs.store(&msg("restored", 10, "x")).unwrap();

        // no effect once messages are stored
        channel.msgs.set_first_sequence(50).unwrap();
        assert_eq!(channel.msgs.first_sequence().unwrap(), 10);
        assert_eq!(channel.msgs.last_sequence().unwrap(), 10);
    }
}
