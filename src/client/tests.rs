use super::pubsub_client::{ClientInfo, ClientRegistry};
use crate::utils::BrokerError;

#[test]
fn test_client_new() {
    let client = ClientInfo::new("me");
    assert_eq!(client.id, "me");
    assert!(client.connected_at > 0);
}

#[test]
fn test_register_duplicate_client() {
    let registry = ClientRegistry::new();
    registry.register(ClientInfo::new("me")).unwrap();
    let err = registry.register(ClientInfo::new("me")).unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyExists { kind: "client", .. }));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_unregister_returns_owned_subs() {
    let registry = ClientRegistry::new();
    registry.register(ClientInfo::new("me")).unwrap();
    registry.add_sub("me", "foo", 1);
    registry.add_sub("me", "bar", 2);
    registry.remove_sub("me", "bar", 2);

    let subs = registry.unregister("me").unwrap();
    assert_eq!(subs, vec![("foo".to_string(), 1)]);
    assert!(!registry.contains("me"));
    assert!(registry.unregister("me").is_none());
}

#[test]
fn test_remove_channel_drops_refs() {
    let registry = ClientRegistry::new();
    registry.register(ClientInfo::new("a")).unwrap();
    registry.register(ClientInfo::new("b")).unwrap();
    registry.add_sub("a", "foo", 1);
    registry.add_sub("b", "foo", 2);
    registry.add_sub("b", "bar", 1);

    registry.remove_channel("foo");
    assert!(registry.subs("a").is_empty());
    assert_eq!(registry.subs("b"), vec![("bar".to_string(), 1)]);
    assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
}
