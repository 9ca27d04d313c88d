use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the delivery engine, the store, the
/// replication layer and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub delivery: DeliverySettings,
    pub store: StoreSettings,
    pub cluster: ClusterSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker.
///
/// Controls operational parameters like maximum connections and message retention.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// `0` keeps messages forever.
    pub message_ttl_secs: u64,
    /// `0` keeps every message.
    pub max_msgs_per_channel: usize,
}

/// How redeliveries of the same sequence are spaced.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Defaults and policies of the delivery engine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeliverySettings {
    pub default_max_in_flight: usize,
    pub default_ack_wait_ms: u64,
    pub backoff: BackoffKind,
    /// Upper bound of an exponential backoff.
    pub max_backoff_ms: u64,
    /// Retries of a failed message lookup before the error is surfaced.
    pub lookup_retries: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Sled,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub path: String,
    pub fsync: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClusterSettings {
    pub enabled: bool,
    pub node_id: String,
    pub proposal_timeout_ms: u64,
    /// Maximum number of queued proposals folded into one commit round.
    pub max_batch: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values come from the defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub store: Option<PartialStoreSettings>,
    pub cluster: Option<PartialClusterSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

/// Partial server settings.
///
/// Used when loading server configuration from external sources with optional values.
#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Partial broker settings.
///
/// Used for broker configuration from external sources with optional values.
#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub message_ttl_secs: Option<u64>,
    pub max_msgs_per_channel: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDeliverySettings {
    pub default_max_in_flight: Option<usize>,
    pub default_ack_wait_ms: Option<u64>,
    pub backoff: Option<BackoffKind>,
    pub max_backoff_ms: Option<u64>,
    pub lookup_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStoreSettings {
    pub kind: Option<StoreKind>,
    pub path: Option<String>,
    pub fsync: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClusterSettings {
    pub enabled: Option<bool>,
    pub node_id: Option<String>,
    pub proposal_timeout_ms: Option<u64>,
    pub max_batch: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings {
                max_connections: 1000,
                message_ttl_secs: 0,
                max_msgs_per_channel: 0,
            },
            delivery: DeliverySettings::default(),
            store: StoreSettings {
                kind: StoreKind::Memory,
                path: "popstream_db".to_string(),
                fsync: true,
            },
            cluster: ClusterSettings {
                enabled: false,
                node_id: "node-1".to_string(),
                proposal_timeout_ms: 5000,
                max_batch: 256,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            default_max_in_flight: 1024,
            default_ack_wait_ms: 30_000,
            backoff: BackoffKind::Fixed,
            max_backoff_ms: 300_000,
            lookup_retries: 3,
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let delivery = self.delivery.unwrap_or_default();
        let store = self.store.unwrap_or_default();
        let cluster = self.cluster.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(default.broker.max_connections),
                message_ttl_secs: broker
                    .message_ttl_secs
                    .unwrap_or(default.broker.message_ttl_secs),
                max_msgs_per_channel: broker
                    .max_msgs_per_channel
                    .unwrap_or(default.broker.max_msgs_per_channel),
            },
            delivery: DeliverySettings {
                default_max_in_flight: delivery
                    .default_max_in_flight
                    .unwrap_or(default.delivery.default_max_in_flight),
                default_ack_wait_ms: delivery
                    .default_ack_wait_ms
                    .unwrap_or(default.delivery.default_ack_wait_ms),
                backoff: delivery.backoff.unwrap_or(default.delivery.backoff),
                max_backoff_ms: delivery
                    .max_backoff_ms
                    .unwrap_or(default.delivery.max_backoff_ms),
                lookup_retries: delivery
                    .lookup_retries
                    .unwrap_or(default.delivery.lookup_retries),
            },
            store: StoreSettings {
                kind: store.kind.unwrap_or(default.store.kind),
                path: store.path.unwrap_or(default.store.path),
                fsync: store.fsync.unwrap_or(default.store.fsync),
            },
            cluster: ClusterSettings {
                enabled: cluster.enabled.unwrap_or(default.cluster.enabled),
                node_id: cluster.node_id.unwrap_or(default.cluster.node_id),
                proposal_timeout_ms: cluster
                    .proposal_timeout_ms
                    .unwrap_or(default.cluster.proposal_timeout_ms),
                max_batch: cluster.max_batch.unwrap_or(default.cluster.max_batch),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
