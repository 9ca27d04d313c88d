mod settings;

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};

use crate::persistence::StoreLimits;
use settings::PartialSettings;

pub use settings::{
    BackoffKind, BrokerSettings, ClusterSettings, DeliverySettings, LoggingSettings,
    ServerSettings, Settings, StoreKind, StoreSettings,
};

/// Prefix of environment overrides, e.g. `POPSTREAM_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "POPSTREAM";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing every section
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

impl BrokerSettings {
    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_msgs: self.max_msgs_per_channel,
            max_age: (self.message_ttl_secs > 0)
                .then(|| Duration::from_secs(self.message_ttl_secs)),
        }
    }
}

impl DeliverySettings {
    /// Delay before the `attempt`-th redelivery (1-based) of a sequence.
    pub fn redelivery_delay(&self, ack_wait: Duration, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => ack_wait,
            BackoffKind::Exponential => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                ack_wait
                    .saturating_mul(factor)
                    .min(Duration::from_millis(self.max_backoff_ms).max(ack_wait))
            }
        }
    }
}

impl ClusterSettings {
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
}
