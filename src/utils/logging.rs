//! Logging bootstrap for the binary and tests.

use std::str::FromStr;

use tracing::Level;

/// Maps a configured level name to a `tracing` level. `warning` is accepted
/// for `warn`; anything unrecognised means `INFO`.
pub fn parse_level(name: &str) -> Level {
    let lower = name.trim().to_ascii_lowercase();
    let name = if lower == "warning" { "warn" } else { lower.as_str() };
    Level::from_str(name).unwrap_or(Level::INFO)
}

/// Installs the global fmt subscriber. Returns `false` if one was already
/// installed, in which case the call changes nothing.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}
