//! The `error` module defines the error taxonomy used within `popstream`.
//!
//! Every layer (store backends, the delivery engine, the replication
//! controller and the transports) reports failures through [`BrokerError`],
//! so callers can match on the kind of failure without knowing which layer
//! produced it.

/// Errors surfaced by broker operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Unknown channel, subscription or client.
    #[error("{kind} `{name}` not found")]
    NotFound {
        /// What was looked up (`channel`, `subscription`, `client`).
        kind: &'static str,
        /// The identifier that was not found.
        name: String,
    },
    /// Duplicate registration (client id, active durable, channel).
    #[error("{kind} `{name}` already exists")]
    AlreadyExists {
        /// What was being created.
        kind: &'static str,
        /// The conflicting identifier.
        name: String,
    },
    /// A store call failed. The in-flight operation did not take effect.
    #[error("storage failure: {0}")]
    Storage(String),
    /// A replicated operation was proposed on a node that is not the leader.
    #[error("not the leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader {
        /// Current leader, if known, so the caller can redirect.
        leader: Option<String>,
    },
    /// Consensus did not commit the operation in time. It was never applied.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// The store reported a sequence other than the expected one.
    #[error("sequence gap on channel `{channel}`: expected {expected}, got {got}")]
    SequenceGap {
        channel: String,
        expected: u64,
        got: u64,
    },
    /// The request itself is malformed (zero max in-flight, empty channel name...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Encoding or decoding of a persisted or replicated record failed.
    #[error("codec error: {0}")]
    Codec(String),
    /// The delivery target could not be reached.
    #[error("transport error: {0}")]
    Transport(String),
    /// The broker is shutting down.
    #[error("broker is shutting down")]
    Shutdown,
}

impl BrokerError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::NotLeader { .. } | Self::Storage(_))
    }
}

impl From<sled::Error> for BrokerError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
