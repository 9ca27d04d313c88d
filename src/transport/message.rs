use serde::{Deserialize, Serialize};

use crate::broker::message::{MsgDelivery, StartPosition};

/// Requests a WebSocket client sends, one JSON object per text frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect {
        client_id: String,
    },

    Subscribe {
        channel: String,
        #[serde(default)]
        durable_name: Option<String>,
        #[serde(default)]
        queue_group: Option<String>,
        /// Falls back to the configured default.
        #[serde(default)]
        max_in_flight: Option<usize>,
        #[serde(default)]
        ack_wait_ms: Option<u64>,
        #[serde(default)]
        start: StartPosition,
    },

    Unsubscribe {
        channel: String,
        sub_id: u64,
    },

    Close {
        channel: String,
        sub_id: u64,
    },

    Publish {
        channel: String,
        payload: String,
    },

    Ack {
        channel: String,
        sub_id: u64,
        sequence: u64,
    },

    Disconnect,
}

/// Frames the server sends back: replies to requests and deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        client_id: String,
    },

    Published {
        channel: String,
        sequence: u64,
    },

    Subscribed {
        channel: String,
        sub_id: u64,
    },

    Msg {
        sub_id: u64,
        channel: String,
        sequence: u64,
        payload: String,
        timestamp: i64,
        redelivered: bool,
    },

    Ok,

    Error {
        message: String,
    },
}

impl From<&MsgDelivery> for ServerMessage {
    fn from(delivery: &MsgDelivery) -> Self {
        Self::Msg {
            sub_id: delivery.subscription_id,
            channel: delivery.channel.clone(),
            sequence: delivery.sequence,
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            timestamp: delivery.timestamp,
            redelivered: delivery.redelivered,
        }
    }
}

impl ServerMessage {
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}
