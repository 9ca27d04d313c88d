//! The `client` module defines the representation of a client in the broker.
//!
//! It provides [`ClientInfo`], the persisted record of a connected client,
//! and [`ClientRegistry`], the process-wide map of connected clients to the
//! subscriptions they own. A client is removed (and its non-durable
//! subscriptions with it) on disconnect.

pub mod pubsub_client;
pub use pubsub_client::{ClientInfo, ClientRegistry};

#[cfg(test)]
mod tests;
