//! # popstream
//!
//! `popstream` is a durable, at-least-once publish/subscribe broker. Every
//! channel is an ordered message log; subscribers consume it through
//! flow-controlled cursors that survive client and server restarts, and
//! broker state can be replicated across nodes through a consensus log.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: channels, the subscription state machine, queue groups and the delivery engine.
//! - `client`: connected clients and the subscriptions they own.
//! - `cluster`: replicated operations, the consensus contract and the replication controller.
//! - `config`: loads the layered configuration (file, environment, defaults).
//! - `persistence`: the store contract with an in-memory and a `sled` backend.
//! - `transport`: delivery toward subscriber inboxes and the WebSocket server.
//! - `utils`: error taxonomy and logging setup.

pub mod broker;
pub mod client;
pub mod cluster;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
