//! # AsterMQ
//!
//! `astermq` is a topic-based publish/subscribe broker with durable delivery,
//! built with Rust. Nodes connect over WebSockets (or in-process), attach
//! endpoints that listen on subject patterns, and send messages that are
//! routed with online, push, durable or available semantics.
//!
//! ## Core Modules
//!
//! - `broker`: Topics, endpoints, dispatch and acknowledgement tracking.
//! - `client`: In-process `Node` and `Endpoint` handles over a shared broker.
//! - `config`: Loads server, broker and storage settings.
//! - `persistence`: The `sled`-backed store for topics and durable messages.
//! - `scenario`: End-to-end runs used by the `bench` command and the tests.
//! - `transport`: The WebSocket server and the matching remote client.
//! - `utils`: Shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod scenario;
pub mod transport;
pub mod utils;
