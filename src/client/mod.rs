//! The `client` module is the SDK surface over the broker.
//!
//! A `Node` is a session that sends messages and creates `Endpoint`s; an
//! `Endpoint` yields `ReceivedMessage`s that acknowledge themselves. The
//! same `Endpoint` type is used for in-process nodes and for nodes connected
//! over WebSocket (see `transport::remote`).

pub mod endpoint;
pub mod node;

pub use endpoint::{DeliveryControl, Endpoint, ReceivedMessage};
pub use node::Node;

#[cfg(test)]
mod tests;
