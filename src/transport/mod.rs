//! The `transport` module is responsible for network communication with
//! remote nodes over WebSockets.
//!
//! It defines the JSON protocol spoken between nodes and the server, the
//! server that maps each connection onto a broker node session, and the
//! remote client that speaks the protocol from the other side.

pub mod message;
pub mod remote;
pub mod websocket;

pub use remote::{RemoteNode, connect};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;

#[cfg(test)]
mod websocket_tests;
