//! The `error` module defines the error taxonomy shared by every layer of
//! `astermq`.
//!
//! `BrokerError` is serializable so a failure raised inside the broker can be
//! carried to a remote session over the wire without losing its kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BrokerError {
    #[error("topic already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid topic policy: {0}")]
    InvalidPolicy(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("topic {topic} is at capacity ({capacity} pending messages)")]
    CapacityExceeded { topic: String, capacity: usize },
    #[error("no receiver for push message on topic {0}")]
    NoReceiver(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("message {message_id} on topic {topic} expired before settlement")]
    Expired { topic: String, message_id: u64 },
    #[error("message {message_id} on topic {topic} missed its ack level on {undelivered} endpoint(s)")]
    DeliveryFailed {
        topic: String,
        message_id: u64,
        undelivered: usize,
    },
    #[error("node {node_id} may not {action} topic {topic}")]
    Unauthorized {
        node_id: String,
        topic: String,
        action: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Codec(e.to_string())
    }
}

impl From<tungstenite::Error> for BrokerError {
    fn from(e: tungstenite::Error) -> Self {
        BrokerError::Transport(e.to_string())
    }
}
