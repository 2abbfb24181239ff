//! Message definitions for the broker
//!
//! An `OutgoingMessage` is what a session hands to the broker: a payload plus
//! a `MessageHeader` naming the topic, the subjects it is published under,
//! how it should be targeted, and how far acknowledgement must get before
//! the sender is released. The broker stamps it with a per-topic
//! `MessageId` and a creation time, producing the immutable `Message` that
//! is delivered to endpoints and, for durable messages, persisted.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::Result;

pub type TopicCode = String;
pub type NodeId = String;

/// Per-topic message sequence number. Strictly increasing within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Delivery semantics selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Every matching endpoint attached at dispatch time.
    Online,
    /// Exactly one matching endpoint.
    Push,
    /// Every matching endpoint able to accept right now; never tracked.
    Available,
    /// Persisted; delivered until the receiver quota is met or it expires.
    Durable,
}

/// Acknowledgement level a sender waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    #[default]
    None,
    Received,
    Processed,
}

/// Retention for a `Durable` message, in milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Durability {
    pub expire_at: i64,
    pub max_receivers: u32,
}

impl Durability {
    /// Durability expiring `ttl_secs` from now.
    pub fn expire_in(ttl_secs: u64, max_receivers: u32) -> Self {
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        Self {
            expire_at: chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms),
            max_receivers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub topic: TopicCode,
    pub subjects: Vec<String>,
    pub target_kind: TargetKind,
    #[serde(default)]
    pub ack_kind: AckKind,
    #[serde(default)]
    pub durability: Option<Durability>,
}

impl MessageHeader {
    pub fn new<S: Into<String>>(
        topic: impl Into<TopicCode>,
        subjects: impl IntoIterator<Item = S>,
        target_kind: TargetKind,
    ) -> Self {
        Self {
            topic: topic.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            target_kind,
            ack_kind: AckKind::None,
            durability: None,
        }
    }

    pub fn ack_kind(mut self, ack_kind: AckKind) -> Self {
        self.ack_kind = ack_kind;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = Some(durability);
        self
    }
}

/// A message as submitted by a sender, before the broker assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Bytes>, header: MessageHeader) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Encode `value` as the JSON payload.
    pub fn json<T: Serialize>(value: &T, header: MessageHeader) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?, header))
    }
}

/// A message accepted by the broker. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub header: MessageHeader,
    pub payload: Bytes,
    /// Milliseconds since the UNIX epoch; set by the broker on acceptance.
    pub created_at: i64,
}

impl Message {
    pub fn topic(&self) -> &str {
        &self.header.topic
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}
