//! The `broker` module is the messaging core: topics, endpoints, dispatch,
//! acknowledgement tracking and durable settlement.

pub mod ack;
pub mod dispatch;
pub mod endpoint;
pub mod engine;
pub mod message;
pub mod topic;

pub use ack::{DeliveryRecord, DeliveryState, SendReport};
pub use endpoint::Delivery;
pub use engine::{Broker, Permission};
pub use message::{
    AckKind, Durability, EndpointId, Message, MessageHeader, MessageId, NodeId, OutgoingMessage,
    TargetKind, TopicCode,
};
pub use topic::{OverflowPolicy, TopicConfig};
