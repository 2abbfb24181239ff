use serde::{Deserialize, Serialize};

use crate::broker::{DeliveryState, EndpointId, Message, MessageId, OutgoingMessage, SendReport};
use crate::utils::BrokerError;

/// Frames a remote node sends to the server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "create_endpoint")]
    CreateEndpoint {
        request_id: u64,
        topic: String,
        subjects: Vec<String>,
    },
    #[serde(rename = "close_endpoint")]
    CloseEndpoint { endpoint_id: EndpointId },
    #[serde(rename = "send")]
    Send {
        request_id: u64,
        message: OutgoingMessage,
    },
    #[serde(rename = "ack")]
    Ack {
        topic: String,
        message_id: MessageId,
        endpoint_id: EndpointId,
        state: DeliveryState,
    },
}

/// Frames the server sends to a remote node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "endpoint_created")]
    EndpointCreated {
        request_id: u64,
        endpoint_id: EndpointId,
    },
    #[serde(rename = "delivery")]
    Delivery {
        endpoint_id: EndpointId,
        attempt: u32,
        message: Message,
    },
    /// The server detached the endpoint; no more deliveries follow.
    #[serde(rename = "endpoint_closed")]
    EndpointClosed { endpoint_id: EndpointId },
    #[serde(rename = "send_result")]
    SendResult { request_id: u64, report: SendReport },
    /// `request_id` is absent for errors not tied to a request, such as an
    /// undecodable frame.
    #[serde(rename = "error")]
    Error {
        request_id: Option<u64>,
        error: BrokerError,
    },
}

impl ServerMessage {
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::EndpointCreated { request_id, .. }
            | ServerMessage::SendResult { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Delivery { .. } | ServerMessage::EndpointClosed { .. } => None,
        }
    }
}
