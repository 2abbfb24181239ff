//! Subscriber handle
//!
//! An `Endpoint` owns the receiving half of an endpoint's inbound queue.
//! Each delivery comes out as a `ReceivedMessage` that can acknowledge
//! itself. Acks and the final close go through a `DeliveryControl`, which
//! is the broker itself for in-process nodes and the WebSocket connection
//! for remote ones.

use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::broker::{Broker, Delivery, DeliveryState, EndpointId, Message, MessageId, TopicCode};
use crate::utils::Result;

/// The calls an endpoint makes back into whatever delivered its messages.
pub trait DeliveryControl: Send + Sync {
    fn ack(
        &self,
        topic: &str,
        message_id: MessageId,
        endpoint_id: EndpointId,
        state: DeliveryState,
    ) -> Result<()>;

    fn close_endpoint(&self, endpoint_id: EndpointId) -> Result<()>;
}

impl DeliveryControl for Broker {
    fn ack(
        &self,
        topic: &str,
        message_id: MessageId,
        endpoint_id: EndpointId,
        state: DeliveryState,
    ) -> Result<()> {
        Broker::ack(self, topic, message_id, endpoint_id, state)
    }

    fn close_endpoint(&self, endpoint_id: EndpointId) -> Result<()> {
        self.detach(endpoint_id)
    }
}

pub struct ReceivedMessage {
    delivery: Delivery,
    control: Arc<dyn DeliveryControl>,
}

impl ReceivedMessage {
    pub fn message(&self) -> &Message {
        &self.delivery.message
    }

    pub fn payload(&self) -> &Bytes {
        &self.delivery.message.payload
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        self.delivery.message.json()
    }

    /// 1 for the first delivery, higher for redeliveries.
    pub fn attempt(&self) -> u32 {
        self.delivery.attempt
    }

    pub fn received(&self) -> Result<()> {
        self.ack(DeliveryState::Received)
    }

    pub fn processed(&self) -> Result<()> {
        self.ack(DeliveryState::Processed)
    }

    /// Reports a processing failure; the broker redelivers while retries
    /// remain.
    pub fn failed(&self) -> Result<()> {
        self.ack(DeliveryState::Failed)
    }

    fn ack(&self, state: DeliveryState) -> Result<()> {
        self.control.ack(
            self.delivery.message.topic(),
            self.delivery.message.id,
            self.delivery.endpoint_id,
            state,
        )
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("delivery", &self.delivery)
            .finish()
    }
}

pub struct Endpoint {
    id: EndpointId,
    topic: TopicCode,
    rx: UnboundedReceiver<Delivery>,
    control: Arc<dyn DeliveryControl>,
    closed: bool,
}

impl Endpoint {
    pub fn new(
        id: EndpointId,
        topic: TopicCode,
        rx: UnboundedReceiver<Delivery>,
        control: Arc<dyn DeliveryControl>,
    ) -> Self {
        Self {
            id,
            topic,
            rx,
            control,
            closed: false,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next delivery. `None` once the endpoint is detached
    /// and its queue is drained.
    pub async fn next(&mut self) -> Option<ReceivedMessage> {
        let delivery = self.rx.recv().await?;
        Some(ReceivedMessage {
            delivery,
            control: self.control.clone(),
        })
    }

    /// The deliveries as a stream; dropping the stream closes the endpoint.
    pub fn messages(self) -> impl Stream<Item = ReceivedMessage> {
        futures::stream::unfold(self, |mut endpoint| async move {
            endpoint.next().await.map(|message| (message, endpoint))
        })
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.control.close_endpoint(self.id)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.control.close_endpoint(self.id) {
                debug!(endpoint_id = %self.id, "endpoint already gone: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}
