//! In-process node session
//!
//! A `Node` is one client session on the broker. It sends messages and
//! creates `Endpoint`s; every endpoint it created is detached, and every
//! send still waiting fails with `Cancelled`, when the node closes or is
//! dropped.

use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::broker::{Broker, NodeId, OutgoingMessage, SendReport};
use crate::client::endpoint::Endpoint;
use crate::utils::Result;

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    broker: Arc<Broker>,
    closed: watch::Receiver<bool>,
}

impl Node {
    /// Opens a session with a fresh UUID.
    pub fn connect(broker: Arc<Broker>) -> Result<Self> {
        Self::connect_with_id(broker, Uuid::new_v4().to_string())
    }

    pub fn connect_with_id(broker: Arc<Broker>, id: impl Into<NodeId>) -> Result<Self> {
        let id = id.into();
        let closed = broker.register_node(&id)?;
        Ok(Self { id, broker, closed })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn create_endpoint<S: Into<String>>(
        &self,
        topic: &str,
        subjects: impl IntoIterator<Item = S>,
    ) -> Result<Endpoint> {
        let subjects = subjects.into_iter().map(Into::into).collect();
        let (id, rx) = self.broker.attach(&self.id, topic, subjects)?;
        Ok(Endpoint::new(id, topic.to_string(), rx, self.broker.clone()))
    }

    /// Sends a message and waits until its ack level is reached.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<SendReport> {
        self.broker.send_message(&self.id, message).await
    }

    pub fn close(self) {
        self.broker.close_node(&self.id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.broker.close_node(&self.id);
    }
}
