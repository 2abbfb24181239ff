//! Endpoint directory
//!
//! Each topic keeps its own directory of attached endpoints. An endpoint is a
//! subscriber's set of subject filters plus the sending half of its inbound
//! queue. The directory is only ever touched under the topic lock, so a
//! `resolve` always sees the same endpoint set as the dispatch that uses it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::broker::message::{EndpointId, Message, NodeId};

/// One delivery attempt of a message to an endpoint.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub endpoint_id: EndpointId,
    /// 1 for the first delivery, incremented on every retry.
    pub attempt: u32,
    pub message: Arc<Message>,
}

#[derive(Debug)]
pub struct EndpointEntry {
    pub id: EndpointId,
    pub node_id: NodeId,
    pub subjects: BTreeSet<String>,
    pub sender: UnboundedSender<Delivery>,
}

impl EndpointEntry {
    pub fn matches(&self, subjects: &[String]) -> bool {
        subjects
            .iter()
            .any(|subject| self.subjects.iter().any(|filter| subject_matches(filter, subject)))
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// `filter` matches `subject` if they are equal or `filter` is a
/// `/`-delimited path prefix of `subject`. Case-sensitive.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let filter = filter.trim_end_matches('/');
    if filter.is_empty() {
        return false;
    }
    match subject.strip_prefix(filter) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug, Default)]
pub struct EndpointDirectory {
    endpoints: BTreeMap<EndpointId, EndpointEntry>,
}

impl EndpointDirectory {
    pub fn attach(
        &mut self,
        id: EndpointId,
        node_id: NodeId,
        subjects: impl IntoIterator<Item = String>,
        sender: UnboundedSender<Delivery>,
    ) {
        self.endpoints.insert(
            id,
            EndpointEntry {
                id,
                node_id,
                subjects: subjects.into_iter().collect(),
                sender,
            },
        );
    }

    /// Removes the endpoint; dropping the entry closes its inbound queue.
    pub fn detach(&mut self, id: EndpointId) -> Option<EndpointEntry> {
        self.endpoints.remove(&id)
    }

    pub fn get(&self, id: EndpointId) -> Option<&EndpointEntry> {
        self.endpoints.get(&id)
    }

    /// Endpoints whose filters match any of `subjects`, in attach order.
    pub fn resolve(&self, subjects: &[String]) -> Vec<EndpointId> {
        self.endpoints
            .values()
            .filter(|entry| entry.matches(subjects))
            .map(|entry| entry.id)
            .collect()
    }

    /// Whether some endpoint matching `subjects` can still take a delivery.
    pub fn has_open(&self, subjects: &[String]) -> bool {
        self.endpoints
            .values()
            .any(|entry| entry.is_open() && entry.matches(subjects))
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.endpoints.keys().copied().collect()
    }

    /// Pushes a delivery into the endpoint's inbound queue. Returns `false`
    /// if the endpoint is gone or its receiver has been dropped.
    pub fn push(&self, delivery: Delivery) -> bool {
        match self.endpoints.get(&delivery.endpoint_id) {
            Some(entry) => entry.sender.send(delivery).is_ok(),
            None => false,
        }
    }

    pub fn drain(&mut self) -> Vec<EndpointEntry> {
        std::mem::take(&mut self.endpoints).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
