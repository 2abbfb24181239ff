//! Delivery dispatch
//!
//! Resolves which endpoints of a topic a message goes to and pushes it into
//! their inbound queues. Runs under the topic lock; the caller turns the
//! result into delivery records.

use std::sync::Arc;

use crate::broker::endpoint::Delivery;
use crate::broker::message::{EndpointId, Message, TargetKind};
use crate::broker::topic::TopicInner;
use crate::utils::BrokerError;

#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Endpoints the message was pushed to, in delivery order.
    pub matched: Vec<EndpointId>,
    /// Endpoints that matched but could not take the message.
    pub errors: Vec<(EndpointId, BrokerError)>,
}

impl DispatchResult {
    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }
}

fn closed(endpoint_id: EndpointId) -> BrokerError {
    BrokerError::Transport(format!("inbound queue of {endpoint_id} is closed"))
}

/// Delivers `message` to the endpoints its target kind selects.
///
/// `limit` caps the number of receivers; durable messages pass their
/// remaining receiver quota here.
pub fn dispatch(inner: &mut TopicInner, message: &Arc<Message>, limit: Option<usize>) -> DispatchResult {
    let candidates = inner.directory.resolve(&message.header.subjects);
    let mut result = DispatchResult::default();
    if candidates.is_empty() {
        return result;
    }

    match message.header.target_kind {
        TargetKind::Push => {
            let start = inner.push_cursor % candidates.len();
            for offset in 0..candidates.len() {
                let endpoint_id = candidates[(start + offset) % candidates.len()];
                if inner.directory.push(Delivery {
                    endpoint_id,
                    attempt: 1,
                    message: message.clone(),
                }) {
                    inner.push_cursor = start + offset + 1;
                    result.matched.push(endpoint_id);
                    break;
                }
                result.errors.push((endpoint_id, closed(endpoint_id)));
            }
        }
        TargetKind::Available => {
            for endpoint_id in candidates {
                let open = inner
                    .directory
                    .get(endpoint_id)
                    .is_some_and(|entry| entry.is_open());
                if open
                    && inner.directory.push(Delivery {
                        endpoint_id,
                        attempt: 1,
                        message: message.clone(),
                    })
                {
                    result.matched.push(endpoint_id);
                }
            }
        }
        TargetKind::Online | TargetKind::Durable => {
            let limit = limit.unwrap_or(usize::MAX);
            for endpoint_id in candidates {
                if result.matched.len() >= limit {
                    break;
                }
                if inner.directory.push(Delivery {
                    endpoint_id,
                    attempt: 1,
                    message: message.clone(),
                }) {
                    result.matched.push(endpoint_id);
                } else {
                    result.errors.push((endpoint_id, closed(endpoint_id)));
                }
            }
        }
    }
    result
}
