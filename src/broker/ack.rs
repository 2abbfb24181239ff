//! Acknowledgement tracking
//!
//! Every tracked (message, endpoint) pair carries a `DeliveryRecord` that
//! moves `Sent -> Received -> Processed`. Skipped states are accepted as an
//! implicit promotion and regressions are ignored. `Failed` marks a delivery
//! for an explicit retry by the maintenance loop.
//!
//! A sender is never answered with success for an endpoint that did not
//! reach the requested level.
//!
//! A `PendingMessage` groups the records of one message together with the
//! sender waiting on them. It stays in its topic's pending map (and counts
//! against the overflow capacity) until every record is done or, for
//! durable messages, until the durable store settles it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::broker::message::{AckKind, EndpointId, Message, MessageId, NodeId, TargetKind, TopicCode};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Received,
    Processed,
    Failed,
}

/// The record state a message must reach for its ack kind to be satisfied.
pub fn settle_level(ack_kind: AckKind) -> DeliveryState {
    match ack_kind {
        AckKind::None => DeliveryState::Sent,
        AckKind::Received => DeliveryState::Received,
        AckKind::Processed => DeliveryState::Processed,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub state: DeliveryState,
    pub delivered_at: i64,
    pub acked_at: Option<i64>,
    pub attempt: u32,
    /// Retries ran out; the record no longer holds the sender back.
    pub exhausted: bool,
}

impl DeliveryRecord {
    pub fn sent(now: i64) -> Self {
        Self {
            state: DeliveryState::Sent,
            delivered_at: now,
            acked_at: None,
            attempt: 1,
            exhausted: false,
        }
    }

    /// Applies an acknowledgement. Returns whether the state changed.
    pub fn advance(&mut self, to: DeliveryState, now: i64) -> bool {
        let changed = match (self.state, to) {
            (DeliveryState::Processed | DeliveryState::Failed, _) => false,
            (_, DeliveryState::Sent) => false,
            (_, DeliveryState::Failed) => true,
            (from, to) => to > from,
        };
        if changed {
            self.state = to;
            self.acked_at = Some(now);
        }
        changed
    }

    pub fn reached(&self, level: DeliveryState) -> bool {
        self.state != DeliveryState::Failed && self.state >= level
    }

    pub fn is_done(&self, level: DeliveryState) -> bool {
        self.exhausted || self.reached(level)
    }

    /// Whether the maintenance loop should deliver this record again.
    pub fn needs_retry(&self, level: DeliveryState, now: i64, ack_timeout_ms: i64) -> bool {
        if self.is_done(level) {
            return false;
        }
        self.state == DeliveryState::Failed || now - self.delivered_at >= ack_timeout_ms
    }

    pub fn redeliver(&mut self, now: i64) {
        self.state = DeliveryState::Sent;
        self.delivered_at = now;
        self.acked_at = None;
        self.attempt += 1;
    }
}

/// What `send_message` resolves with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReport {
    pub topic: TopicCode,
    pub message_id: MessageId,
    /// Endpoints the message was dispatched to when it was sent.
    pub matched: Vec<EndpointId>,
    pub states: BTreeMap<EndpointId, DeliveryState>,
}

impl SendReport {
    pub fn all_reached(&self, level: DeliveryState) -> bool {
        self.states
            .values()
            .all(|state| *state != DeliveryState::Failed && *state >= level)
    }
}

#[derive(Debug)]
pub struct Waiter {
    pub node_id: NodeId,
    pub tx: oneshot::Sender<Result<SendReport>>,
}

#[derive(Debug)]
pub struct PendingMessage {
    pub message: Arc<Message>,
    pub records: BTreeMap<EndpointId, DeliveryRecord>,
    /// Endpoints dispatched to at send time; the waiter is released once
    /// each of these is done.
    pub initial: BTreeSet<EndpointId>,
    pub waiter: Option<Waiter>,
    /// Receivers that settled before a restart (durable only).
    pub restored_receivers: u32,
}

impl PendingMessage {
    pub fn new(message: Arc<Message>) -> Self {
        Self {
            message,
            records: BTreeMap::new(),
            initial: BTreeSet::new(),
            waiter: None,
            restored_receivers: 0,
        }
    }

    pub fn level(&self) -> DeliveryState {
        settle_level(self.message.header.ack_kind)
    }

    pub fn is_durable(&self) -> bool {
        self.message.header.target_kind == TargetKind::Durable
    }

    /// Remaining delivery slots under the durable receiver quota.
    pub fn durable_slots(&self) -> usize {
        let Some(durability) = self.message.header.durability else {
            return 0;
        };
        let used = self.restored_receivers as usize
            + self.records.values().filter(|r| !r.exhausted).count();
        (durability.max_receivers as usize).saturating_sub(used)
    }

    pub fn record_sent(&mut self, endpoint_id: EndpointId, now: i64) {
        self.records.insert(endpoint_id, DeliveryRecord::sent(now));
    }

    /// Whether the waiting sender can be answered. A non-durable message
    /// answers once each initial endpoint reached the level, ran out of
    /// retries or detached. A durable one only once each reached the level;
    /// otherwise it waits for settlement or expiry.
    pub fn waiter_satisfied(&self) -> bool {
        let level = self.level();
        let durable = self.is_durable();
        self.initial.iter().all(|id| match self.records.get(id) {
            Some(record) if durable => record.reached(level),
            Some(record) => record.is_done(level),
            None => !durable,
        })
    }

    /// Initial endpoints that will never reach the settling level.
    pub fn undelivered(&self) -> usize {
        let level = self.level();
        self.initial
            .iter()
            .filter(|id| self.records.get(id).is_none_or(|r| !r.reached(level)))
            .count()
    }

    pub fn all_done(&self) -> bool {
        let level = self.level();
        self.records.values().all(|r| r.is_done(level))
    }

    pub fn report(&self) -> SendReport {
        SendReport {
            topic: self.message.header.topic.clone(),
            message_id: self.message.id,
            matched: self.initial.iter().copied().collect(),
            states: self
                .records
                .iter()
                .map(|(id, record)| (*id, record.state))
                .collect(),
        }
    }

    /// Answers the waiting sender once everything it waits for is done:
    /// with the report if every initial endpoint reached the level, with
    /// `DeliveryFailed` if some ran out of retries or detached first.
    pub fn release_waiter_if_satisfied(&mut self) {
        if self.waiter.is_none() || !self.waiter_satisfied() {
            return;
        }
        match self.undelivered() {
            0 => self.release_waiter(),
            undelivered => self.fail_waiter(BrokerError::DeliveryFailed {
                topic: self.message.header.topic.clone(),
                message_id: self.message.id.0,
                undelivered,
            }),
        }
    }

    /// Resolves the waiting sender with the current report. Used when a
    /// durable message settles on its receiver quota.
    pub fn release_waiter(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.tx.send(Ok(self.report()));
        }
    }

    pub fn fail_waiter(&mut self, err: BrokerError) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.tx.send(Err(err));
        }
    }

    /// A non-durable message can leave the pending map once nobody waits on
    /// it and every record is done.
    pub fn is_complete(&self) -> bool {
        !self.is_durable() && self.waiter.is_none() && self.all_done()
    }

    /// Drops the record of a detached endpoint that had not reached the
    /// settling level, freeing its durable slot.
    pub fn forget_endpoint(&mut self, endpoint_id: EndpointId) {
        let level = self.level();
        if self
            .records
            .get(&endpoint_id)
            .is_some_and(|r| !r.reached(level))
        {
            self.records.remove(&endpoint_id);
        }
    }
}
