//! Broker engine
//!
//! The engine ties the topic registry, the per-topic endpoint directories,
//! the acknowledgement tracker and the durable store together:
//! - topic administration (create, update, delete, list, restore on start)
//! - node sessions and the endpoints they attach
//! - message submission: overflow policy, id allocation, persistence,
//!   dispatch and the sender's wait for its ack level
//! - acknowledgements, retries and expiry
//!
//! Concurrency notes:
//! - All methods take `&self`; share the broker as `Arc<Broker>`.
//! - Each topic has its own mutex. The registry lock is only held long
//!   enough to look a topic up, so unrelated topics never contend.
//! - Lock order is topic -> nodes -> permissions. Nothing acquires a topic
//!   lock while holding the nodes lock.
//! - No lock is held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::broker::ack::{DeliveryRecord, DeliveryState, PendingMessage, SendReport, Waiter};
use crate::broker::dispatch;
use crate::broker::endpoint::{Delivery, EndpointDirectory};
use crate::broker::message::{
    AckKind, Durability, EndpointId, Message, MessageId, NodeId, OutgoingMessage, TargetKind,
    TopicCode,
};
use crate::broker::topic::{OverflowPolicy, TopicConfig, TopicInner, TopicRegistry, TopicState};
use crate::config::BrokerSettings;
use crate::persistence::{DurableHandle, Persistence, Settlement};
use crate::utils::{BrokerError, Result};

/// Message ids are reserved in the store this many at a time.
const ID_BLOCK: u64 = 1024;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read/write rights of a node on a topic that requires auth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub read: bool,
    pub write: bool,
}

impl Permission {
    pub const READ: Permission = Permission {
        read: true,
        write: false,
    };
    pub const WRITE: Permission = Permission {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Permission = Permission {
        read: true,
        write: true,
    };
}

#[derive(Debug)]
struct NodeEntry {
    endpoints: BTreeMap<EndpointId, TopicCode>,
    closed: watch::Sender<bool>,
}

#[derive(Debug)]
pub struct Broker {
    topics: TopicRegistry,
    nodes: Mutex<HashMap<NodeId, NodeEntry>>,
    permissions: RwLock<HashMap<(NodeId, TopicCode), Permission>>,
    persistence: Persistence,
    settings: BrokerSettings,
    next_endpoint_id: AtomicU64,
}

impl Broker {
    /// Builds a broker over `persistence`, restoring the topics and
    /// unsettled durable messages it already holds.
    pub fn new_with_persistence(persistence: Persistence, settings: BrokerSettings) -> Result<Self> {
        let broker = Self {
            topics: TopicRegistry::new(),
            nodes: Mutex::new(HashMap::new()),
            permissions: RwLock::new(HashMap::new()),
            persistence,
            settings,
            next_endpoint_id: AtomicU64::new(1),
        };
        broker.restore()?;
        Ok(broker)
    }

    /// A broker over a throwaway store.
    pub fn temporary() -> Result<Self> {
        Self::new_with_persistence(Persistence::temporary()?, BrokerSettings::default())
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    fn lock_nodes(&self) -> MutexGuard<'_, HashMap<NodeId, NodeEntry>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restore(&self) -> Result<()> {
        for config in self.persistence.load_topics()? {
            let stored = self.persistence.restore(&config.code)?;
            let next_id = self
                .persistence
                .id_ceiling(&config.code)?
                .unwrap_or(1)
                .max(stored.last().map_or(1, |s| s.message.id.0 + 1));

            let state = TopicState::with_next_id(config.clone(), next_id);
            {
                let mut inner = state.lock();
                for s in stored {
                    let mut pending = PendingMessage::new(Arc::new(s.message));
                    pending.restored_receivers = s.settled_receivers;
                    inner.pending.insert(pending.message.id, pending);
                }
            }
            let state = self.topics.insert(state)?;
            info!(
                topic = %config.code,
                pending = state.lock().pending.len(),
                next_id,
                "restored topic"
            );
        }
        Ok(())
    }

    // ---- topics ----

    /// Registers a topic. With `blocking` set, returns only after the
    /// definition has been flushed to disk.
    pub async fn create_topic(&self, config: TopicConfig) -> Result<()> {
        config.validate()?;
        let code = config.code.clone();
        let blocking = config.blocking;

        self.topics.insert(TopicState::new(config.clone()))?;
        if let Err(e) = self.persistence.save_topic(&config) {
            let _ = self.topics.remove(&code);
            return Err(e);
        }

        if blocking {
            self.persistence.flush().await?;
        } else {
            let persistence = self.persistence.clone();
            let topic = code.clone();
            tokio::spawn(async move {
                if let Err(e) = persistence.flush().await {
                    warn!(%topic, "background flush of topic definition failed: {e}");
                }
            });
        }
        info!(topic = %code, blocking, "topic created");
        Ok(())
    }

    pub fn get_topic(&self, code: &str) -> Result<TopicConfig> {
        Ok(self.topics.get(code)?.config())
    }

    pub fn list_topics(&self) -> Vec<TopicConfig> {
        let mut topics: Vec<TopicConfig> = self.topics.all().iter().map(|t| t.config()).collect();
        topics.sort_by(|a, b| a.code.cmp(&b.code));
        topics
    }

    /// Changes the overflow policy of a topic. Messages already pending are
    /// not re-evaluated.
    pub fn update_topic(
        &self,
        code: &str,
        policy: OverflowPolicy,
        capacity: usize,
    ) -> Result<TopicConfig> {
        let topic = self.topics.get(code)?;
        let config = {
            let mut inner = topic.lock();
            let config = inner.config.clone().overflow(policy, capacity);
            config.validate()?;
            inner.config = config.clone();
            config
        };
        self.persistence.save_topic(&config)?;
        info!(topic = %code, ?policy, capacity, "topic updated");
        Ok(config)
    }

    /// Removes a topic: its endpoint streams end, waiting senders fail with
    /// `NotFound`, and its durable data is dropped.
    pub fn delete_topic(&self, code: &str) -> Result<()> {
        let topic = self.topics.remove(code)?;
        let endpoints = {
            let mut inner = topic.lock();
            for (_, mut pending) in std::mem::take(&mut inner.pending) {
                pending.fail_waiter(BrokerError::NotFound(format!("topic {code}")));
            }
            inner.directory.drain()
        };
        for entry in self.lock_nodes().values_mut() {
            entry.endpoints.retain(|_, topic| topic != code);
        }
        drop(endpoints);
        self.persistence.remove_topic(code)?;
        info!(topic = %code, "topic deleted");
        Ok(())
    }

    // ---- nodes and permissions ----

    /// Registers a node session. The returned receiver flips to `true` when
    /// the node is closed.
    pub fn register_node(&self, node_id: &str) -> Result<watch::Receiver<bool>> {
        let mut nodes = self.lock_nodes();
        if nodes.contains_key(node_id) {
            return Err(BrokerError::AlreadyExists(format!("node {node_id}")));
        }
        let (closed, rx) = watch::channel(false);
        nodes.insert(
            node_id.to_string(),
            NodeEntry {
                endpoints: BTreeMap::new(),
                closed,
            },
        );
        info!(node_id, "node connected");
        Ok(rx)
    }

    pub fn is_node_online(&self, node_id: &str) -> bool {
        self.lock_nodes().contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.lock_nodes().len()
    }

    /// Closes a node: its endpoints are detached and its waiting sends fail
    /// with `Cancelled`. Durable messages it sent stay persisted.
    pub fn close_node(&self, node_id: &str) {
        let Some(entry) = self.lock_nodes().remove(node_id) else {
            return;
        };
        let _ = entry.closed.send(true);

        for (endpoint_id, topic) in entry.endpoints {
            self.detach_from_topic(&topic, endpoint_id);
        }

        for topic in self.topics.all() {
            let mut inner = topic.lock();
            let mut finished = Vec::new();
            for (id, pending) in inner.pending.iter_mut() {
                if pending.waiter.as_ref().is_some_and(|w| w.node_id == node_id) {
                    pending.fail_waiter(BrokerError::Cancelled);
                    if pending.is_complete() {
                        finished.push(*id);
                    }
                }
            }
            for id in finished {
                inner.pending.remove(&id);
            }
        }
        info!(node_id, "node closed");
    }

    pub fn grant(&self, node_id: &str, topic: &str, permission: Permission) {
        self.permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((node_id.to_string(), topic.to_string()), permission);
    }

    fn check_permission(&self, node_id: &str, config: &TopicConfig, write: bool) -> Result<()> {
        if !config.requires_auth {
            return Ok(());
        }
        let permission = self
            .permissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(node_id.to_string(), config.code.clone()))
            .copied()
            .unwrap_or_default();
        let allowed = if write {
            permission.write
        } else {
            permission.read
        };
        if allowed {
            Ok(())
        } else {
            Err(BrokerError::Unauthorized {
                node_id: node_id.to_string(),
                topic: config.code.clone(),
                action: if write { "write" } else { "read" }.to_string(),
            })
        }
    }

    // ---- endpoints ----

    /// Attaches an endpoint for `node_id` on `topic_code` and returns its
    /// inbound queue. Unsettled durable messages matching the subjects are
    /// replayed into it straight away.
    pub fn attach(
        &self,
        node_id: &str,
        topic_code: &str,
        subjects: Vec<String>,
    ) -> Result<(EndpointId, mpsc::UnboundedReceiver<Delivery>)> {
        if !self.is_node_online(node_id) {
            return Err(BrokerError::NotFound(format!("node {node_id}")));
        }
        let topic = self.topics.get(topic_code)?;
        let endpoint_id = EndpointId(self.next_endpoint_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = topic.lock();
        self.check_permission(node_id, &inner.config, false)?;
        inner
            .directory
            .attach(endpoint_id, node_id.to_string(), subjects, tx);

        // the node may have closed since the check above
        match self.lock_nodes().get_mut(node_id) {
            Some(entry) => {
                entry.endpoints.insert(endpoint_id, topic_code.to_string());
            }
            None => {
                inner.directory.detach(endpoint_id);
                return Err(BrokerError::Cancelled);
            }
        }

        self.replay_durable(&mut inner, endpoint_id);
        debug!(node_id, topic = topic_code, %endpoint_id, "endpoint attached");
        Ok((endpoint_id, rx))
    }

    fn replay_durable(&self, inner: &mut TopicInner, endpoint_id: EndpointId) {
        let now = now_ms();
        let TopicInner {
            directory, pending, ..
        } = inner;
        let Some(entry) = directory.get(endpoint_id) else {
            return;
        };

        let mut settled = Vec::new();
        for (id, message) in pending.iter_mut() {
            if !message.is_durable()
                || message.records.contains_key(&endpoint_id)
                || message.durable_slots() == 0
                || !entry.matches(&message.message.header.subjects)
            {
                continue;
            }
            if !directory.push(Delivery {
                endpoint_id,
                attempt: 1,
                message: message.message.clone(),
            }) {
                break;
            }
            message.record_sent(endpoint_id, now);
            if self.record_durable_progress(message, endpoint_id, DeliveryState::Sent) {
                settled.push(*id);
            }
        }
        for id in settled {
            if let Some(mut message) = pending.remove(&id) {
                message.release_waiter();
            }
        }
    }

    /// Offers durable messages with free receiver slots to every attached
    /// endpoint that has not had them yet.
    fn refill_durable(&self, inner: &mut TopicInner) {
        for endpoint_id in inner.directory.ids() {
            self.replay_durable(inner, endpoint_id);
        }
    }

    /// Detaches an endpoint; its inbound stream ends.
    pub fn detach(&self, endpoint_id: EndpointId) -> Result<()> {
        let topic = self
            .lock_nodes()
            .values_mut()
            .find_map(|entry| entry.endpoints.remove(&endpoint_id));
        match topic {
            Some(topic) => {
                self.detach_from_topic(&topic, endpoint_id);
                Ok(())
            }
            None => Err(BrokerError::NotFound(format!("endpoint {endpoint_id}"))),
        }
    }

    fn detach_from_topic(&self, topic_code: &str, endpoint_id: EndpointId) {
        let Ok(topic) = self.topics.get(topic_code) else {
            return;
        };
        let mut inner = topic.lock();
        let removed = inner.directory.detach(endpoint_id);

        let mut finished = Vec::new();
        for (id, pending) in inner.pending.iter_mut() {
            pending.forget_endpoint(endpoint_id);
            pending.release_waiter_if_satisfied();
            if pending.is_complete() {
                finished.push(*id);
            }
        }
        for id in finished {
            inner.pending.remove(&id);
        }
        self.refill_durable(&mut inner);
        drop(removed);
        debug!(topic = topic_code, %endpoint_id, "endpoint detached");
    }

    /// Endpoints of `topic_code` whose filters match `subjects`.
    pub fn resolve(&self, topic_code: &str, subjects: &[String]) -> Result<Vec<EndpointId>> {
        Ok(self.topics.get(topic_code)?.lock().directory.resolve(subjects))
    }

    pub fn endpoint_count(&self, topic_code: &str) -> Result<usize> {
        Ok(self.topics.get(topic_code)?.lock().directory.len())
    }

    // ---- sending ----

    /// Accepts a message from `node_id` and dispatches it. The returned
    /// receiver resolves once the message's ack level is reached.
    pub fn submit(
        &self,
        node_id: &str,
        outgoing: OutgoingMessage,
    ) -> Result<oneshot::Receiver<Result<SendReport>>> {
        if !self.is_node_online(node_id) {
            return Err(BrokerError::NotFound(format!("node {node_id}")));
        }
        let OutgoingMessage {
            mut header,
            payload,
        } = outgoing;
        let kind = header.target_kind;
        if kind == TargetKind::Durable {
            let durability = header.durability.get_or_insert_with(|| {
                Durability::expire_in(
                    self.settings.message_ttl_secs,
                    self.settings.default_max_receivers,
                )
            });
            if durability.max_receivers == 0 {
                return Err(BrokerError::InvalidPolicy(
                    "durable message with zero max_receivers".to_string(),
                ));
            }
        }

        let topic = self.topics.get(&header.topic)?;
        let (tx, rx) = oneshot::channel();
        let now = now_ms();
        let mut inner = topic.lock();
        self.check_permission(node_id, &inner.config, true)?;

        let tracked = kind != TargetKind::Available
            && (kind == TargetKind::Durable || header.ack_kind != AckKind::None);
        let mut evict = false;
        if kind != TargetKind::Available && inner.is_full() {
            match inner.config.overflow_policy {
                OverflowPolicy::RejectNew => {
                    return Err(BrokerError::CapacityExceeded {
                        topic: inner.config.code.clone(),
                        capacity: inner.config.overflow_capacity,
                    });
                }
                OverflowPolicy::DropOld => evict = tracked,
            }
        }
        if kind == TargetKind::Push && !inner.directory.has_open(&header.subjects) {
            return Err(BrokerError::NoReceiver(header.topic.clone()));
        }

        if inner.needs_reservation() {
            let ceiling = inner.next_message_id + ID_BLOCK;
            self.persistence.reserve_ids(&inner.config.code, ceiling)?;
            inner.id_ceiling = ceiling;
        }
        let message = Arc::new(Message {
            id: inner.allocate_id(),
            header,
            payload,
            created_at: now,
        });

        let limit = match kind {
            TargetKind::Durable => {
                self.persistence.persist(&message)?;
                message.header.durability.map(|d| d.max_receivers as usize)
            }
            _ => None,
        };

        let result = dispatch::dispatch(&mut inner, &message, limit);
        for (endpoint_id, err) in &result.errors {
            debug!(topic = %message.header.topic, %endpoint_id, "skipped endpoint: {err}");
        }
        if kind == TargetKind::Push && result.matched.is_empty() {
            return Err(BrokerError::NoReceiver(message.header.topic.clone()));
        }
        debug!(
            node_id,
            topic = %message.header.topic,
            message_id = %message.id,
            ?kind,
            matched = result.matched_count(),
            "message dispatched"
        );

        if !tracked {
            let report = SendReport {
                topic: message.header.topic.clone(),
                message_id: message.id,
                matched: result.matched.clone(),
                states: result
                    .matched
                    .iter()
                    .map(|id| (*id, DeliveryState::Sent))
                    .collect(),
            };
            let _ = tx.send(Ok(report));
            return Ok(rx);
        }

        let mut pending = PendingMessage::new(message.clone());
        pending.initial = result.matched.iter().copied().collect();
        pending.waiter = Some(Waiter {
            node_id: node_id.to_string(),
            tx,
        });
        let mut settled = false;
        for endpoint_id in &result.matched {
            pending.record_sent(*endpoint_id, now);
            settled |= self.record_durable_progress(&pending, *endpoint_id, DeliveryState::Sent);
        }

        if settled {
            pending.release_waiter();
        } else {
            pending.release_waiter_if_satisfied();
            if !pending.is_complete() {
                // only a message that will occupy a slot pushes the oldest out
                if evict {
                    self.evict_oldest(&mut inner);
                }
                inner.pending.insert(message.id, pending);
            }
        }
        Ok(rx)
    }

    /// Sends a message and waits for its ack level.
    pub async fn send_message(&self, node_id: &str, message: OutgoingMessage) -> Result<SendReport> {
        let rx = self.submit(node_id, message)?;
        rx.await.unwrap_or(Err(BrokerError::Cancelled))
    }

    fn evict_oldest(&self, inner: &mut TopicInner) {
        let Some((message_id, mut evicted)) = inner.pending.pop_first() else {
            return;
        };
        if evicted.is_durable() {
            let handle = DurableHandle {
                topic: inner.config.code.clone(),
                message_id,
            };
            if let Err(e) = self.persistence.settle(&handle, Settlement::Evicted) {
                warn!(topic = %handle.topic, %message_id, "failed to release evicted message: {e}");
            }
        }
        evicted.fail_waiter(BrokerError::CapacityExceeded {
            topic: inner.config.code.clone(),
            capacity: inner.config.overflow_capacity,
        });
        warn!(topic = %inner.config.code, %message_id, "evicted oldest pending message");
    }

    /// Feeds durable progress to the store. Returns `true` if the message
    /// settled because of it.
    fn record_durable_progress(
        &self,
        pending: &PendingMessage,
        endpoint_id: EndpointId,
        state: DeliveryState,
    ) -> bool {
        if !pending.is_durable() {
            return false;
        }
        let handle = DurableHandle {
            topic: pending.message.header.topic.clone(),
            message_id: pending.message.id,
        };
        match self.persistence.mark_delivered(&handle, endpoint_id, state) {
            Ok(settled) => settled,
            Err(e) => {
                warn!(topic = %handle.topic, message_id = %handle.message_id, "failed to record durable progress: {e}");
                false
            }
        }
    }

    // ---- acknowledgements ----

    /// Applies an acknowledgement from `endpoint_id`. Acks for messages that
    /// already settled are ignored.
    pub fn ack(
        &self,
        topic_code: &str,
        message_id: MessageId,
        endpoint_id: EndpointId,
        state: DeliveryState,
    ) -> Result<()> {
        let topic = self.topics.get(topic_code)?;
        let now = now_ms();
        let mut inner = topic.lock();
        let TopicInner {
            pending, directory, ..
        } = &mut *inner;

        let Some(entry) = pending.get_mut(&message_id) else {
            debug!(topic = topic_code, %message_id, "ack for settled or unknown message");
            return Ok(());
        };
        let level = entry.level();
        let Some(record) = entry.records.get_mut(&endpoint_id) else {
            debug!(topic = topic_code, %message_id, %endpoint_id, "ack from endpoint without a record");
            return Ok(());
        };
        if !record.advance(state, now) {
            return Ok(());
        }
        let reached = record.reached(level);

        if state == DeliveryState::Failed {
            self.retry_record(entry, directory, endpoint_id, now);
        }

        if reached && self.record_durable_progress(entry, endpoint_id, state) {
            if let Some(mut settled) = pending.remove(&message_id) {
                settled.release_waiter();
            }
            return Ok(());
        }

        entry.release_waiter_if_satisfied();
        if entry.is_complete() {
            pending.remove(&message_id);
        }
        if state == DeliveryState::Failed {
            self.refill_durable(&mut inner);
        }
        Ok(())
    }

    fn retry_record(
        &self,
        pending: &mut PendingMessage,
        directory: &EndpointDirectory,
        endpoint_id: EndpointId,
        now: i64,
    ) {
        let message = pending.message.clone();
        let Some(record) = pending.records.get_mut(&endpoint_id) else {
            return;
        };
        if record.attempt > self.settings.max_retries {
            record.exhausted = true;
            warn!(topic = %message.header.topic, message_id = %message.id, %endpoint_id, attempts = record.attempt, "giving up on delivery");
            return;
        }
        if directory.push(Delivery {
            endpoint_id,
            attempt: record.attempt + 1,
            message: message.clone(),
        }) {
            record.redeliver(now);
            debug!(topic = %message.header.topic, message_id = %message.id, %endpoint_id, attempt = record.attempt, "redelivered");
        } else {
            record.exhausted = true;
        }
    }

    /// Redelivers records that failed or timed out waiting for their ack.
    /// Returns how many records were handled.
    pub fn retry_pending(&self, now: i64) -> usize {
        let mut handled = 0;
        for topic in self.topics.all() {
            let before = handled;
            let mut inner = topic.lock();
            let TopicInner {
                pending, directory, ..
            } = &mut *inner;

            let mut finished = Vec::new();
            for (id, entry) in pending.iter_mut() {
                let level = entry.level();
                let due: Vec<EndpointId> = entry
                    .records
                    .iter()
                    .filter(|(_, record)| {
                        record.needs_retry(level, now, self.settings.ack_timeout_ms)
                    })
                    .map(|(endpoint_id, _)| *endpoint_id)
                    .collect();
                for endpoint_id in due {
                    self.retry_record(entry, directory, endpoint_id, now);
                    handled += 1;
                }
                entry.release_waiter_if_satisfied();
                if entry.is_complete() {
                    finished.push(*id);
                }
            }
            for id in finished {
                pending.remove(&id);
            }
            if handled > before {
                self.refill_durable(&mut inner);
            }
        }
        handled
    }

    /// Settles durable messages past their `expire_at`. Senders still
    /// waiting on one get `Expired`.
    pub fn sweep_expired(&self, now: i64) -> Vec<DurableHandle> {
        let expired = self.persistence.sweep_expired(now);
        for handle in &expired {
            let Ok(topic) = self.topics.get(&handle.topic) else {
                continue;
            };
            if let Some(mut pending) = topic.lock().pending.remove(&handle.message_id) {
                pending.release_waiter_if_satisfied();
                pending.fail_waiter(BrokerError::Expired {
                    topic: handle.topic.clone(),
                    message_id: handle.message_id.0,
                });
            }
            info!(topic = %handle.topic, message_id = %handle.message_id, "durable message expired");
        }
        expired
    }

    /// Periodically retries unacknowledged deliveries and sweeps expired
    /// durable messages. Runs until the task is dropped.
    pub async fn start_maintenance_loop(broker: Arc<Broker>) {
        let period = Duration::from_millis(broker.settings.maintenance_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let now = now_ms();
            let retried = broker.retry_pending(now);
            let expired = broker.sweep_expired(now);
            if retried > 0 || !expired.is_empty() {
                debug!(retried, expired = expired.len(), "maintenance pass");
            }
        }
    }

    // ---- inspection ----

    /// Number of messages counting against the topic's overflow capacity.
    pub fn pending_count(&self, topic_code: &str) -> Result<usize> {
        Ok(self.topics.get(topic_code)?.lock().pending.len())
    }

    /// Delivery records of a still-pending message.
    pub fn delivery_records(
        &self,
        topic_code: &str,
        message_id: MessageId,
    ) -> Result<Option<BTreeMap<EndpointId, DeliveryRecord>>> {
        Ok(self
            .topics
            .get(topic_code)?
            .lock()
            .pending
            .get(&message_id)
            .map(|pending| pending.records.clone()))
    }
}
