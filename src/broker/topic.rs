//! Topic registry
//!
//! A `TopicConfig` is the administrative definition of a topic. The
//! `TopicRegistry` maps topic codes to live `TopicState`s. The registry lock
//! is only held to look a topic up or to insert/remove one; all per-topic
//! work (endpoints, pending deliveries) happens under the topic's own mutex,
//! so operations on unrelated topics never wait for each other.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::broker::ack::PendingMessage;
use crate::broker::endpoint::EndpointDirectory;
use crate::broker::message::{MessageId, TopicCode};
use crate::utils::{BrokerError, Result};

/// What a topic does when its pending-message count reaches capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the new send with `CapacityExceeded`.
    #[default]
    RejectNew,
    /// Evict the oldest pending message to admit the new one.
    DropOld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub code: TopicCode,
    pub overflow_policy: OverflowPolicy,
    pub overflow_capacity: usize,
    pub requires_auth: bool,
    /// `create_topic` waits for the definition to reach disk.
    pub blocking: bool,
}

impl TopicConfig {
    pub fn new(code: impl Into<TopicCode>) -> Self {
        Self {
            code: code.into(),
            overflow_policy: OverflowPolicy::RejectNew,
            overflow_capacity: 1024,
            requires_auth: false,
            blocking: false,
        }
    }

    pub fn overflow(mut self, policy: OverflowPolicy, capacity: usize) -> Self {
        self.overflow_policy = policy;
        self.overflow_capacity = capacity;
        self
    }

    pub fn requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(BrokerError::InvalidPolicy("topic code is empty".to_string()));
        }
        if self.overflow_capacity == 0 {
            return Err(BrokerError::InvalidPolicy(format!(
                "topic {} has zero overflow capacity",
                self.code
            )));
        }
        Ok(())
    }
}

/// Everything the broker tracks for one topic, guarded by one mutex.
#[derive(Debug)]
pub struct TopicInner {
    pub config: TopicConfig,
    pub directory: EndpointDirectory,
    /// Messages that still count against the overflow capacity, oldest first.
    pub pending: BTreeMap<MessageId, PendingMessage>,
    pub next_message_id: u64,
    /// Ids below this are reserved in the store; allocation past it must
    /// reserve another block first.
    pub id_ceiling: u64,
    /// Round-robin position for `Push` delivery.
    pub push_cursor: usize,
}

#[derive(Debug)]
pub struct TopicState {
    inner: Mutex<TopicInner>,
}

impl TopicState {
    pub fn new(config: TopicConfig) -> Self {
        Self::with_next_id(config, 1)
    }

    pub fn with_next_id(config: TopicConfig, next_message_id: u64) -> Self {
        Self {
            inner: Mutex::new(TopicInner {
                config,
                directory: EndpointDirectory::default(),
                pending: BTreeMap::new(),
                next_message_id,
                id_ceiling: next_message_id,
                push_cursor: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TopicInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> TopicConfig {
        self.lock().config.clone()
    }
}

impl TopicInner {
    pub fn needs_reservation(&self) -> bool {
        self.next_message_id >= self.id_ceiling
    }

    pub fn allocate_id(&mut self) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.config.overflow_capacity
    }
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: RwLock<HashMap<TopicCode, Arc<TopicState>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fully built topic. Nothing is visible until the insert.
    pub fn insert(&self, state: TopicState) -> Result<Arc<TopicState>> {
        let code = state.config().code;
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(&code) {
            return Err(BrokerError::AlreadyExists(code));
        }
        let state = Arc::new(state);
        topics.insert(code, state.clone());
        Ok(state)
    }

    pub fn get(&self, code: &str) -> Result<Arc<TopicState>> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("topic {code}")))
    }

    pub fn remove(&self, code: &str) -> Result<Arc<TopicState>> {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code)
            .ok_or_else(|| BrokerError::NotFound(format!("topic {code}")))
    }

    /// Snapshot of the live topics; the registry lock is released on return.
    pub fn all(&self) -> Vec<Arc<TopicState>> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
