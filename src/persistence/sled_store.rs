//! Durable message store backed by `sled`
//!
//! Layout:
//! - `topics`: topic code -> JSON `TopicConfig`
//! - `durable/<topic>`: big-endian message id -> JSON `StoredMessage`
//! - `archive/<topic>`: settled messages, only when `archive_settled` is on
//! - `sequences`: topic code -> exclusive ceiling of reserved message ids
//!
//! Big-endian keys make a tree scan yield messages in id order.
//!
//! Settlement bookkeeping (which endpoints reached the settling level) lives
//! in memory, sharded per topic. Settling removes the entry under the shard
//! lock, so whichever of the ack path and the sweeper gets there first wins
//! and the other sees a no-op.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::broker::ack::{DeliveryState, settle_level};
use crate::broker::message::{EndpointId, Message, MessageId, TopicCode};
use crate::broker::topic::TopicConfig;
use crate::config::StorageSettings;
use crate::utils::{BrokerError, Result};

const TOPICS_TREE: &str = "topics";
const SEQUENCES_TREE: &str = "sequences";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredMessage {
    pub message: Message,
    /// Receivers that reached the settling level so far.
    pub settled_receivers: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ArchivedMessage {
    pub message: Message,
    pub settlement: Settlement,
    pub settled_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DurableHandle {
    pub topic: TopicCode,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    QuotaReached,
    Expired,
    /// Pushed out by a `DropOld` overflow.
    Evicted,
}

#[derive(Debug)]
struct DurableEntry {
    expire_at: i64,
    max_receivers: u32,
    level: DeliveryState,
    reached: HashSet<EndpointId>,
    restored: u32,
}

impl DurableEntry {
    fn receivers(&self) -> u32 {
        self.restored + self.reached.len() as u32
    }
}

type Shard = Arc<Mutex<HashMap<MessageId, DurableEntry>>>;

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    archive_settled: bool,
    shards: Arc<RwLock<HashMap<TopicCode, Shard>>>,
}

impl Persistence {
    /// Open or create the sled database described by `settings`.
    pub fn open(settings: &StorageSettings) -> Result<Self> {
        let mut config = sled::Config::new().temporary(settings.temporary);
        if !settings.path.is_empty() {
            config = config.path(&settings.path);
        }
        Ok(Self {
            db: config.open()?,
            archive_settled: settings.archive_settled,
            shards: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn temporary() -> Result<Self> {
        Self::open(&StorageSettings::temporary())
    }

    fn durable_tree(&self, topic: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("durable/{topic}"))?)
    }

    fn archive_tree(&self, topic: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("archive/{topic}"))?)
    }

    fn shard(&self, topic: &str) -> Shard {
        if let Some(shard) = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
        {
            return shard.clone();
        }
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    fn existing_shard(&self, topic: &str) -> Option<Shard> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Persist a durable message and start tracking its settlement.
    pub fn persist(&self, message: &Message) -> Result<DurableHandle> {
        let durability = message.header.durability.ok_or_else(|| {
            BrokerError::InvalidPolicy(format!("message {} has no durability", message.id))
        })?;
        let handle = DurableHandle {
            topic: message.header.topic.clone(),
            message_id: message.id,
        };
        let stored = StoredMessage {
            message: message.clone(),
            settled_receivers: 0,
        };
        self.durable_tree(&handle.topic)?
            .insert(message.id.0.to_be_bytes(), serde_json::to_vec(&stored)?)?;

        let shard = self.shard(&handle.topic);
        shard.lock().unwrap_or_else(PoisonError::into_inner).insert(
            message.id,
            DurableEntry {
                expire_at: durability.expire_at,
                max_receivers: durability.max_receivers,
                level: settle_level(message.header.ack_kind),
                reached: HashSet::new(),
                restored: 0,
            },
        );
        debug!(topic = %handle.topic, message_id = %message.id, "persisted durable message");
        Ok(handle)
    }

    /// Reloads the unsettled durable messages of a topic, in id order, and
    /// resumes tracking them.
    pub fn restore(&self, topic: &str) -> Result<Vec<StoredMessage>> {
        let tree = self.durable_tree(topic)?;
        let mut restored = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let stored: StoredMessage = match serde_json::from_slice(&value) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(topic, "skipping undecodable durable message: {e}");
                    continue;
                }
            };
            restored.push(stored);
        }

        let shard = self.shard(topic);
        let mut entries = shard.lock().unwrap_or_else(PoisonError::into_inner);
        for stored in &restored {
            if let Some(durability) = stored.message.header.durability {
                entries.insert(
                    stored.message.id,
                    DurableEntry {
                        expire_at: durability.expire_at,
                        max_receivers: durability.max_receivers,
                        level: settle_level(stored.message.header.ack_kind),
                        reached: HashSet::new(),
                        restored: stored.settled_receivers,
                    },
                );
            }
        }
        Ok(restored)
    }

    /// Records that `endpoint_id` acknowledged the message up to `state`.
    /// Returns `true` if this call settled the message.
    pub fn mark_delivered(
        &self,
        handle: &DurableHandle,
        endpoint_id: EndpointId,
        state: DeliveryState,
    ) -> Result<bool> {
        let Some(shard) = self.existing_shard(&handle.topic) else {
            return Ok(false);
        };

        let (receivers, settled) = {
            let mut entries = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = entries.get_mut(&handle.message_id) else {
                return Ok(false);
            };
            if state == DeliveryState::Failed || state < entry.level {
                return Ok(false);
            }
            if !entry.reached.insert(endpoint_id) {
                return Ok(false);
            }
            let receivers = entry.receivers();
            let settled = receivers >= entry.max_receivers;
            if settled {
                entries.remove(&handle.message_id);
            }
            (receivers, settled)
        };

        if settled {
            self.release(handle, Settlement::QuotaReached)?;
        } else {
            self.record_progress(handle, receivers)?;
        }
        Ok(settled)
    }

    fn record_progress(&self, handle: &DurableHandle, receivers: u32) -> Result<()> {
        let tree = self.durable_tree(&handle.topic)?;
        let key = handle.message_id.0.to_be_bytes();
        if let Some(value) = tree.get(key)? {
            let mut stored: StoredMessage = serde_json::from_slice(&value)?;
            stored.settled_receivers = receivers;
            tree.insert(key, serde_json::to_vec(&stored)?)?;
        }
        Ok(())
    }

    pub fn is_settled(&self, handle: &DurableHandle) -> bool {
        match self.existing_shard(&handle.topic) {
            Some(shard) => !shard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&handle.message_id),
            None => true,
        }
    }

    /// Settles `handle` for `settlement` unless something else settled it
    /// first. Returns whether this call did the settling.
    pub fn settle(&self, handle: &DurableHandle, settlement: Settlement) -> Result<bool> {
        let Some(shard) = self.existing_shard(&handle.topic) else {
            return Ok(false);
        };
        let removed = shard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.message_id)
            .is_some();
        if removed {
            self.release(handle, settlement)?;
        }
        Ok(removed)
    }

    /// Settles every entry whose `expire_at` is not after `now`. Handles
    /// already settled are skipped, so repeated sweeps are no-ops.
    pub fn sweep_expired(&self, now: i64) -> Vec<DurableHandle> {
        let shards: Vec<(TopicCode, Shard)> = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(topic, shard)| (topic.clone(), shard.clone()))
            .collect();

        let mut expired = Vec::new();
        for (topic, shard) in shards {
            let ids: Vec<MessageId> = {
                let mut entries = shard.lock().unwrap_or_else(PoisonError::into_inner);
                let ids: Vec<MessageId> = entries
                    .iter()
                    .filter(|(_, entry)| entry.expire_at <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ids {
                    entries.remove(id);
                }
                ids
            };
            for message_id in ids {
                let handle = DurableHandle {
                    topic: topic.clone(),
                    message_id,
                };
                if let Err(e) = self.release(&handle, Settlement::Expired) {
                    warn!(topic = %handle.topic, message_id = %message_id, "failed to release expired message: {e}");
                }
                expired.push(handle);
            }
        }
        expired
    }

    /// Removes a settled message from the live tree, archiving it if
    /// configured to.
    fn release(&self, handle: &DurableHandle, settlement: Settlement) -> Result<()> {
        let removed = self
            .durable_tree(&handle.topic)?
            .remove(handle.message_id.0.to_be_bytes())?;
        debug!(topic = %handle.topic, message_id = %handle.message_id, ?settlement, "settled durable message");

        if self.archive_settled {
            if let Some(value) = removed {
                let stored: StoredMessage = serde_json::from_slice(&value)?;
                let archived = ArchivedMessage {
                    message: stored.message,
                    settlement,
                    settled_at: chrono::Utc::now().timestamp_millis(),
                };
                self.archive_tree(&handle.topic)?.insert(
                    handle.message_id.0.to_be_bytes(),
                    serde_json::to_vec(&archived)?,
                )?;
            }
        }
        Ok(())
    }

    pub fn archived(&self, topic: &str) -> Result<Vec<ArchivedMessage>> {
        let tree = self.archive_tree(topic)?;
        let mut archived = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            archived.push(serde_json::from_slice(&value)?);
        }
        Ok(archived)
    }

    /// Number of durable messages of `topic` still awaiting settlement.
    pub fn unsettled(&self, topic: &str) -> usize {
        self.existing_shard(topic).map_or(0, |shard| {
            shard.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn save_topic(&self, config: &TopicConfig) -> Result<()> {
        self.db
            .open_tree(TOPICS_TREE)?
            .insert(config.code.as_bytes(), serde_json::to_vec(config)?)?;
        Ok(())
    }

    pub fn load_topics(&self) -> Result<Vec<TopicConfig>> {
        let tree = self.db.open_tree(TOPICS_TREE)?;
        let mut topics = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            topics.push(serde_json::from_slice(&value)?);
        }
        Ok(topics)
    }

    /// Records that ids below `ceiling` may be handed out for `topic`, so a
    /// restarted broker never reuses one.
    pub fn reserve_ids(&self, topic: &str, ceiling: u64) -> Result<()> {
        self.db
            .open_tree(SEQUENCES_TREE)?
            .insert(topic.as_bytes(), ceiling.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub fn id_ceiling(&self, topic: &str) -> Result<Option<u64>> {
        let value = self.db.open_tree(SEQUENCES_TREE)?.get(topic.as_bytes())?;
        Ok(value.and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok().map(u64::from_be_bytes)))
    }

    /// Forgets a topic: its definition, live durable messages and archive.
    pub fn remove_topic(&self, code: &str) -> Result<()> {
        self.db.open_tree(TOPICS_TREE)?.remove(code.as_bytes())?;
        self.db.open_tree(SEQUENCES_TREE)?.remove(code.as_bytes())?;
        self.db.drop_tree(format!("durable/{code}"))?;
        self.db.drop_tree(format!("archive/{code}"))?;
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code);
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("archive_settled", &self.archive_settled)
            .finish()
    }
}
