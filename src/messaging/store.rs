//! Per-device message store.
//!
//! A [`MessageStore`] keeps every message exchanged through one attached device,
//! bucketed by direct conversation ([`conversation_id`]) or broadcast channel, plus
//! unsent drafts. Each bucket is capped at the store's retention limit; inserting past
//! the cap evicts the oldest messages by timestamp.
//!
//! The store is internally synchronised and shared as `Arc<MessageStore>` between the
//! store manager, the delivery queue and pipeline processors. Every mutation fires the
//! change listeners registered through [`MessageStore::subscribe`] once the internal
//! lock has been released.
//!
//! Lookups that miss (unknown bucket or message id) are logged and ignored: an
//! eviction racing with an in-flight state update is expected and harmless.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::eviction::evict_oldest_entries;
use super::types::{
    conversation_id, BucketSelector, ChannelId, ConversationId, DeviceId, DraftKey, Message,
    MessageId, MessageLogMap, MessageState, MessageType, NodeNum,
};
use crate::events::{Listeners, Subscription};

/// Default maximum number of messages kept per conversation or channel.
pub const DEFAULT_MESSAGE_RETENTION: usize = 1000;

/// Direct and broadcast buckets of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBuckets {
    #[serde(default)]
    pub direct: BTreeMap<ConversationId, MessageLogMap>,
    #[serde(default)]
    pub broadcast: BTreeMap<ChannelId, MessageLogMap>,
}

impl MessageBuckets {
    fn bucket(&self, selector: &BucketSelector) -> Option<&MessageLogMap> {
        match selector {
            BucketSelector::Direct { node_a, node_b } => {
                self.direct.get(&conversation_id(*node_a, *node_b))
            }
            BucketSelector::Broadcast { channel } => self.broadcast.get(channel),
        }
    }

    fn bucket_mut(&mut self, selector: &BucketSelector) -> Option<&mut MessageLogMap> {
        match selector {
            BucketSelector::Direct { node_a, node_b } => {
                self.direct.get_mut(&conversation_id(*node_a, *node_b))
            }
            BucketSelector::Broadcast { channel } => self.broadcast.get_mut(channel),
        }
    }

    pub fn message_count(&self) -> usize {
        self.direct.values().map(|b| b.len()).sum::<usize>()
            + self.broadcast.values().map(|b| b.len()).sum::<usize>()
    }
}

/// Serializable image of a store, used for persistence and equality checks.
///
/// In JSON every map key becomes a string; deserialising restores numeric message
/// ids, channel ids and [`DraftKey`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_node_num: Option<NodeNum>,
    #[serde(default)]
    pub messages: MessageBuckets,
    #[serde(default)]
    pub drafts: BTreeMap<DraftKey, String>,
}

#[derive(Debug, Default)]
struct StoreState {
    my_node_num: Option<NodeNum>,
    messages: MessageBuckets,
    drafts: BTreeMap<DraftKey, String>,
}

pub struct MessageStore {
    id: DeviceId,
    retention_limit: usize,
    state: Mutex<StoreState>,
    listeners: Listeners<()>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("id", &self.id)
            .field("retention_limit", &self.retention_limit)
            .field("my_node_num", &self.my_node_num())
            .finish()
    }
}

impl MessageStore {
    pub fn new(id: DeviceId) -> Self {
        Self::with_retention(id, None, DEFAULT_MESSAGE_RETENTION)
    }

    pub fn with_retention(id: DeviceId, my_node_num: Option<NodeNum>, retention_limit: usize) -> Self {
        Self {
            id,
            retention_limit,
            state: Mutex::new(StoreState {
                my_node_num,
                ..StoreState::default()
            }),
            listeners: Listeners::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_change(&self) {
        self.listeners.notify(&());
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn retention_limit(&self) -> usize {
        self.retention_limit
    }

    pub fn my_node_num(&self) -> Option<NodeNum> {
        self.lock().my_node_num
    }

    /// Record the local node number used to tell inbound from outbound traffic.
    pub fn set_node_num(&self, node_num: NodeNum) {
        self.lock().my_node_num = Some(node_num);
        self.notify_change();
    }

    /// Insert (or replace, by id) a message in its bucket and enforce retention.
    pub fn save_message(&self, message: Message) {
        {
            let mut state = self.lock();
            let limit = self.retention_limit;
            let (bucket_label, evicted) = match message.kind {
                MessageType::Direct => {
                    let key = conversation_id(message.from, message.to);
                    let bucket = state.messages.direct.entry(key.clone()).or_default();
                    bucket.insert(message.message_id, message);
                    (key, evict_oldest_entries(bucket, limit))
                }
                MessageType::Broadcast => {
                    let channel = message.channel;
                    let bucket = state.messages.broadcast.entry(channel).or_default();
                    bucket.insert(message.message_id, message);
                    (format!("channel {}", channel), evict_oldest_entries(bucket, limit))
                }
            };
            if !evicted.is_empty() {
                debug!(
                    "store {}: evicted {} message(s) from {} (retention={})",
                    self.id,
                    evicted.len(),
                    bucket_label,
                    limit
                );
            }
        }
        self.notify_change();
    }

    /// Overwrite the state of one message. Returns the previous state when the message
    /// was found; a miss is logged and leaves the store untouched.
    pub fn set_message_state(
        &self,
        selector: BucketSelector,
        message_id: MessageId,
        new_state: MessageState,
    ) -> Option<MessageState> {
        let previous = {
            let mut state = self.lock();
            match state
                .messages
                .bucket_mut(&selector)
                .and_then(|bucket| bucket.get_mut(&message_id))
            {
                Some(message) => {
                    let previous = message.state;
                    message.state = new_state;
                    Some(previous)
                }
                None => None,
            }
        };
        if previous.is_none() {
            warn!(
                "store {}: message {} or {} not found for state update to {}",
                self.id, message_id, selector, new_state
            );
        }
        self.notify_change();
        previous
    }

    /// Messages of one bucket, oldest first. Empty when the bucket does not exist.
    pub fn get_messages(&self, selector: BucketSelector) -> Vec<Message> {
        let state = self.lock();
        let mut messages: Vec<Message> = state
            .messages
            .bucket(&selector)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        messages
    }

    pub fn get_message(&self, selector: BucketSelector, message_id: MessageId) -> Option<Message> {
        self.lock()
            .messages
            .bucket(&selector)
            .and_then(|bucket| bucket.get(&message_id))
            .cloned()
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.lock().messages.direct.keys().cloned().collect()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.lock().messages.broadcast.keys().copied().collect()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.message_count()
    }

    pub fn get_draft(&self, key: DraftKey) -> String {
        self.lock().drafts.get(&key).cloned().unwrap_or_default()
    }

    pub fn set_draft(&self, key: DraftKey, text: impl Into<String>) {
        self.lock().drafts.insert(key, text.into());
        self.notify_change();
    }

    pub fn clear_draft(&self, key: DraftKey) {
        self.lock().drafts.remove(&key);
        self.notify_change();
    }

    pub fn delete_all_messages(&self) {
        {
            let mut state = self.lock();
            state.messages.direct.clear();
            state.messages.broadcast.clear();
        }
        self.notify_change();
    }

    /// Remove a single message, dropping its bucket once empty. Returns whether a
    /// message was removed.
    pub fn clear_message_by_message_id(&self, selector: BucketSelector, message_id: MessageId) -> bool {
        let removed = {
            let mut state = self.lock();
            let messages = &mut state.messages;
            match selector {
                BucketSelector::Direct { node_a, node_b } => {
                    let key = conversation_id(node_a, node_b);
                    remove_from_parent(self.id, &mut messages.direct, &key, message_id, &selector)
                }
                BucketSelector::Broadcast { channel } => {
                    remove_from_parent(self.id, &mut messages.broadcast, &channel, message_id, &selector)
                }
            }
        };
        self.notify_change();
        removed
    }

    /// Register a callback fired after every mutation.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |_: &()| listener())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            id: self.id,
            my_node_num: state.my_node_num,
            messages: state.messages.clone(),
            drafts: state.drafts.clone(),
        }
    }

    /// Rebuild a store from a snapshot. Buckets larger than `retention_limit` are
    /// trimmed to the newest messages.
    pub fn from_snapshot(snapshot: StoreSnapshot, retention_limit: usize) -> Self {
        let StoreSnapshot {
            id,
            my_node_num,
            mut messages,
            drafts,
        } = snapshot;
        let trimmed: usize = messages
            .direct
            .values_mut()
            .chain(messages.broadcast.values_mut())
            .map(|bucket| evict_oldest_entries(bucket, retention_limit).len())
            .sum();
        if trimmed > 0 {
            debug!(
                "store {}: trimmed {} message(s) over retention while restoring",
                id, trimmed
            );
        }
        Self {
            id,
            retention_limit,
            state: Mutex::new(StoreState {
                my_node_num,
                messages,
                drafts,
            }),
            listeners: Listeners::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn from_json(json: &str, retention_limit: usize) -> serde_json::Result<Self> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot, retention_limit))
    }
}

fn remove_from_parent<K: Ord + std::fmt::Display>(
    store_id: DeviceId,
    parent: &mut BTreeMap<K, MessageLogMap>,
    key: &K,
    message_id: MessageId,
    selector: &BucketSelector,
) -> bool {
    let Some(bucket) = parent.get_mut(key) else {
        warn!(
            "store {}: {} not found for deletion of message {}",
            store_id, selector, message_id
        );
        return false;
    };
    if bucket.remove(&message_id).is_none() {
        warn!(
            "store {}: message {} not found in {} for deletion",
            store_id, message_id, selector
        );
        return false;
    }
    debug!("store {}: deleted message {} from {}", store_id, message_id, selector);
    if bucket.is_empty() {
        parent.remove(key);
        debug!("store {}: removed empty bucket {}", store_id, key);
    }
    true
}
