//! Test utilities & fakes shared by the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshmsg::config::MessagingConfig;
use meshmsg::events::{EventBus, MeshEvent};
use meshmsg::messaging::types::{MessageId, NodeNum};
use meshmsg::messaging::{Message, MessageState, MessageType};
use meshmsg::storage::{MemoryStorage, StorageAdapter, StorageError, StorageResult};
use meshmsg::transport::{TextRequest, Transport, TransportError};

pub const ME: NodeNum = 0x0A0B_0C0D;

/// Transport that answers from a script, then with increasing ids (starting at 1000).
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<MessageId, TransportError>>>,
    sent: Mutex<Vec<TextRequest>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, result: Result<MessageId, TransportError>) {
        self.replies.lock().unwrap().push_back(result);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn sent(&self) -> Vec<TextRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.content).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_text(&self, request: &TextRequest) -> Result<MessageId, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sent.lock().unwrap().push(request.clone());

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.replies.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(1000 + self.next_id.fetch_add(1, Ordering::SeqCst) as MessageId))
    }
}

/// Memory storage that counts writes and can be told to fail.
#[derive(Default)]
pub struct CountingStorage {
    inner: MemoryStorage,
    saves: AtomicUsize,
    fail_init: AtomicBool,
    fail_saves: AtomicBool,
}

impl CountingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_init() -> Arc<Self> {
        let storage = Self::default();
        storage.fail_init.store(true, Ordering::SeqCst);
        Arc::new(storage)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn backing(&self) -> MemoryStorage {
        self.inner.clone()
    }
}

#[async_trait]
impl StorageAdapter for CountingStorage {
    async fn init(&self) -> StorageResult<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("init refused".to_string()));
        }
        self.inner.init().await
    }

    async fn save(&self, key: &str, blob: Vec<u8>) -> StorageResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.save(key, blob).await
    }

    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.load(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.inner.clear().await
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.inner.list_keys().await
    }
}

/// Collect every event emitted on `bus`.
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<MeshEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe_all(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

pub fn persistent_config() -> MessagingConfig {
    MessagingConfig {
        enable_persistence: true,
        ..MessagingConfig::default()
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn direct(id: MessageId, from: NodeNum, to: NodeNum, secs: i64, content: &str) -> Message {
    Message {
        message_id: id,
        kind: MessageType::Direct,
        from,
        to,
        channel: 0,
        content: content.to_string(),
        timestamp: at(secs),
        state: MessageState::Ack,
        rx_snr: None,
        rx_time: None,
    }
}

pub fn broadcast(id: MessageId, from: NodeNum, channel: u32, secs: i64, content: &str) -> Message {
    Message {
        message_id: id,
        kind: MessageType::Broadcast,
        from,
        to: from,
        channel,
        content: content.to_string(),
        timestamp: at(secs),
        state: MessageState::Ack,
        rx_snr: None,
        rx_time: None,
    }
}
