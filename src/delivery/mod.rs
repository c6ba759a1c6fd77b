//! Outbound delivery queue
//!
//! Serialises text sends for one device against the congestion the radio reports.
//! Callers enqueue and get an id back immediately; a single drain task per queue pops
//! items in FIFO order, waits out the current backoff, hands each one to the
//! [`Transport`] and writes the outcome into the device's [`MessageStore`]:
//!
//! * success: stored as `Ack` under the id the device assigned, `MessageSent` emitted
//! * failure: stored as `Failed` under a locally generated id, `MessageFailed` emitted
//!
//! Nothing is retried and no send error reaches the caller of [`DeliveryQueue::enqueue`].
//!
//! Backoff is re-evaluated before every send from the latest [`QueueStatus`], see
//! [`backoff_delay`].

mod backoff;

pub use backoff::backoff_delay;

use chrono::Utc;
use log::{debug, error, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

use crate::config::QueueConfig;
use crate::events::{EventBus, MeshEvent};
use crate::logutil::content_preview;
use crate::messaging::store::MessageStore;
use crate::messaging::types::{DeviceId, Message, MessageId, MessageState};
use crate::transport::{QueueStatus, TextRequest, Transport};

pub type QueueItemId = u32;

/// Random nonzero id for queue items and locally failed messages.
pub fn random_message_id() -> MessageId {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

#[derive(Debug, Clone)]
pub struct QueuedText {
    pub id: QueueItemId,
    pub request: TextRequest,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub dispatched_total: u64,
    pub acked_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
}

struct QueueState {
    items: VecDeque<QueuedText>,
    draining: bool,
    free_slots: u32,
    stats: QueueStats,
}

struct QueueInner {
    device_id: DeviceId,
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    store: Arc<MessageStore>,
    events: Arc<EventBus>,
    state: Mutex<QueueState>,
    busy: watch::Sender<bool>,
}

/// Clears the draining flag if the drain task ends without reaching its normal exit
/// (panic in a listener, task aborted on runtime shutdown).
struct DrainGuard {
    inner: Arc<QueueInner>,
    armed: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock();
            state.draining = false;
            self.inner.busy.send_replace(false);
            warn!("device {}: delivery drain ended abnormally", self.inner.device_id);
        }
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a drain unless one is already running or there is nothing to send.
    fn kick(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "device {}: no async runtime; queued messages wait for the next status update",
                self.device_id
            );
            return;
        };
        {
            let mut state = self.lock();
            if state.draining || state.items.is_empty() {
                return;
            }
            state.draining = true;
            self.busy.send_replace(true);
        }
        let inner = Arc::clone(self);
        runtime.spawn(inner.drain());
    }

    async fn drain(self: Arc<Self>) {
        let mut guard = DrainGuard {
            inner: Arc::clone(&self),
            armed: true,
        };
        loop {
            let free = {
                let mut state = self.lock();
                if state.items.is_empty() {
                    state.draining = false;
                    self.busy.send_replace(false);
                    guard.armed = false;
                    return;
                }
                state.free_slots
            };

            let delay = backoff_delay(free, &self.config);
            if !delay.is_zero() {
                if free <= self.config.congestion_threshold {
                    debug!(
                        "device {}: radio queue congested (free={}), backing off {:?}",
                        self.device_id, free, delay
                    );
                }
                tokio::time::sleep(delay).await;
            }

            // The item may have been cancelled while we slept
            let item = {
                let mut state = self.lock();
                match state.items.pop_front() {
                    Some(item) => {
                        state.stats.dispatched_total += 1;
                        item
                    }
                    None => continue,
                }
            };
            self.dispatch(item).await;
        }
    }

    async fn dispatch(&self, item: QueuedText) {
        let request = &item.request;
        let from = self.store.my_node_num().unwrap_or_else(|| {
            warn!(
                "device {}: local node number unknown; recording sender as 0",
                self.device_id
            );
            0
        });
        debug!(
            "device {}: sending queue item {} to {} on channel {}: {}",
            self.device_id,
            item.id,
            request.destination,
            request.channel,
            content_preview(&request.content)
        );

        let outcome = self.transport.send_text(request).await;
        let (message_id, state, failure) = match outcome {
            Ok(id) => (id, MessageState::Ack, None),
            Err(e) => (random_message_id(), MessageState::Failed, Some(e.to_string())),
        };
        let message = Message {
            message_id,
            kind: request.destination.message_type(),
            from,
            to: request.destination.stored_to(from),
            channel: request.channel,
            content: request.content.clone(),
            timestamp: Utc::now(),
            state,
            rx_snr: None,
            rx_time: None,
        };
        self.store.save_message(message.clone());

        match failure {
            None => {
                self.lock().stats.acked_total += 1;
                debug!(
                    "device {}: queue item {} sent as message {} after {:?}",
                    self.device_id,
                    item.id,
                    message_id,
                    item.enqueued_at.elapsed()
                );
                self.events.emit(MeshEvent::MessageSent {
                    device_id: self.device_id,
                    message,
                });
            }
            Some(reason) => {
                self.lock().stats.failed_total += 1;
                error!(
                    "device {}: failed to send queue item {} to {}: {}",
                    self.device_id, item.id, request.destination, reason
                );
                self.events.emit(MeshEvent::MessageFailed {
                    device_id: self.device_id,
                    message,
                    reason,
                });
            }
        }
    }
}

/// Per-device FIFO of outbound texts with congestion-aware pacing.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    pub fn new(
        device_id: DeviceId,
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        store: Arc<MessageStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let free_slots = config.max_free_slots;
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                device_id,
                config,
                transport,
                store,
                events,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    draining: false,
                    free_slots,
                    stats: QueueStats::default(),
                }),
                busy,
            }),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Queue a send and start draining if idle. Returns the queue item id, usable with
    /// [`remove_from_queue`](Self::remove_from_queue) until the item is dispatched.
    pub fn enqueue(&self, request: TextRequest) -> QueueItemId {
        let id = {
            let mut state = self.inner.lock();
            let mut id = random_message_id();
            while state.items.iter().any(|queued| queued.id == id) {
                id = random_message_id();
            }
            state.items.push_back(QueuedText {
                id,
                request,
                enqueued_at: Instant::now(),
            });
            debug!(
                "device {}: queued item {} (pending={})",
                self.inner.device_id,
                id,
                state.items.len()
            );
            id
        };
        self.inner.kick();
        id
    }

    /// Cancel an item that has not been handed to the transport yet.
    pub fn remove_from_queue(&self, id: QueueItemId) -> bool {
        let mut state = self.inner.lock();
        match state.items.iter().position(|queued| queued.id == id) {
            Some(pos) => {
                state.items.remove(pos);
                state.stats.cancelled_total += 1;
                debug!("device {}: cancelled queue item {}", self.inner.device_id, id);
                true
            }
            None => false,
        }
    }

    /// Record the radio's latest TX queue occupancy and resume draining if needed.
    pub fn update_queue_status(&self, status: QueueStatus) {
        self.inner.lock().free_slots = status.free;
        debug!(
            "device {}: radio queue status free={} maxlen={}",
            self.inner.device_id, status.free, status.maxlen
        );
        self.inner.kick();
    }

    pub fn free_slots(&self) -> u32 {
        self.inner.lock().free_slots
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Ids of undispatched items, front of the queue first.
    pub fn pending_ids(&self) -> Vec<QueueItemId> {
        self.inner.lock().items.iter().map(|queued| queued.id).collect()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            queued: state.items.len(),
            ..state.stats.clone()
        }
    }

    /// Resolve once no drain is running.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|draining| !*draining).await;
    }
}
