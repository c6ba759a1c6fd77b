//! Change notification and the messaging event bus.
//!
//! Two observer surfaces leave the core:
//!
//! - [`Listeners`]: an ordered list of callbacks, used by each message store to
//!   announce "something changed" with no payload.
//! - [`EventBus`]: a handler table keyed by [`EventKind`]. Every event is a
//!   [`MeshEvent`] variant; handlers registered for its kind run synchronously in
//!   subscription order, followed by catch-all handlers.
//!
//! Callbacks are invoked after the internal lock is released, so a handler may
//! subscribe, unsubscribe or read the store that notified it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::messaging::types::{
    BucketSelector, DeviceId, DraftKey, Message, MessageId, MessageState,
};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Ordered list of callbacks sharing one payload type.
pub struct Listeners<T> {
    table: Arc<Mutex<ListenerTable<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `callback`; the returned [`Subscription`] removes it again.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push((id, Arc::new(callback)));
            id
        };
        let weak = Arc::downgrade(&self.table);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
                    table.entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Invoke every callback in registration order.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the callback registered;
/// call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    MessageSent,
    MessageFailed,
    MessageStateChanged,
    MessageDeleted,
    MessagesCleared,
    DraftSaved,
    DraftCleared,
    ConnectionStateChanged,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    MessageReceived {
        device_id: DeviceId,
        message: Message,
    },
    MessageSent {
        device_id: DeviceId,
        message: Message,
    },
    MessageFailed {
        device_id: DeviceId,
        message: Message,
        reason: String,
    },
    MessageStateChanged {
        device_id: DeviceId,
        message_id: MessageId,
        selector: BucketSelector,
        previous: MessageState,
        new: MessageState,
    },
    MessageDeleted {
        device_id: DeviceId,
        message_id: MessageId,
        selector: BucketSelector,
    },
    MessagesCleared {
        device_id: DeviceId,
    },
    DraftSaved {
        device_id: DeviceId,
        key: DraftKey,
        content: String,
    },
    DraftCleared {
        device_id: DeviceId,
        key: DraftKey,
    },
    ConnectionStateChanged {
        device_id: DeviceId,
        connected: bool,
        timestamp: DateTime<Utc>,
    },
    Error {
        device_id: Option<DeviceId>,
        context: String,
        error: String,
    },
}

impl MeshEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MeshEvent::MessageReceived { .. } => EventKind::MessageReceived,
            MeshEvent::MessageSent { .. } => EventKind::MessageSent,
            MeshEvent::MessageFailed { .. } => EventKind::MessageFailed,
            MeshEvent::MessageStateChanged { .. } => EventKind::MessageStateChanged,
            MeshEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
            MeshEvent::MessagesCleared { .. } => EventKind::MessagesCleared,
            MeshEvent::DraftSaved { .. } => EventKind::DraftSaved,
            MeshEvent::DraftCleared { .. } => EventKind::DraftCleared,
            MeshEvent::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            MeshEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Central dispatcher for [`MeshEvent`]s.
#[derive(Default)]
pub struct EventBus {
    by_kind: Mutex<HashMap<EventKind, Listeners<MeshEvent>>>,
    any: Listeners<MeshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        let listeners = {
            let mut map = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(kind).or_default().clone()
        };
        listeners.subscribe(handler)
    }

    /// Handle every event, after the kind-specific handlers have run.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.any.subscribe(handler)
    }

    pub fn emit(&self, event: MeshEvent) {
        let listeners = {
            let map = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
            map.get(&event.kind()).cloned()
        };
        if let Some(listeners) = listeners {
            listeners.notify(&event);
        }
        self.any.notify(&event);
    }

    /// Total live subscriptions across all kinds.
    pub fn subscription_count(&self) -> usize {
        let map = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().map(Listeners::len).sum::<usize>() + self.any.len()
    }

    /// Drop every handler.
    pub fn dispose(&self) {
        let map = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
        for listeners in map.values() {
            listeners.clear();
        }
        self.any.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_run_in_order_and_unsubscribe() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners: Listeners<u32> = Listeners::new();
        let a = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().unwrap().push(("a", *v)))
        };
        let _b = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().unwrap().push(("b", *v)))
        };
        listeners.notify(&1);
        a.unsubscribe();
        listeners.notify(&2);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 1), ("b", 1), ("b", 2)]);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn bus_routes_by_kind() {
        let bus = EventBus::new();
        let cleared = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        {
            let cleared = cleared.clone();
            bus.subscribe(EventKind::MessagesCleared, move |_| {
                cleared.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let all = all.clone();
            bus.subscribe_all(move |_| {
                all.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(MeshEvent::MessagesCleared { device_id: 1 });
        bus.emit(MeshEvent::DraftCleared {
            device_id: 1,
            key: DraftKey::Broadcast,
        });
        assert_eq!(cleared.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscription_count(), 2);
        bus.dispose();
        assert_eq!(bus.subscription_count(), 0);
    }
}
