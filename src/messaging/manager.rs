//! Registry of per-device message stores with debounced persistence.
//!
//! The [`MessageStoreManager`] owns every [`MessageStore`] for the lifetime of the
//! process. It caps how many stores are kept (least recently touched go first),
//! subscribes to each store's change notifications and coalesces bursts of mutations
//! into a single write through the configured [`StorageAdapter`].
//!
//! ## Persistence lifecycle
//!
//! 1. `open()` initialises the adapter and restores stores that have a resolved local
//!    node number. An adapter that fails to initialise disables persistence for the
//!    rest of the process; stores keep working in memory.
//! 2. Every store mutation calls `schedule_save()`, which (re)arms a debounce timer.
//! 3. `force_save()` cancels the timer and writes immediately; `shutdown()` does the
//!    same and then refuses to arm further timers.
//!
//! Save and load failures are logged and never surface to callers mutating stores.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;

use super::eviction::{evict_oldest_entries, Timestamped};
use super::store::{MessageStore, StoreSnapshot};
use super::types::DeviceId;
use crate::config::MessagingConfig;
use crate::events::Subscription;
use crate::storage::StorageAdapter;

/// Version tag written alongside the persisted registry.
pub const PERSISTED_FORMAT_VERSION: u32 = 1;

/// On-disk image of the registry, stores ordered least recently touched first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRegistry {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub stores: Vec<(DeviceId, StoreSnapshot)>,
}

struct RegistryEntry {
    store: Arc<MessageStore>,
    /// Sequence number of the last attach; orders eviction.
    touched: u64,
    subscription: Option<Subscription>,
}

impl RegistryEntry {
    fn detach(mut self) -> Arc<MessageStore> {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.store
    }
}

impl Timestamped for RegistryEntry {
    fn sort_key(&self) -> i128 {
        i128::from(self.touched)
    }
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<DeviceId, RegistryEntry>,
    next_touch: u64,
}

impl Registry {
    fn touch(&mut self) -> u64 {
        self.next_touch += 1;
        self.next_touch
    }
}

#[derive(Default)]
struct DebounceSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct ManagerInner {
    config: MessagingConfig,
    store_retention_limit: usize,
    registry: Mutex<Registry>,
    storage: Option<Arc<dyn StorageAdapter>>,
    persistence_enabled: AtomicBool,
    shut_down: AtomicBool,
    debounce: Mutex<DebounceSlot>,
    /// Serialises every storage access made by this manager.
    io: tokio::sync::Mutex<()>,
}

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn debounce_slot(&self) -> MutexGuard<'_, DebounceSlot> {
        self.debounce.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persistence_enabled(&self) -> bool {
        self.persistence_enabled.load(Ordering::SeqCst)
    }

    /// Arrange for `store` mutations to schedule a save. Holds only a weak reference so
    /// stores never keep the manager alive.
    fn watch(self: &Arc<Self>, store: &MessageStore) -> Subscription {
        let weak: Weak<ManagerInner> = Arc::downgrade(self);
        store.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_save();
            }
        })
    }

    fn schedule_save(self: &Arc<Self>) {
        if !self.persistence_enabled() || self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime available; skipping scheduled message store save");
            return;
        };
        let delay = self.config.save_debounce();
        let weak = Arc::downgrade(self);

        let mut slot = self.debounce_slot();
        if let Some(pending) = slot.handle.take() {
            pending.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        slot.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut slot = inner.debounce_slot();
                if slot.generation != generation {
                    return;
                }
                // Disarm before writing so a later reschedule cannot abort this save
                slot.handle = None;
            }
            inner.save_to_storage().await;
        }));
    }

    fn cancel_pending(&self) {
        let mut slot = self.debounce_slot();
        slot.generation += 1;
        if let Some(pending) = slot.handle.take() {
            pending.abort();
            debug!("cancelled pending message store save");
        }
    }

    fn encode_registry(&self) -> serde_json::Result<(usize, Vec<u8>)> {
        let stores: Vec<(DeviceId, StoreSnapshot)> = {
            let registry = self.registry();
            let mut ordered: Vec<(&DeviceId, &RegistryEntry)> = registry.entries.iter().collect();
            ordered.sort_by_key(|(_, entry)| entry.touched);
            ordered
                .into_iter()
                .map(|(id, entry)| (*id, entry.store.snapshot()))
                .collect()
        };
        let count = stores.len();
        let persisted = PersistedRegistry {
            version: PERSISTED_FORMAT_VERSION,
            saved_at: Utc::now(),
            stores,
        };
        Ok((count, serde_json::to_vec(&persisted)?))
    }

    async fn save_to_storage(&self) {
        if !self.persistence_enabled() {
            return;
        }
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let _io = self.io.lock().await;
        let (count, blob) = match self.encode_registry() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to serialize message stores: {}", e);
                return;
            }
        };
        match storage.save(&self.config.storage_key, blob).await {
            Ok(()) => debug!("Saved {} message stores to storage", count),
            Err(e) => error!("Failed to save message stores: {}", e),
        }
    }

    fn insert_store(self: &Arc<Self>, registry: &mut Registry, store: Arc<MessageStore>) {
        let subscription = self.watch(&store);
        let touched = registry.touch();
        let id = store.id();
        let entry = RegistryEntry {
            store,
            touched,
            subscription: Some(subscription),
        };
        if let Some(previous) = registry.entries.insert(id, entry) {
            previous.detach();
        }
        for (evicted_id, evicted) in evict_oldest_entries(&mut registry.entries, self.store_retention_limit) {
            evicted.detach();
            info!(
                "Evicted message store for device {} (store limit {})",
                evicted_id, self.store_retention_limit
            );
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let slot = self.debounce.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.handle.take() {
            pending.abort();
        }
    }
}

/// Owner of all per-device [`MessageStore`]s.
#[derive(Clone)]
pub struct MessageStoreManager {
    inner: Arc<ManagerInner>,
}

impl MessageStoreManager {
    fn build(config: MessagingConfig, storage: Option<Arc<dyn StorageAdapter>>, enabled: bool) -> Self {
        let store_retention_limit = config.store_retention_limit.max(1);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store_retention_limit,
                registry: Mutex::new(Registry::default()),
                storage,
                persistence_enabled: AtomicBool::new(enabled),
                shut_down: AtomicBool::new(false),
                debounce: Mutex::new(DebounceSlot::default()),
                io: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// A manager that never persists, regardless of `enable_persistence`.
    pub fn in_memory(config: MessagingConfig) -> Self {
        Self::build(config, None, false)
    }

    /// Create a manager, initialise `storage` and restore persisted stores.
    pub async fn open(config: MessagingConfig, storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        let requested = config.enable_persistence;
        if requested && storage.is_none() {
            warn!("Message persistence requested without a storage backend; running in memory");
        }
        let enabled = requested && storage.is_some();
        let manager = Self::build(config, storage, enabled);
        if !enabled {
            return manager;
        }
        if let Some(storage) = manager.inner.storage.clone() {
            match storage.init().await {
                Ok(()) => manager.load_from_storage().await,
                Err(e) => {
                    error!("Failed to initialize message storage: {}; persistence disabled", e);
                    manager.inner.persistence_enabled.store(false, Ordering::SeqCst);
                }
            }
        }
        manager
    }

    pub fn is_persistence_enabled(&self) -> bool {
        self.inner.persistence_enabled()
    }

    /// Return the store for `device_id`, creating it if needed. Creating a store may
    /// evict the least recently touched one.
    pub fn get_or_create_store(&self, device_id: DeviceId) -> Arc<MessageStore> {
        let store = {
            let mut registry = self.inner.registry();
            let touched = registry.touch();
            if let Some(entry) = registry.entries.get_mut(&device_id) {
                entry.touched = touched;
                return Arc::clone(&entry.store);
            }
            let store = Arc::new(MessageStore::with_retention(
                device_id,
                None,
                self.inner.config.message_retention_limit,
            ));
            self.inner.insert_store(&mut registry, Arc::clone(&store));
            store
        };
        debug!("Created message store for device {}", device_id);
        self.inner.schedule_save();
        store
    }

    pub fn get_store(&self, device_id: DeviceId) -> Option<Arc<MessageStore>> {
        self.inner
            .registry()
            .entries
            .get(&device_id)
            .map(|entry| Arc::clone(&entry.store))
    }

    pub fn remove_store(&self, device_id: DeviceId) -> Option<Arc<MessageStore>> {
        let removed = self
            .inner
            .registry()
            .entries
            .remove(&device_id)
            .map(RegistryEntry::detach);
        if removed.is_some() {
            debug!("Removed message store for device {}", device_id);
        }
        self.inner.schedule_save();
        removed
    }

    /// All stores, ordered by device id.
    pub fn list_stores(&self) -> Vec<Arc<MessageStore>> {
        self.inner
            .registry()
            .entries
            .values()
            .map(|entry| Arc::clone(&entry.store))
            .collect()
    }

    pub fn store_count(&self) -> usize {
        self.inner.registry().entries.len()
    }

    /// (Re)arm the debounce timer. Calls inside the debounce window coalesce into one
    /// write. No-op when persistence is disabled or after shutdown.
    pub fn schedule_save(&self) {
        self.inner.schedule_save();
    }

    /// Cancel any pending timer and persist now.
    pub async fn force_save(&self) {
        self.inner.cancel_pending();
        self.inner.save_to_storage().await;
    }

    /// Restore persisted stores. Stores without a local node number were never attached
    /// to a device and are discarded. Devices already registered keep their live store.
    pub async fn load_from_storage(&self) {
        if !self.inner.persistence_enabled() {
            return;
        }
        let Some(storage) = self.inner.storage.clone() else {
            return;
        };
        let _io = self.inner.io.lock().await;
        let blob = match storage.load(&self.inner.config.storage_key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!("No persisted message stores under '{}'", self.inner.config.storage_key);
                return;
            }
            Err(e) => {
                error!("Failed to load message stores: {}", e);
                return;
            }
        };
        let persisted: PersistedRegistry = match serde_json::from_slice(&blob) {
            Ok(persisted) => persisted,
            Err(e) => {
                error!("Failed to decode persisted message stores: {}", e);
                return;
            }
        };
        if persisted.version != PERSISTED_FORMAT_VERSION {
            warn!(
                "Persisted message stores have version {} (expected {}); attempting to load anyway",
                persisted.version, PERSISTED_FORMAT_VERSION
            );
        }

        let mut restored = 0usize;
        let mut discarded = 0usize;
        let mut kept_live = 0usize;
        {
            let mut registry = self.inner.registry();
            for (device_id, mut snapshot) in persisted.stores {
                if snapshot.my_node_num.is_none() {
                    discarded += 1;
                    continue;
                }
                if registry.entries.contains_key(&device_id) {
                    kept_live += 1;
                    continue;
                }
                snapshot.id = device_id;
                let store = Arc::new(MessageStore::from_snapshot(
                    snapshot,
                    self.inner.config.message_retention_limit,
                ));
                self.inner.insert_store(&mut registry, store);
                restored += 1;
            }
        }
        if discarded > 0 {
            debug!("Discarded {} persisted store(s) with no node number", discarded);
        }
        if kept_live > 0 {
            debug!("Skipped {} persisted store(s) already registered", kept_live);
        }
        info!("Loaded {} message stores from storage", restored);
    }

    /// Drop every store and wipe durable storage.
    pub async fn clear_all_data(&self) {
        self.inner.cancel_pending();
        let entries = std::mem::take(&mut self.inner.registry().entries);
        for (_, entry) in entries {
            entry.detach();
        }
        if let Some(storage) = self.inner.storage.as_ref() {
            let _io = self.inner.io.lock().await;
            if let Err(e) = storage.clear().await {
                error!("Failed to clear message storage: {}", e);
            }
        }
        info!("Cleared all message store data");
    }

    /// Final save before the process exits. Further mutations are kept in memory only.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel_pending();
        self.inner.save_to_storage().await;
        self.inner.cancel_pending();
        info!("Message store manager shut down");
    }
}
