//! Message retention, processing and per-device client wiring.
//!
//! - [`types`] - message records, bucket selectors, destinations and draft keys
//! - [`eviction`] - keep-newest-N policy shared by message buckets and the store registry
//! - [`store`] - per-device message store with drafts and change notification
//! - [`manager`] - registry of stores with debounced persistence
//! - [`pipeline`] - ordered, fail-fast processor chain and stock processors
//! - [`client`] - façade tying a device's store, pipelines and delivery queue together

pub mod client;
pub mod eviction;
pub mod manager;
pub mod pipeline;
pub mod store;
pub mod types;

pub use client::{ClientConfig, ClientError, MessagingClient, SendTextParams};
pub use manager::MessageStoreManager;
pub use store::{MessageStore, StoreSnapshot};
pub use types::{
    conversation_id, BucketSelector, Destination, DraftKey, Message, MessageState, MessageType,
};
