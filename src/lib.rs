//! # meshmsg - Message core for Meshtastic clients
//!
//! Buffers, retains and delivers short text messages exchanged with a Meshtastic
//! device over a slow, lossy radio link.
//!
//! ## Features
//!
//! - **Message Stores**: per-device direct/broadcast buckets with bounded retention and drafts.
//! - **Store Manager**: caps how many device stores are kept and persists them with debounced, coalesced writes.
//! - **Processing Pipeline**: named, toggleable, fail-fast processors for outbound and inbound messages.
//! - **Delivery Queue**: single-flight FIFO that backs off as the radio reports congestion.
//! - **Pluggable Storage**: in-memory, sled or one-file-per-key JSON backends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshmsg::config::Config;
//! use meshmsg::events::EventBus;
//! use meshmsg::messaging::{ClientConfig, Destination, MessageStoreManager, MessagingClient, SendTextParams};
//! use meshmsg::storage::open_backend;
//! # use meshmsg::transport::Transport;
//!
//! # async fn run(transport: Arc<dyn Transport>) -> anyhow::Result<()> {
//! let config = Config::load("config.toml").await?;
//! let storage = open_backend(&config.storage)?;
//! let manager = MessageStoreManager::open(config.messaging.clone(), Some(storage)).await;
//!
//! let client = MessagingClient::new(
//!     ClientConfig::new(1, 0x1234_5678),
//!     &manager,
//!     transport,
//!     Arc::new(EventBus::new()),
//! );
//! client.send_text(SendTextParams::new("hello mesh", Destination::Broadcast)).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`messaging`] - stores, store manager, pipeline and the per-device client
//! - [`delivery`] - outbound delivery queue and congestion backoff
//! - [`transport`] - the seam to the radio link
//! - [`storage`] - durable storage adapter and backends
//! - [`events`] - change listeners and the event bus
//! - [`config`] - configuration management and validation
//! - [`logutil`] - log-safe content helpers and logger setup

pub mod config;
pub mod delivery;
pub mod events;
pub mod logutil;
pub mod messaging;
pub mod storage;
pub mod transport;
