//! Seam between the messaging core and the radio link.
//!
//! The core never talks to a serial port or socket directly; it hands a
//! [`TextRequest`] to a [`Transport`] and records whatever the device answers.
//! Congestion flows the other way: the transport side pushes [`QueueStatus`]
//! updates into the delivery queue as the device reports them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messaging::types::{ChannelId, Destination, MessageId};

/// One outbound text send as the device expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRequest {
    pub content: String,
    pub destination: Destination,
    pub want_ack: bool,
    pub channel: ChannelId,
    pub reply_id: Option<MessageId>,
    pub emoji: Option<u32>,
}

/// Device-reported TX queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Free slots in the radio's transmit queue.
    pub free: u32,
    pub maxlen: u32,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("device not connected")]
    NotConnected,
    #[error("device rejected the packet: {0}")]
    Rejected(String),
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmit one text message. Resolves with the packet id the device assigned.
    async fn send_text(&self, request: &TextRequest) -> Result<MessageId, TransportError>;
}
