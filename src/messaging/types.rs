//! Core message types shared by the store, pipeline and delivery queue.

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type NodeNum = u32;
pub type ChannelId = u32;
pub type MessageId = u32;
pub type DeviceId = u32;
pub type ConversationId = String;

/// A single conversation's or channel's messages keyed by message id.
pub type MessageLogMap = BTreeMap<MessageId, Message>;

/// Maximum encoded size of a text payload on the wire.
pub const MAX_CONTENT_BYTES: usize = 200;

/// Canonical key for a direct-message bucket.
///
/// The two node numbers are sorted numerically before joining, so the key does not
/// depend on message direction: `conversation_id(a, b) == conversation_id(b, a)`.
pub fn conversation_id(node_a: NodeNum, node_b: NodeNum) -> ConversationId {
    let (lo, hi) = if node_a <= node_b {
        (node_a, node_b)
    } else {
        (node_b, node_a)
    };
    format!("{}:{}", lo, hi)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Direct,
    Broadcast,
}

/// Delivery state of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    #[default]
    #[serde(alias = "pending")]
    Waiting,
    Ack,
    Failed,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Ack | MessageState::Failed)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageState::Waiting => write!(f, "waiting"),
            MessageState::Ack => write!(f, "ack"),
            MessageState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: NodeNum,
    /// Destination node. Broadcasts carry the sender's own id here.
    pub to: NodeNum,
    #[serde(default)]
    pub channel: ChannelId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub state: MessageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_snr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_time: Option<DateTime<Utc>>,
}

impl Message {
    /// Selector for the bucket this message is stored in.
    pub fn selector(&self) -> BucketSelector {
        match self.kind {
            MessageType::Direct => BucketSelector::Direct {
                node_a: self.from,
                node_b: self.to,
            },
            MessageType::Broadcast => BucketSelector::Broadcast {
                channel: self.channel,
            },
        }
    }
}

/// Addresses one bucket inside a message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketSelector {
    Direct { node_a: NodeNum, node_b: NodeNum },
    Broadcast { channel: ChannelId },
}

impl BucketSelector {
    pub fn direct(node_a: NodeNum, node_b: NodeNum) -> Self {
        BucketSelector::Direct { node_a, node_b }
    }

    pub fn broadcast(channel: ChannelId) -> Self {
        BucketSelector::Broadcast { channel }
    }
}

impl fmt::Display for BucketSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketSelector::Direct { node_a, node_b } => {
                write!(f, "direct {}", conversation_id(*node_a, *node_b))
            }
            BucketSelector::Broadcast { channel } => write!(f, "broadcast channel {}", channel),
        }
    }
}

/// Where an outbound text is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Broadcast,
    Node(NodeNum),
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Destination::Broadcast => MessageType::Broadcast,
            Destination::Node(_) => MessageType::Direct,
        }
    }

    /// Node number recorded in a stored message's `to` field. Broadcasts record the sender.
    pub fn stored_to(&self, sender: NodeNum) -> NodeNum {
        match self {
            Destination::Broadcast => sender,
            Destination::Node(n) => *n,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => write!(f, "broadcast"),
            Destination::Node(n) => write!(f, "!{:08x}", n),
        }
    }
}

/// Key under which a draft is kept: a peer node or the broadcast composer.
///
/// Serialized as a plain string (`"broadcast"` or the decimal node number) so it can
/// be used as a JSON object key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DraftKey {
    Node(NodeNum),
    Broadcast,
}

impl fmt::Display for DraftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DraftKey::Node(n) => write!(f, "{}", n),
            DraftKey::Broadcast => write!(f, "broadcast"),
        }
    }
}

impl FromStr for DraftKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("broadcast") {
            return Ok(DraftKey::Broadcast);
        }
        s.parse::<NodeNum>()
            .map(DraftKey::Node)
            .map_err(|_| format!("invalid draft key '{}'", s))
    }
}

impl From<Destination> for DraftKey {
    fn from(dest: Destination) -> Self {
        match dest {
            Destination::Broadcast => DraftKey::Broadcast,
            Destination::Node(n) => DraftKey::Node(n),
        }
    }
}

impl Serialize for DraftKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DraftKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DraftKeyVisitor;

        impl<'de> Visitor<'de> for DraftKeyVisitor {
            type Value = DraftKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"broadcast\" or a node number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DraftKey, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DraftKey, E> {
                NodeNum::try_from(v)
                    .map(DraftKey::Node)
                    .map_err(|_| E::custom(format!("node number out of range: {}", v)))
            }
        }

        deserializer.deserialize_any(DraftKeyVisitor)
    }
}
