//! Stock processors for the outbound and inbound chains.

use async_trait::async_trait;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Annotation, EncryptionKind, MessageContext, MessageProcessor, PipelineError};
use crate::messaging::store::MessageStore;
use crate::messaging::types::{ChannelId, Destination, MessageState, NodeNum, MAX_CONTENT_BYTES};

/// Rejects empty content, content over the radio payload budget and direct messages
/// from the local node to itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateMessage;

#[async_trait]
impl MessageProcessor for ValidateMessage {
    async fn process(&self, ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        let message = &ctx.message;
        if message.content.is_empty() {
            return Err(PipelineError::EmptyContent);
        }
        let len = message.content.len();
        if len > MAX_CONTENT_BYTES {
            return Err(PipelineError::ContentTooLong {
                len,
                max: MAX_CONTENT_BYTES,
            });
        }
        let me = ctx.metadata.my_node_num;
        if message.from == me && message.to == Destination::Node(me) {
            return Err(PipelineError::SelfAddressed(me));
        }
        Ok(ctx)
    }
}

/// Tags the message PKI-encrypted when public key material is present, PSK otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckEncryption;

#[async_trait]
impl MessageProcessor for CheckEncryption {
    async fn process(&self, mut ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        let has_key = ctx
            .metadata
            .public_key
            .as_ref()
            .is_some_and(|key| !key.is_empty());
        ctx.annotate(Annotation::Encryption {
            encrypted: has_key,
            kind: if has_key {
                EncryptionKind::Pki
            } else {
                EncryptionKind::Psk
            },
        });
        Ok(ctx)
    }
}

/// Marks the destination as checked against known routes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleRouting;

#[async_trait]
impl MessageProcessor for HandleRouting {
    async fn process(&self, mut ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        trace!("routing check for message {} to {}", ctx.message.id, ctx.message.to);
        ctx.annotate(Annotation::RoutingChecked);
        Ok(ctx)
    }
}

/// Writes the message into a store with a fixed delivery state.
pub struct PersistMessage {
    store: Arc<MessageStore>,
    state: MessageState,
}

impl PersistMessage {
    pub fn new(store: Arc<MessageStore>, state: MessageState) -> Self {
        Self { store, state }
    }
}

#[async_trait]
impl MessageProcessor for PersistMessage {
    async fn process(&self, mut ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        self.store.save_message(ctx.message.to_stored(self.state));
        ctx.annotate(Annotation::Persisted);
        Ok(ctx)
    }
}

/// What an unread count is kept against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnreadTarget {
    Channel(ChannelId),
    Node(NodeNum),
}

/// Counts inbound messages: broadcasts per channel, direct messages to us per sender.
/// Our own messages are never counted.
pub struct TrackUnread {
    increment: Arc<dyn Fn(UnreadTarget) + Send + Sync>,
}

impl TrackUnread {
    pub fn new<F>(increment: F) -> Self
    where
        F: Fn(UnreadTarget) + Send + Sync + 'static,
    {
        Self {
            increment: Arc::new(increment),
        }
    }

    /// Count into a shared [`UnreadCounts`] table.
    pub fn counting(counts: Arc<UnreadCounts>) -> Self {
        Self::new(move |target| counts.increment(target))
    }
}

#[async_trait]
impl MessageProcessor for TrackUnread {
    async fn process(&self, mut ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        let me = ctx.metadata.my_node_num;
        let message = &ctx.message;
        if message.from == me {
            return Ok(ctx);
        }
        let target = match message.to {
            Destination::Broadcast => Some(UnreadTarget::Channel(message.channel)),
            Destination::Node(to) if to == me => Some(UnreadTarget::Node(message.from)),
            Destination::Node(_) => None,
        };
        if let Some(target) = target {
            (self.increment)(target);
            ctx.annotate(Annotation::UnreadCounted);
        }
        Ok(ctx)
    }
}

#[derive(Debug, Default)]
pub struct UnreadCounts {
    counts: Mutex<BTreeMap<UnreadTarget, u32>>,
}

impl UnreadCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, target: UnreadTarget) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(target).or_insert(0) += 1;
    }

    pub fn get(&self, target: UnreadTarget) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&target).copied().unwrap_or(0)
    }

    /// Mark a conversation or channel read.
    pub fn reset(&self, target: UnreadTarget) {
        let removed = self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&target);
        if let Some(count) = removed {
            debug!("cleared {} unread for {:?}", count, target);
        }
    }

    pub fn total(&self) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.values().sum()
    }

    pub fn snapshot(&self) -> BTreeMap<UnreadTarget, u32> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::pipeline::{AnnotationKind, ContextMetadata, MeshMessage};

    const ME: NodeNum = 0x1000;

    fn ctx(from: NodeNum, to: Destination, content: &str) -> MessageContext {
        MessageContext::new(
            MeshMessage::text(9, from, to, 2, content),
            ContextMetadata {
                my_node_num: ME,
                public_key: None,
            },
        )
    }

    #[tokio::test]
    async fn validate_enforces_byte_budget() {
        let ok = "é".repeat(100); // 200 bytes
        assert!(ValidateMessage.process(ctx(ME, Destination::Node(1), &ok)).await.is_ok());

        let long = format!("{}a", ok);
        let err = ValidateMessage
            .process(ctx(ME, Destination::Node(1), &long))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::ContentTooLong { len: 201, max: 200 });

        let err = ValidateMessage.process(ctx(ME, Destination::Node(1), "")).await.unwrap_err();
        assert_eq!(err, PipelineError::EmptyContent);
    }

    #[tokio::test]
    async fn validate_rejects_self_addressed_direct() {
        let err = ValidateMessage
            .process(ctx(ME, Destination::Node(ME), "note to self"))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::SelfAddressed(ME));
    }

    #[tokio::test]
    async fn encryption_kind_follows_public_key() {
        let out = CheckEncryption.process(ctx(ME, Destination::Node(1), "x")).await.unwrap();
        assert_eq!(
            out.annotation(&AnnotationKind::Encryption),
            Some(&Annotation::Encryption {
                encrypted: false,
                kind: EncryptionKind::Psk
            })
        );

        let mut keyed = ctx(ME, Destination::Node(1), "x");
        keyed.metadata.public_key = Some(vec![1; 32]);
        let out = CheckEncryption.process(keyed).await.unwrap();
        assert_eq!(
            out.annotation(&AnnotationKind::Encryption),
            Some(&Annotation::Encryption {
                encrypted: true,
                kind: EncryptionKind::Pki
            })
        );
    }

    #[tokio::test]
    async fn unread_counts_only_inbound_traffic_for_us() {
        let counts = Arc::new(UnreadCounts::new());
        let tracker = TrackUnread::counting(Arc::clone(&counts));

        tracker.process(ctx(7, Destination::Broadcast, "a")).await.unwrap();
        tracker.process(ctx(7, Destination::Node(ME), "b")).await.unwrap();
        tracker.process(ctx(7, Destination::Node(ME), "c")).await.unwrap();
        let out = tracker.process(ctx(7, Destination::Node(8), "d")).await.unwrap();
        assert!(!out.has(&AnnotationKind::UnreadCounted));
        tracker.process(ctx(ME, Destination::Broadcast, "mine")).await.unwrap();

        assert_eq!(counts.get(UnreadTarget::Channel(2)), 1);
        assert_eq!(counts.get(UnreadTarget::Node(7)), 2);
        assert_eq!(counts.total(), 3);

        counts.reset(UnreadTarget::Node(7));
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn persist_writes_into_store() {
        let store = Arc::new(MessageStore::with_retention(1, Some(ME), 10));
        let persist = PersistMessage::new(Arc::clone(&store), MessageState::Ack);
        let out = persist.process(ctx(7, Destination::Node(ME), "hello")).await.unwrap();
        assert!(out.has(&AnnotationKind::Persisted));

        let stored = store.get_messages(crate::messaging::types::BucketSelector::direct(7, ME));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, MessageState::Ack);
        assert_eq!(stored[0].content, "hello");
    }
}
