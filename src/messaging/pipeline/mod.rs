//! Ordered, fail-fast processing chain over a single message.
//!
//! A [`MessagePipeline`] holds named [`MessageProcessor`]s that can be toggled at
//! runtime. `process` threads one [`MessageContext`] through the enabled processors
//! in registration order. The first error stops the chain; the error handler then
//! sees the context as the last successful processor left it.
//!
//! ```rust,no_run
//! use meshmsg::messaging::pipeline::{MessagePipeline, ValidateMessage, CheckEncryption};
//!
//! let mut pipeline = MessagePipeline::new();
//! pipeline
//!     .use_processor("validate", ValidateMessage)
//!     .use_processor("encryption", CheckEncryption)
//!     .on_error(|err, _ctx| log::warn!("outbound message rejected: {}", err));
//! ```

mod processors;

pub use processors::{
    CheckEncryption, HandleRouting, PersistMessage, TrackUnread, UnreadCounts, UnreadTarget,
    ValidateMessage,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, trace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::types::{ChannelId, Destination, Message, MessageId, MessageState, NodeNum};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("message content is required")]
    EmptyContent,
    #[error("message exceeds {max} bytes ({len} bytes)")]
    ContentTooLong { len: usize, max: usize },
    #[error("direct message addressed to the local node {0}")]
    SelfAddressed(NodeNum),
    #[error("processor \"{processor}\" failed: {reason}")]
    Processor { processor: String, reason: String },
    #[error("processing aborted by \"{0}\"")]
    Aborted(String),
}

impl PipelineError {
    pub fn failed(processor: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::Processor {
            processor: processor.into(),
            reason: reason.to_string(),
        }
    }
}

/// A message travelling through a pipeline, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub id: MessageId,
    pub from: NodeNum,
    pub to: Destination,
    pub channel: ChannelId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub want_ack: bool,
    pub reply_id: Option<MessageId>,
    pub emoji: Option<u32>,
    pub rx_snr: Option<f32>,
    pub rx_time: Option<DateTime<Utc>>,
}

impl MeshMessage {
    /// A fresh text from `from` with no receive metadata.
    pub fn text(id: MessageId, from: NodeNum, to: Destination, channel: ChannelId, content: impl Into<String>) -> Self {
        Self {
            id,
            from,
            to,
            channel,
            content: content.into(),
            timestamp: Utc::now(),
            want_ack: true,
            reply_id: None,
            emoji: None,
            rx_snr: None,
            rx_time: None,
        }
    }

    /// The store record for this message.
    pub fn to_stored(&self, state: MessageState) -> Message {
        Message {
            message_id: self.id,
            kind: self.to.message_type(),
            from: self.from,
            to: self.to.stored_to(self.from),
            channel: self.channel,
            content: self.content.clone(),
            timestamp: self.timestamp,
            state,
            rx_snr: self.rx_snr,
            rx_time: self.rx_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionKind {
    /// Per-node public key encryption.
    Pki,
    /// Channel pre-shared key.
    Psk,
}

/// Facts a processor records about the message for later processors and observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Annotation {
    Encryption { encrypted: bool, kind: EncryptionKind },
    RoutingChecked,
    Persisted,
    UnreadCounted,
    Extension { key: String, value: serde_json::Value },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AnnotationKind {
    Encryption,
    RoutingChecked,
    Persisted,
    UnreadCounted,
    Extension(String),
}

impl Annotation {
    pub fn kind(&self) -> AnnotationKind {
        match self {
            Annotation::Encryption { .. } => AnnotationKind::Encryption,
            Annotation::RoutingChecked => AnnotationKind::RoutingChecked,
            Annotation::Persisted => AnnotationKind::Persisted,
            Annotation::UnreadCounted => AnnotationKind::UnreadCounted,
            Annotation::Extension { key, .. } => AnnotationKind::Extension(key.clone()),
        }
    }
}

/// Fixed facts about the local device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextMetadata {
    pub my_node_num: NodeNum,
    pub public_key: Option<Vec<u8>>,
}

/// Shared cancellation flag; every clone of a context observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: MeshMessage,
    pub metadata: ContextMetadata,
    annotations: BTreeMap<AnnotationKind, Annotation>,
    abort: AbortHandle,
}

impl MessageContext {
    pub fn new(message: MeshMessage, metadata: ContextMetadata) -> Self {
        Self {
            message,
            metadata,
            annotations: BTreeMap::new(),
            abort: AbortHandle::default(),
        }
    }

    /// Record an annotation, replacing any earlier one of the same kind.
    pub fn annotate(&mut self, annotation: Annotation) {
        self.annotations.insert(annotation.kind(), annotation);
    }

    pub fn annotation(&self, kind: &AnnotationKind) -> Option<&Annotation> {
        self.annotations.get(kind)
    }

    pub fn has(&self, kind: &AnnotationKind) -> bool {
        self.annotations.contains_key(kind)
    }

    pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.values()
    }

    pub fn set_extension(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.annotate(Annotation::Extension {
            key: key.into(),
            value,
        });
    }

    pub fn extension(&self, key: &str) -> Option<&serde_json::Value> {
        match self.annotations.get(&AnnotationKind::Extension(key.to_string())) {
            Some(Annotation::Extension { value, .. }) => Some(value),
            _ => None,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, ctx: MessageContext) -> Result<MessageContext, PipelineError>;
}

#[async_trait]
impl<F> MessageProcessor for F
where
    F: Fn(MessageContext) -> Result<MessageContext, PipelineError> + Send + Sync,
{
    async fn process(&self, ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        self(ctx)
    }
}

struct Stage {
    name: String,
    processor: Box<dyn MessageProcessor>,
    enabled: bool,
}

type ErrorHandler = Box<dyn Fn(&PipelineError, &MessageContext) + Send + Sync>;
type SuccessHandler = Box<dyn Fn(&MessageContext) + Send + Sync>;

#[derive(Default)]
pub struct MessagePipeline {
    stages: Vec<Stage>,
    error_handler: Option<ErrorHandler>,
    success_handler: Option<SuccessHandler>,
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an enabled processor.
    pub fn use_processor<P>(&mut self, name: impl Into<String>, processor: P) -> &mut Self
    where
        P: MessageProcessor + 'static,
    {
        self.push(name.into(), Box::new(processor), true)
    }

    /// Append a processor that stays inactive until [`enable`](Self::enable)d.
    pub fn use_disabled<P>(&mut self, name: impl Into<String>, processor: P) -> &mut Self
    where
        P: MessageProcessor + 'static,
    {
        self.push(name.into(), Box::new(processor), false)
    }

    fn push(&mut self, name: String, processor: Box<dyn MessageProcessor>, enabled: bool) -> &mut Self {
        self.stages.push(Stage {
            name,
            processor,
            enabled,
        });
        self
    }

    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&PipelineError, &MessageContext) + Send + Sync + 'static,
    {
        self.error_handler = Some(Box::new(handler));
        self
    }

    pub fn on_success<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&MessageContext) + Send + Sync + 'static,
    {
        self.success_handler = Some(Box::new(handler));
        self
    }

    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.stages.iter_mut().find(|stage| stage.name == name) {
            Some(stage) => {
                stage.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.stages.iter().find(|stage| stage.name == name).map(|stage| stage.enabled)
    }

    /// Processor names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }

    pub async fn process(&self, ctx: MessageContext) -> Result<MessageContext, PipelineError> {
        let mut current = ctx;
        for stage in &self.stages {
            if !stage.enabled {
                trace!("pipeline: skipping disabled processor \"{}\"", stage.name);
                continue;
            }
            let checkpoint = current.clone();
            match stage.processor.process(current).await {
                Ok(next) if next.is_aborted() => {
                    return Err(self.fail(PipelineError::Aborted(stage.name.clone()), &next));
                }
                Ok(next) => current = next,
                Err(e) => {
                    error!("Processor \"{}\" failed: {}", stage.name, e);
                    return Err(self.fail(e, &checkpoint));
                }
            }
        }
        if let Some(handler) = &self.success_handler {
            handler(&current);
        }
        Ok(current)
    }

    fn fail(&self, err: PipelineError, ctx: &MessageContext) -> PipelineError {
        if let Some(handler) = &self.error_handler {
            handler(&err, ctx);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(content: &str) -> MessageContext {
        MessageContext::new(
            MeshMessage::text(1, 10, Destination::Node(20), 0, content),
            ContextMetadata {
                my_node_num: 10,
                public_key: None,
            },
        )
    }

    fn tag(key: &'static str) -> impl Fn(MessageContext) -> Result<MessageContext, PipelineError> {
        move |mut ctx: MessageContext| {
            ctx.set_extension(key, serde_json::json!(true));
            Ok(ctx)
        }
    }

    #[tokio::test]
    async fn disabled_processors_are_skipped_until_enabled() {
        let mut pipeline = MessagePipeline::new();
        pipeline.use_processor("a", tag("a")).use_disabled("b", tag("b"));

        let out = pipeline.process(ctx("hi")).await.unwrap();
        assert!(out.extension("a").is_some());
        assert!(out.extension("b").is_none());

        assert!(pipeline.enable("b"));
        assert!(pipeline.disable("a"));
        assert!(!pipeline.enable("missing"));
        let out = pipeline.process(ctx("hi")).await.unwrap();
        assert!(out.extension("a").is_none());
        assert!(out.extension("b").is_some());
    }

    #[tokio::test]
    async fn abort_stops_the_chain() {
        let mut pipeline = MessagePipeline::new();
        pipeline
            .use_processor("stop", |ctx: MessageContext| -> Result<MessageContext, PipelineError> {
                ctx.abort();
                Ok(ctx)
            })
            .use_processor("after", tag("after"));

        let err = pipeline.process(ctx("hi")).await.unwrap_err();
        assert_eq!(err, PipelineError::Aborted("stop".to_string()));
    }

    #[test]
    fn annotations_replace_by_kind() {
        let mut c = ctx("hi");
        c.annotate(Annotation::Encryption {
            encrypted: false,
            kind: EncryptionKind::Psk,
        });
        c.annotate(Annotation::Encryption {
            encrypted: true,
            kind: EncryptionKind::Pki,
        });
        assert_eq!(c.annotations().count(), 1);
        assert_eq!(
            c.annotation(&AnnotationKind::Encryption),
            Some(&Annotation::Encryption {
                encrypted: true,
                kind: EncryptionKind::Pki
            })
        );
    }

    #[test]
    fn broadcast_stores_sender_as_destination() {
        let msg = MeshMessage::text(5, 77, Destination::Broadcast, 3, "yo");
        let stored = msg.to_stored(MessageState::Waiting);
        assert_eq!(stored.to, 77);
        assert_eq!(stored.channel, 3);
        assert_eq!(stored.selector(), crate::messaging::types::BucketSelector::broadcast(3));
    }
}
