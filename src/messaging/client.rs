//! Per-device messaging façade.
//!
//! [`MessagingClient`] ties one device's store, delivery queue, pipelines and the
//! shared [`EventBus`] together:
//!
//! * outbound: `send_text` → outbound pipeline → delivery queue → transport → store
//! * inbound: `receive` → inbound pipeline (persists and counts unread) → `MessageReceived`
//!
//! Draft, state and deletion helpers wrap the store and announce each change on the bus.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::manager::MessageStoreManager;
use super::pipeline::{
    CheckEncryption, ContextMetadata, HandleRouting, MeshMessage, MessageContext, MessagePipeline,
    PersistMessage, PipelineError, TrackUnread, UnreadCounts, ValidateMessage,
};
use super::store::MessageStore;
use super::types::{
    BucketSelector, ChannelId, Destination, DeviceId, DraftKey, Message, MessageId, MessageState,
    NodeNum,
};
use crate::config::QueueConfig;
use crate::delivery::{DeliveryQueue, QueueItemId};
use crate::events::{EventBus, MeshEvent, Subscription};
use crate::transport::{QueueStatus, TextRequest, Transport};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error(transparent)]
    Rejected(#[from] PipelineError),
}

/// Identity of the device a client speaks for.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub device_id: DeviceId,
    pub my_node_num: NodeNum,
    pub public_key: Option<Vec<u8>>,
    pub queue: QueueConfig,
}

impl ClientConfig {
    pub fn new(device_id: DeviceId, my_node_num: NodeNum) -> Self {
        Self {
            device_id,
            my_node_num,
            public_key: None,
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendTextParams {
    pub text: String,
    pub to: Destination,
    pub channel: ChannelId,
    pub want_ack: bool,
    pub reply_id: Option<MessageId>,
    pub emoji: Option<u32>,
}

impl SendTextParams {
    pub fn new(text: impl Into<String>, to: Destination) -> Self {
        Self {
            text: text.into(),
            to,
            channel: 0,
            want_ack: true,
            reply_id: None,
            emoji: None,
        }
    }

    pub fn on_channel(mut self, channel: ChannelId) -> Self {
        self.channel = channel;
        self
    }

    pub fn want_ack(mut self, want_ack: bool) -> Self {
        self.want_ack = want_ack;
        self
    }

    pub fn reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_id = Some(message_id);
        self
    }

    pub fn with_emoji(mut self, emoji: u32) -> Self {
        self.emoji = Some(emoji);
        self
    }
}

pub struct MessagingClient {
    device_id: DeviceId,
    my_node_num: NodeNum,
    public_key: Option<Vec<u8>>,
    store: Arc<MessageStore>,
    queue: DeliveryQueue,
    events: Arc<EventBus>,
    outbound: MessagePipeline,
    inbound: MessagePipeline,
    unread: Arc<UnreadCounts>,
    connected: AtomicBool,
}

impl MessagingClient {
    /// Attach to (or create) the device's store and record the local node number.
    pub fn new(
        config: ClientConfig,
        manager: &MessageStoreManager,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
    ) -> Self {
        let store = manager.get_or_create_store(config.device_id);
        store.set_node_num(config.my_node_num);

        let queue = DeliveryQueue::new(
            config.device_id,
            config.queue,
            transport,
            Arc::clone(&store),
            Arc::clone(&events),
        );

        let mut outbound = MessagePipeline::new();
        outbound
            .use_processor("validate", ValidateMessage)
            .use_processor("encryption", CheckEncryption)
            .use_processor("routing", HandleRouting);

        let unread = Arc::new(UnreadCounts::new());
        let mut inbound = MessagePipeline::new();
        inbound
            .use_processor("validate", ValidateMessage)
            .use_processor("encryption", CheckEncryption)
            .use_processor("persist", PersistMessage::new(Arc::clone(&store), MessageState::Ack))
            .use_processor("unread", TrackUnread::counting(Arc::clone(&unread)));

        info!(
            "Messaging client ready for device {} (node {})",
            config.device_id, config.my_node_num
        );
        Self {
            device_id: config.device_id,
            my_node_num: config.my_node_num,
            public_key: config.public_key,
            store,
            queue,
            events,
            outbound,
            inbound,
            unread,
            connected: AtomicBool::new(true),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn my_node_num(&self) -> NodeNum {
        self.my_node_num
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn unread(&self) -> &Arc<UnreadCounts> {
        &self.unread
    }

    pub fn outbound_pipeline_mut(&mut self) -> &mut MessagePipeline {
        &mut self.outbound
    }

    pub fn inbound_pipeline_mut(&mut self) -> &mut MessagePipeline {
        &mut self.inbound
    }

    fn context(&self, message: MeshMessage) -> MessageContext {
        MessageContext::new(
            message,
            ContextMetadata {
                my_node_num: self.my_node_num,
                public_key: self.public_key.clone(),
            },
        )
    }

    fn report(&self, context: &str, error: &dyn std::fmt::Display) {
        self.events.emit(MeshEvent::Error {
            device_id: Some(self.device_id),
            context: context.to_string(),
            error: error.to_string(),
        });
    }

    /// Run the outbound pipeline and queue the text. Returns the queue item id; the send
    /// outcome arrives later as `MessageSent` or `MessageFailed`.
    pub async fn send_text(&self, params: SendTextParams) -> Result<QueueItemId, ClientError> {
        if !self.is_connected() {
            warn!("device {}: cannot send, device not connected", self.device_id);
            let err = ClientError::NotConnected(self.device_id);
            self.report("MessagingClient::send_text", &err);
            return Err(err);
        }

        let mut message = MeshMessage::text(0, self.my_node_num, params.to, params.channel, params.text);
        message.want_ack = params.want_ack;
        message.reply_id = params.reply_id;
        message.emoji = params.emoji;

        let ctx = match self.outbound.process(self.context(message)).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.report("MessagingClient::send_text", &e);
                return Err(e.into());
            }
        };
        let message = ctx.message;
        Ok(self.queue.enqueue(TextRequest {
            content: message.content,
            destination: message.to,
            want_ack: message.want_ack,
            channel: message.channel,
            reply_id: message.reply_id,
            emoji: message.emoji,
        }))
    }

    /// Hand an inbound text to the inbound pipeline and announce it.
    pub async fn receive(&self, message: MeshMessage) -> Result<Message, PipelineError> {
        let ctx = self.inbound.process(self.context(message)).await.map_err(|e| {
            self.report("MessagingClient::receive", &e);
            e
        })?;
        let stored = ctx.message.to_stored(MessageState::Ack);
        self.events.emit(MeshEvent::MessageReceived {
            device_id: self.device_id,
            message: stored.clone(),
        });
        Ok(stored)
    }

    pub fn get_messages(&self, selector: BucketSelector) -> Vec<Message> {
        self.store.get_messages(selector)
    }

    pub fn get_draft(&self, key: DraftKey) -> String {
        self.store.get_draft(key)
    }

    pub fn set_draft(&self, key: DraftKey, text: impl Into<String>) {
        let content = text.into();
        self.store.set_draft(key, content.clone());
        self.events.emit(MeshEvent::DraftSaved {
            device_id: self.device_id,
            key,
            content,
        });
    }

    pub fn clear_draft(&self, key: DraftKey) {
        self.store.clear_draft(key);
        self.events.emit(MeshEvent::DraftCleared {
            device_id: self.device_id,
            key,
        });
    }

    /// Update a stored message's state; announces the change only when the message exists.
    pub fn set_message_state(
        &self,
        selector: BucketSelector,
        message_id: MessageId,
        state: MessageState,
    ) -> Option<MessageState> {
        let previous = self.store.set_message_state(selector, message_id, state)?;
        self.events.emit(MeshEvent::MessageStateChanged {
            device_id: self.device_id,
            message_id,
            selector,
            previous,
            new: state,
        });
        Some(previous)
    }

    pub fn delete_message(&self, selector: BucketSelector, message_id: MessageId) -> bool {
        let removed = self.store.clear_message_by_message_id(selector, message_id);
        if removed {
            self.events.emit(MeshEvent::MessageDeleted {
                device_id: self.device_id,
                message_id,
                selector,
            });
        }
        removed
    }

    pub fn delete_all_messages(&self) {
        self.store.delete_all_messages();
        self.events.emit(MeshEvent::MessagesCleared {
            device_id: self.device_id,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Record a link state change; announced only when the state actually flips.
    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }
        info!(
            "device {} {}",
            self.device_id,
            if connected { "connected" } else { "disconnected" }
        );
        self.events.emit(MeshEvent::ConnectionStateChanged {
            device_id: self.device_id,
            connected,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Forward the radio's TX queue report to the delivery queue.
    pub fn update_queue_status(&self, status: QueueStatus) {
        self.queue.update_queue_status(status);
    }

    /// Called on every change to this device's store.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }
}
