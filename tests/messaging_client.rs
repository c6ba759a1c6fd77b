mod common;

use std::sync::{Arc, Mutex};

use common::{record_events, ScriptedTransport, ME};
use meshmsg::config::MessagingConfig;
use meshmsg::events::{EventBus, EventKind, MeshEvent};
use meshmsg::messaging::pipeline::{MeshMessage, PipelineError, UnreadTarget};
use meshmsg::messaging::{
    BucketSelector, ClientConfig, ClientError, Destination, DraftKey, MessageState,
    MessageStoreManager, MessagingClient, SendTextParams,
};
use tokio_test::{assert_err, assert_ok};

struct Setup {
    client: MessagingClient,
    manager: MessageStoreManager,
    transport: Arc<ScriptedTransport>,
    bus: Arc<EventBus>,
    events: Arc<Mutex<Vec<MeshEvent>>>,
}

fn setup() -> Setup {
    let manager = MessageStoreManager::in_memory(MessagingConfig::default());
    let transport = ScriptedTransport::new();
    let bus = Arc::new(EventBus::new());
    let events = record_events(&bus);
    let client = MessagingClient::new(
        ClientConfig::new(5, ME),
        &manager,
        transport.clone(),
        Arc::clone(&bus),
    );
    Setup {
        client,
        manager,
        transport,
        bus,
        events,
    }
}

fn kinds(events: &Mutex<Vec<MeshEvent>>) -> Vec<EventKind> {
    events.lock().unwrap().iter().map(MeshEvent::kind).collect()
}

#[tokio::test(start_paused = true)]
async fn client_attaches_store_and_node_number() {
    let s = setup();
    let store = s.manager.get_store(5).expect("store created for device");
    assert_eq!(store.my_node_num(), Some(ME));
    assert!(Arc::ptr_eq(&store, s.client.store()));
}

#[tokio::test(start_paused = true)]
async fn send_text_runs_pipeline_and_queue() {
    let s = setup();
    s.transport.reply(Ok(7));

    let params = SendTextParams::new("hi", Destination::Node(42)).reply_to(3).with_emoji(1);
    assert_ok!(s.client.send_text(params).await);
    s.client.queue().wait_idle().await;

    let sent = s.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reply_id, Some(3));
    assert_eq!(sent[0].emoji, Some(1));
    assert!(sent[0].want_ack);

    let stored = s.client.get_messages(BucketSelector::direct(ME, 42));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message_id, 7);
    assert_eq!(stored[0].state, MessageState::Ack);
    assert_eq!(kinds(&s.events), vec![EventKind::MessageSent]);
}

#[tokio::test(start_paused = true)]
async fn invalid_text_never_reaches_the_queue() {
    let s = setup();
    let err = assert_err!(s.client.send_text(SendTextParams::new("", Destination::Broadcast)).await);
    assert_eq!(err, ClientError::Rejected(PipelineError::EmptyContent));

    let too_long = "x".repeat(201);
    let err = assert_err!(s.client.send_text(SendTextParams::new(too_long, Destination::Broadcast)).await);
    assert!(matches!(err, ClientError::Rejected(PipelineError::ContentTooLong { len: 201, .. })));

    let err = assert_err!(s.client.send_text(SendTextParams::new("me", Destination::Node(ME))).await);
    assert_eq!(err, ClientError::Rejected(PipelineError::SelfAddressed(ME)));

    assert_eq!(s.client.queue().pending_count(), 0);
    assert!(s.transport.sent().is_empty());
    assert_eq!(kinds(&s.events), vec![EventKind::Error; 3]);
}

#[tokio::test(start_paused = true)]
async fn disconnected_client_refuses_to_send() {
    let s = setup();
    s.client.set_connected(false);
    s.client.set_connected(false);
    let err = assert_err!(s.client.send_text(SendTextParams::new("hi", Destination::Broadcast)).await);
    assert_eq!(err, ClientError::NotConnected(5));

    s.client.set_connected(true);
    assert_eq!(
        kinds(&s.events),
        vec![
            EventKind::ConnectionStateChanged,
            EventKind::Error,
            EventKind::ConnectionStateChanged
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_are_persisted_and_counted() {
    let s = setup();
    let mut dm = MeshMessage::text(11, 42, Destination::Node(ME), 0, "ping");
    dm.rx_snr = Some(4.5);
    let stored = assert_ok!(s.client.receive(dm).await);
    assert_eq!(stored.state, MessageState::Ack);

    assert_ok!(s.client.receive(MeshMessage::text(12, 42, Destination::Broadcast, 2, "all")).await);

    let direct = s.client.get_messages(BucketSelector::direct(42, ME));
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].rx_snr, Some(4.5));
    assert_eq!(s.client.get_messages(BucketSelector::broadcast(2)).len(), 1);

    assert_eq!(s.client.unread().get(UnreadTarget::Node(42)), 1);
    assert_eq!(s.client.unread().get(UnreadTarget::Channel(2)), 1);
    assert_eq!(
        kinds(&s.events),
        vec![EventKind::MessageReceived, EventKind::MessageReceived]
    );
}

#[tokio::test(start_paused = true)]
async fn drafts_state_and_deletion_emit_events() {
    let s = setup();
    let changes: Arc<Mutex<Vec<(MessageState, MessageState)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    s.bus.subscribe(EventKind::MessageStateChanged, move |event| {
        if let MeshEvent::MessageStateChanged { previous, new, .. } = event {
            sink.lock().unwrap().push((*previous, *new));
        }
    });

    s.client.set_draft(DraftKey::Node(42), "draft");
    assert_eq!(s.client.get_draft(DraftKey::Node(42)), "draft");
    s.client.clear_draft(DraftKey::Node(42));
    assert_eq!(s.client.get_draft(DraftKey::Node(42)), "");

    s.client
        .receive(MeshMessage::text(20, 42, Destination::Node(ME), 0, "hello"))
        .await
        .unwrap();
    let selector = BucketSelector::direct(ME, 42);
    assert_eq!(
        s.client.set_message_state(selector, 20, MessageState::Failed),
        Some(MessageState::Ack)
    );
    assert_eq!(s.client.set_message_state(selector, 999, MessageState::Failed), None);
    assert!(s.client.delete_message(selector, 20));
    assert!(!s.client.delete_message(selector, 20));
    s.client.delete_all_messages();

    assert_eq!(
        kinds(&s.events),
        vec![
            EventKind::DraftSaved,
            EventKind::DraftCleared,
            EventKind::MessageReceived,
            EventKind::MessageStateChanged,
            EventKind::MessageDeleted,
            EventKind::MessagesCleared,
        ]
    );
    assert_eq!(
        *changes.lock().unwrap(),
        vec![(MessageState::Ack, MessageState::Failed)]
    );
}

#[tokio::test(start_paused = true)]
async fn store_subscribers_see_client_changes() {
    let s = setup();
    let hits = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&hits);
    let sub = s.client.subscribe(move || *counter.lock().unwrap() += 1);

    s.client.set_draft(DraftKey::Broadcast, "a");
    assert_eq!(*hits.lock().unwrap(), 1);

    sub.unsubscribe();
    s.client.set_draft(DraftKey::Broadcast, "b");
    assert_eq!(*hits.lock().unwrap(), 1);
}
