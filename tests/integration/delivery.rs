#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for direct-message delivery through the engine.
//!
//! Verifies:
//! 1. A recipient viewing the conversation never accumulates unread messages.
//! 2. A duplicate send is counted once.
//! 3. Deletion is observed exactly once by each participant.
//! 4. Muting suppresses the badge and toast but not delivery.
//! 5. Cancelling an upload before it is persisted stores nothing, and a
//!    text sent behind an attachment is stored after it.
//! 6. The `cleared_for` boundary hides history for one user only.
//! 7. Opening a conversation reduces the unread total by exactly N.

use std::sync::Arc;
use std::time::Duration;

use courier_proto::event::{ClientEvent, ErrorKind, ServerEvent};
use courier_proto::message::{AttachmentUpload, ConversationId, Recipient, TOMBSTONE, UserId};
use courier_server::engine::{Engine, EngineConfig};
use courier_server::sessions::ConnectionId;
use courier_server::store::{ChatStore, InMemoryStore};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TestEngine = Arc<Engine<InMemoryStore>>;

struct Client {
    user: UserId,
    conn: ConnectionId,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Client {
    async fn join(engine: &TestEngine, user: &str) -> Self {
        let user = UserId::new(user);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = engine.connect(&user, tx).await;
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Joined { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Synced { .. }));
        Self { user, conn, rx }
    }

    async fn send(&self, engine: &TestEngine, event: ClientEvent) {
        engine.handle(self.conn, &self.user, event).await;
    }

    async fn say(&self, engine: &TestEngine, to: &str, content: &str) {
        self.send(
            engine,
            ClientEvent::SendMessage {
                receiver_id: Recipient::User(to.into()),
                content: content.to_string(),
                attachment: None,
            },
        )
        .await;
    }

    async fn open(&self, engine: &TestEngine, peer: &str) {
        self.send(
            engine,
            ClientEvent::UserJoinedChat {
                user_id: self.user.clone(),
                chat_id: Recipient::User(peer.into()),
            },
        )
        .await;
    }

    /// Everything queued so far, minus presence noise from the presence loop.
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            if !matches!(event, ServerEvent::Online { .. } | ServerEvent::Offline { .. }) {
                events.push(event);
            }
        }
        events
    }

    async fn recv_until(&mut self, mut pred: impl FnMut(&ServerEvent) -> bool) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.rx.recv().await.expect("session channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }
}

fn engine_with(store: InMemoryStore) -> (Arc<InMemoryStore>, TestEngine) {
    let store = Arc::new(store);
    let engine = Engine::start(Arc::clone(&store), EngineConfig::default());
    (store, engine)
}

fn count<F: Fn(&ServerEvent) -> bool>(events: &[ServerEvent], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}

fn last_total(events: &[ServerEvent]) -> Option<u32> {
    events.iter().rev().find_map(|e| match e {
        ServerEvent::UnreadCounts(counter) => Some(counter.total()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn viewing_recipient_never_accumulates_unread() {
    let (store, engine) = engine_with(InMemoryStore::default());
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;
    bob.open(&engine, "alice").await;
    bob.drain();

    alice.say(&engine, "bob", "first").await;
    alice.say(&engine, "bob", "second").await;

    let bob_events = bob.drain();
    assert_eq!(
        count(&bob_events, |e| matches!(e, ServerEvent::SendMessageToReceiver(_))),
        2
    );
    assert_eq!(count(&bob_events, |e| matches!(e, ServerEvent::NewMessage { .. })), 0);
    assert_eq!(count(&bob_events, |e| matches!(e, ServerEvent::UnreadCounts(_))), 0);

    let receipts: u32 = alice
        .drain()
        .iter()
        .filter_map(|e| match e {
            ServerEvent::MessagesRead { read_count, .. } => Some(*read_count),
            _ => None,
        })
        .sum();
    assert_eq!(receipts, 2);
    assert!(store.unread_counts(&bob.user).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_send_is_counted_once() {
    let (_store, engine) = engine_with(InMemoryStore::default());
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    alice.say(&engine, "bob", "are you there?").await;
    alice.say(&engine, "bob", "are you there?").await;

    let bob_events = bob.drain();
    assert_eq!(
        count(&bob_events, |e| matches!(e, ServerEvent::SendMessageToReceiver(_))),
        1
    );
    assert_eq!(count(&bob_events, |e| matches!(e, ServerEvent::NewMessage { .. })), 1);
    assert_eq!(last_total(&bob_events), Some(1));

    let alice_events = alice.drain();
    assert_eq!(
        count(&alice_events, |e| matches!(e, ServerEvent::SendMessageToSender(_))),
        1
    );
}

#[tokio::test]
async fn deletion_is_observed_once_by_each_participant() {
    let (store, engine) = engine_with(InMemoryStore::default());
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    let message = engine
        .send(&alice.user, Recipient::User(bob.user.clone()), "oops".into(), None)
        .await
        .unwrap();
    alice.drain();
    bob.drain();

    // Only the sender may delete.
    bob.send(
        &engine,
        ClientEvent::MessageDeleted {
            id: message.id.clone(),
            receiver_id: Recipient::User(bob.user.clone()),
        },
    )
    .await;
    match bob.drain().as_slice() {
        [ServerEvent::Error { kind, .. }] => assert_eq!(*kind, ErrorKind::Authorization),
        other => panic!("expected an authorization error, got {other:?}"),
    }

    for _ in 0..2 {
        alice
            .send(
                &engine,
                ClientEvent::MessageDeleted {
                    id: message.id.clone(),
                    receiver_id: Recipient::User(bob.user.clone()),
                },
            )
            .await;
    }

    let deleted = |e: &ServerEvent| matches!(e, ServerEvent::MessageDeleted { id, .. } if *id == message.id);
    assert_eq!(count(&alice.drain(), deleted), 1);
    assert_eq!(count(&bob.drain(), deleted), 1);

    let stored = store.message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.content(), TOMBSTONE);
    assert!(stored.attachment.is_none());
}

#[tokio::test]
async fn muted_conversation_is_delivered_without_badge() {
    let (_store, engine) = engine_with(InMemoryStore::default());
    let alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    bob.send(
        &engine,
        ClientEvent::MuteConversation {
            chat_id: Recipient::User(alice.user.clone()),
            muted: true,
        },
    )
    .await;
    assert_eq!(last_total(&bob.drain()), Some(0));

    alice.say(&engine, "bob", "muted hello").await;

    let bob_events = bob.drain();
    assert_eq!(
        count(&bob_events, |e| matches!(e, ServerEvent::SendMessageToReceiver(_))),
        1
    );
    assert_eq!(count(&bob_events, |e| matches!(e, ServerEvent::NewMessage { .. })), 0);
    assert_eq!(count(&bob_events, |e| matches!(e, ServerEvent::UnreadCounts(_))), 0);

    bob.send(
        &engine,
        ClientEvent::MuteConversation {
            chat_id: Recipient::User(alice.user.clone()),
            muted: false,
        },
    )
    .await;
    alice.say(&engine, "bob", "unmuted hello").await;
    let bob_events = bob.drain();
    assert_eq!(count(&bob_events, |e| matches!(e, ServerEvent::NewMessage { .. })), 1);
}

#[tokio::test]
async fn cancelled_upload_persists_nothing() {
    let (store, engine) =
        engine_with(InMemoryStore::default().with_upload_delay(Duration::from_millis(500)));
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    alice
        .send(
            &engine,
            ClientEvent::SendMessage {
                receiver_id: Recipient::User(bob.user.clone()),
                content: "holiday photo".into(),
                attachment: Some(AttachmentUpload {
                    upload_id: "up-1".into(),
                    file_name: "beach.jpg".into(),
                    mime_type: "image/jpeg".into(),
                    data: vec![0xFF; 1024],
                }),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice
        .send(
            &engine,
            ClientEvent::CancelUpload {
                upload_id: "up-1".into(),
            },
        )
        .await;

    let cancelled = alice
        .recv_until(|e| matches!(e, ServerEvent::UploadCancelled { .. }))
        .await;
    assert_eq!(
        cancelled,
        ServerEvent::UploadCancelled {
            upload_id: "up-1".into()
        }
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.message_count(), 0);
    assert_eq!(store.blob_count(), 0);
    assert_eq!(
        count(&bob.drain(), |e| matches!(e, ServerEvent::SendMessageToReceiver(_))),
        0
    );
}

#[tokio::test]
async fn upload_completes_when_not_cancelled() {
    let (store, engine) =
        engine_with(InMemoryStore::default().with_upload_delay(Duration::from_millis(20)));
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    alice
        .send(
            &engine,
            ClientEvent::SendMessage {
                receiver_id: Recipient::User(bob.user.clone()),
                content: "report".into(),
                attachment: Some(AttachmentUpload {
                    upload_id: "up-2".into(),
                    file_name: "q3.pdf".into(),
                    mime_type: "application/pdf".into(),
                    data: vec![1, 2, 3],
                }),
            },
        )
        .await;

    let delivered = bob
        .recv_until(|e| matches!(e, ServerEvent::SendMessageToReceiver(_)))
        .await;
    let ServerEvent::SendMessageToReceiver(message) = delivered else {
        unreachable!()
    };
    let attachment = message.attachment.unwrap();
    assert_eq!(attachment.file_name, "q3.pdf");
    assert_eq!(attachment.size_bytes, 3);
    assert_eq!(store.blob_count(), 1);

    // Cancelling after persistence is a no-op.
    alice
        .send(
            &engine,
            ClientEvent::CancelUpload {
                upload_id: "up-2".into(),
            },
        )
        .await;
    assert_eq!(
        count(&alice.drain(), |e| matches!(e, ServerEvent::UploadCancelled { .. })),
        0
    );
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn text_after_attachment_keeps_send_order() {
    let (store, engine) =
        engine_with(InMemoryStore::default().with_upload_delay(Duration::from_millis(100)));
    let alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    alice
        .send(
            &engine,
            ClientEvent::SendMessage {
                receiver_id: Recipient::User(bob.user.clone()),
                content: "photo".into(),
                attachment: Some(AttachmentUpload {
                    upload_id: "up-3".into(),
                    file_name: "cat.png".into(),
                    mime_type: "image/png".into(),
                    data: vec![7; 64],
                }),
            },
        )
        .await;
    alice.say(&engine, "bob", "see the photo above").await;

    let mut received = Vec::new();
    while received.len() < 2 {
        if let ServerEvent::SendMessageToReceiver(message) = bob
            .recv_until(|e| matches!(e, ServerEvent::SendMessageToReceiver(_)))
            .await
        {
            received.push(message.content().to_string());
        }
    }
    assert_eq!(received, ["photo", "see the photo above"]);

    let conversation = ConversationId::direct(&alice.user, &bob.user);
    let history = store.history(&conversation, &bob.user, 10).await.unwrap();
    let stored: Vec<&str> = history.iter().map(|m| m.content()).collect();
    assert_eq!(stored, ["photo", "see the photo above"]);
    assert!(history[0].created_at <= history[1].created_at);
}

#[tokio::test]
async fn cleared_history_is_hidden_for_one_user_only() {
    let (store, engine) = engine_with(InMemoryStore::default());
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;

    let old = engine
        .send(&alice.user, Recipient::User(bob.user.clone()), "old".into(), None)
        .await
        .unwrap();
    let conversation = ConversationId::direct(&alice.user, &bob.user);
    store
        .clear_for(&conversation, &bob.user, old.created_at)
        .await
        .unwrap();
    engine
        .send(&alice.user, Recipient::User(bob.user.clone()), "new".into(), None)
        .await
        .unwrap();

    let history = |client: &mut Client| {
        client
            .drain()
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::ReceiveMessages { messages, .. } => Some(messages),
                _ => None,
            })
            .unwrap()
    };

    bob.send(
        &engine,
        ClientEvent::AllMessages {
            sender_id: bob.user.clone(),
            receiver_id: Recipient::User(alice.user.clone()),
        },
    )
    .await;
    let bob_history = history(&mut bob);
    assert_eq!(bob_history.len(), 1);
    assert_eq!(bob_history[0].content(), "new");

    alice
        .send(
            &engine,
            ClientEvent::AllMessages {
                sender_id: alice.user.clone(),
                receiver_id: Recipient::User(bob.user.clone()),
            },
        )
        .await;
    let alice_history = history(&mut alice);
    let contents: Vec<&str> = alice_history.iter().map(|m| m.content()).collect();
    assert_eq!(contents, ["old", "new"]);
}

#[tokio::test]
async fn opening_reduces_total_by_exactly_n() {
    let (store, engine) = engine_with(InMemoryStore::default());
    let mut alice = Client::join(&engine, "alice").await;
    let carol = Client::join(&engine, "carol").await;
    let mut bob = Client::join(&engine, "bob").await;

    for text in ["one", "two", "three"] {
        alice.say(&engine, "bob", text).await;
    }
    carol.say(&engine, "bob", "hi from carol").await;
    assert_eq!(last_total(&bob.drain()), Some(4));
    alice.drain();

    bob.open(&engine, "alice").await;
    assert_eq!(last_total(&bob.drain()), Some(1));

    let receipts: Vec<u32> = alice
        .drain()
        .iter()
        .filter_map(|e| match e {
            ServerEvent::MessagesRead { read_count, .. } => Some(*read_count),
            _ => None,
        })
        .collect();
    assert_eq!(receipts, [3]);

    let counts = store.unread_counts(&bob.user).await.unwrap();
    assert_eq!(counts.values().sum::<u32>(), 1);
}

#[tokio::test]
async fn identity_comes_from_the_session_not_the_payload() {
    let (_store, engine) = engine_with(InMemoryStore::default());
    let mut alice = Client::join(&engine, "alice").await;
    let mut bob = Client::join(&engine, "bob").await;
    alice.say(&engine, "bob", "for bob only").await;
    bob.drain();
    alice.drain();

    // Alice claims to be bob while opening the conversation.
    alice
        .send(
            &engine,
            ClientEvent::UserJoinedChat {
                user_id: bob.user.clone(),
                chat_id: Recipient::User(bob.user.clone()),
            },
        )
        .await;

    // Bob's message is still unread: alice has no messages addressed to her.
    assert_eq!(
        count(&bob.drain(), |e| matches!(e, ServerEvent::MessagesRead { .. })),
        0
    );
    assert!(alice
        .drain()
        .iter()
        .all(|e| !matches!(e, ServerEvent::MessagesRead { .. })));
}
