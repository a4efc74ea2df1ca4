#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for presence and typing indicators.
//!
//! Verifies:
//! 1. Extra sessions never re-announce `online`; `offline` only follows the
//!    last session closing.
//! 2. `is_typing` fires on the edge only, and indicators expire on their own.
//! 3. Sending a message or going offline ends a typing indicator.
//! 4. Group typing reaches the other members, and only members may signal.
//!    Direct typing follows the same rule as direct messages.
//! 5. Status queries report last-seen times, to contacts only.

use std::sync::Arc;
use std::time::Duration;

use courier_proto::event::{ClientEvent, ErrorKind, ServerEvent};
use courier_proto::group::Group;
use courier_proto::message::{ConversationId, GroupId, Recipient, UserId};
use courier_server::engine::{Engine, EngineConfig};
use courier_server::sessions::ConnectionId;
use courier_server::store::{FriendPolicy, InMemoryStore};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TestEngine = Arc<Engine<InMemoryStore>>;
type Rx = mpsc::UnboundedReceiver<ServerEvent>;

fn engine_with(store: InMemoryStore, typing_timeout: Duration) -> TestEngine {
    let config = EngineConfig {
        typing_timeout,
        ..EngineConfig::default()
    };
    Engine::start(Arc::new(store), config)
}

fn friends(a: &str, b: &str) -> InMemoryStore {
    let store = InMemoryStore::default();
    store.add_friendship(&a.into(), &b.into());
    store
}

async fn join(engine: &TestEngine, user: &str) -> (ConnectionId, Rx) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = engine.connect(&user.into(), tx).await;
    // joined + synced
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();
    (conn, rx)
}

fn take(rx: &mut Rx) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn recv_until(rx: &mut Rx, mut pred: impl FnMut(&ServerEvent) -> bool) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("session channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Lets the presence loop drain its queue.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn typing_to(peer: &str) -> ClientEvent {
    ClientEvent::Typing {
        receiver_id: Recipient::User(peer.into()),
    }
}

fn is_typing_events(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ServerEvent::IsTyping { .. }))
        .count()
}

fn not_typing_events(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ServerEvent::NotTyping { .. }))
        .count()
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn presence_does_not_oscillate_across_sessions() {
    let engine = engine_with(friends("alice", "bob"), Duration::from_secs(5));
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let alice: UserId = "alice".into();

    let (laptop, _laptop_rx) = join(&engine, "alice").await;
    let online = recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::Online { .. })).await;
    assert_eq!(online, ServerEvent::Online { user_id: alice.clone() });

    let (phone, _phone_rx) = join(&engine, "alice").await;
    settle().await;
    assert!(take(&mut bob_rx).is_empty(), "second session must not re-announce");

    engine.disconnect(laptop);
    settle().await;
    assert!(take(&mut bob_rx).is_empty(), "alice still has a session");
    assert!(engine.presence().state(&alice).is_online());

    engine.disconnect(phone);
    let offline = recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::Offline { .. })).await;
    match offline {
        ServerEvent::Offline {
            user_id,
            last_seen_at,
        } => {
            assert_eq!(user_id, alice);
            assert!(last_seen_at.is_some());
        }
        other => panic!("expected offline, got {other:?}"),
    }
    assert!(!engine.presence().state(&alice).is_online());
}

#[tokio::test]
async fn presence_goes_to_contacts_only() {
    let engine = engine_with(friends("alice", "bob"), Duration::from_secs(5));
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let (_eve, mut eve_rx) = join(&engine, "eve").await;

    let (_alice, _alice_rx) = join(&engine, "alice").await;
    recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::Online { .. })).await;
    settle().await;
    assert!(take(&mut eve_rx).is_empty());
}

#[tokio::test]
async fn status_reports_last_seen() {
    let engine = engine_with(friends("alice", "bob"), Duration::from_secs(5));
    let (bob, mut bob_rx) = join(&engine, "bob").await;
    let bob_id: UserId = "bob".into();

    let status = ClientEvent::Status {
        receiver_id: "alice".into(),
    };
    engine.handle(bob, &bob_id, status.clone()).await;
    assert_eq!(
        recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::Offline { .. })).await,
        ServerEvent::Offline {
            user_id: "alice".into(),
            last_seen_at: None,
        }
    );

    let (alice, _alice_rx) = join(&engine, "alice").await;
    engine.disconnect(alice);
    recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::Offline { .. })).await;

    engine.handle(bob, &bob_id, status).await;
    let reply = recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::Offline { .. })).await;
    assert!(matches!(
        reply,
        ServerEvent::Offline {
            last_seen_at: Some(_),
            ..
        }
    ));
}

#[tokio::test]
async fn status_of_a_non_contact_is_refused() {
    let engine = engine_with(friends("alice", "bob"), Duration::from_secs(5));
    let (eve, mut eve_rx) = join(&engine, "eve").await;
    let (_alice, _alice_rx) = join(&engine, "alice").await;
    settle().await;

    engine
        .handle(eve, &"eve".into(), ClientEvent::Status { receiver_id: "alice".into() })
        .await;
    let events = take(&mut eve_rx);
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::Online { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Error {
            kind: ErrorKind::Authorization,
            ..
        }
    )));
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn typing_fires_on_edge_and_expires() {
    let engine = engine_with(InMemoryStore::default(), Duration::from_secs(3));
    let (alice, _alice_rx) = join(&engine, "alice").await;
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let alice_id: UserId = "alice".into();
    let conversation = ConversationId::direct(&alice_id, &"bob".into());

    for _ in 0..3 {
        engine.handle(alice, &alice_id, typing_to("bob")).await;
    }
    let events = take(&mut bob_rx);
    assert_eq!(is_typing_events(&events), 1);

    // A refresh restarts the window.
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine.handle(alice, &alice_id, typing_to("bob")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.presence().is_typing(&alice_id, &conversation));
    assert_eq!(not_typing_events(&take(&mut bob_rx)), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!engine.presence().is_typing(&alice_id, &conversation));
    let events = take(&mut bob_rx);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::NotTyping { .. }))
            .collect::<Vec<_>>(),
        [&ServerEvent::NotTyping {
            user_id: alice_id.clone(),
            conversation_id: conversation,
        }]
    );
}

#[tokio::test]
async fn explicit_stop_ends_typing_once() {
    let engine = engine_with(InMemoryStore::default(), Duration::from_secs(5));
    let (alice, _alice_rx) = join(&engine, "alice").await;
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let alice_id: UserId = "alice".into();

    engine.handle(alice, &alice_id, typing_to("bob")).await;
    let stop = ClientEvent::NotTyping {
        receiver_id: Recipient::User("bob".into()),
    };
    engine.handle(alice, &alice_id, stop.clone()).await;
    engine.handle(alice, &alice_id, stop).await;

    let events = take(&mut bob_rx);
    assert_eq!(is_typing_events(&events), 1);
    assert_eq!(not_typing_events(&events), 1);
}

#[tokio::test]
async fn sending_a_message_ends_typing() {
    let engine = engine_with(InMemoryStore::default(), Duration::from_secs(5));
    let (alice, _alice_rx) = join(&engine, "alice").await;
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let alice_id: UserId = "alice".into();

    engine.handle(alice, &alice_id, typing_to("bob")).await;
    engine
        .handle(
            alice,
            &alice_id,
            ClientEvent::SendMessage {
                receiver_id: Recipient::User("bob".into()),
                content: "done typing".into(),
                attachment: None,
            },
        )
        .await;

    let events: Vec<ServerEvent> = take(&mut bob_rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                ServerEvent::IsTyping { .. }
                    | ServerEvent::NotTyping { .. }
                    | ServerEvent::SendMessageToReceiver(_)
            )
        })
        .collect();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], ServerEvent::IsTyping { .. }));
    assert!(matches!(events[1], ServerEvent::NotTyping { .. }));
    assert!(matches!(events[2], ServerEvent::SendMessageToReceiver(_)));
}

#[tokio::test]
async fn going_offline_ends_typing() {
    let engine = engine_with(InMemoryStore::default(), Duration::from_secs(30));
    let (alice, _alice_rx) = join(&engine, "alice").await;
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let alice_id: UserId = "alice".into();

    engine.handle(alice, &alice_id, typing_to("bob")).await;
    engine.disconnect(alice);

    let event = recv_until(&mut bob_rx, |e| matches!(e, ServerEvent::NotTyping { .. })).await;
    assert_eq!(
        event,
        ServerEvent::NotTyping {
            user_id: alice_id.clone(),
            conversation_id: ConversationId::direct(&alice_id, &"bob".into()),
        }
    );
    assert!(!engine.presence().is_typing(
        &alice_id,
        &ConversationId::direct(&alice_id, &"bob".into())
    ));
}

#[tokio::test]
async fn direct_typing_to_a_stranger_is_refused_under_friends_only() {
    let store = InMemoryStore::new(FriendPolicy::FriendsOnly);
    store.add_friendship(&"alice".into(), &"bob".into());
    let engine = engine_with(store, Duration::from_secs(5));
    let (eve, mut eve_rx) = join(&engine, "eve").await;
    let (alice, _alice_rx) = join(&engine, "alice").await;
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    settle().await;
    take(&mut bob_rx);

    engine.handle(eve, &"eve".into(), typing_to("alice")).await;
    let rejected = take(&mut eve_rx)
        .into_iter()
        .find(|e| matches!(e, ServerEvent::Error { .. }))
        .unwrap();
    assert!(matches!(
        rejected,
        ServerEvent::Error {
            kind: ErrorKind::Authorization,
            ..
        }
    ));
    assert!(!engine.presence().is_typing(
        &"eve".into(),
        &ConversationId::direct(&"eve".into(), &"alice".into())
    ));

    engine.handle(alice, &"alice".into(), typing_to("bob")).await;
    assert_eq!(is_typing_events(&take(&mut bob_rx)), 1);
}

#[tokio::test]
async fn group_typing_reaches_other_members() {
    let store = InMemoryStore::default();
    let team = GroupId::new("team");
    store.upsert_group(
        Group::new(team.clone(), "Team", "alice".into()).with_members(["bob".into(), "carol".into()]),
    );
    let engine = engine_with(store, Duration::from_secs(5));
    let (alice, mut alice_rx) = join(&engine, "alice").await;
    let (_bob, mut bob_rx) = join(&engine, "bob").await;
    let (_carol, mut carol_rx) = join(&engine, "carol").await;
    let (mallory, mut mallory_rx) = join(&engine, "mallory").await;

    let typing = ClientEvent::Typing {
        receiver_id: Recipient::Group(team.clone()),
    };
    engine.handle(alice, &"alice".into(), typing.clone()).await;

    assert_eq!(is_typing_events(&take(&mut bob_rx)), 1);
    assert_eq!(is_typing_events(&take(&mut carol_rx)), 1);
    assert_eq!(is_typing_events(&take(&mut alice_rx)), 0);

    engine.handle(mallory, &"mallory".into(), typing).await;
    let rejected = take(&mut mallory_rx)
        .into_iter()
        .find(|e| matches!(e, ServerEvent::Error { .. }))
        .unwrap();
    assert!(matches!(
        rejected,
        ServerEvent::Error {
            kind: ErrorKind::Authorization,
            ..
        }
    ));
    assert_eq!(is_typing_events(&take(&mut bob_rx)), 0);
}
