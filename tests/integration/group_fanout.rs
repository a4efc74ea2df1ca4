#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for group fan-out and membership broadcasts.
//!
//! Verifies:
//! 1. Every member except the sender receives a group message.
//! 2. A member who leaves while a send is in flight does not receive it.
//! 3. A group deleted mid-flight keeps the stored message.
//! 4. Membership changes reach the users they concern, once, and a rejoin
//!    after leaving is announced again.
//! 5. Leaving a group clears its unread count.
//! 6. Group read state is tracked per member.
//! 7. The same text in a direct message and a group counts as two unread.

use std::sync::Arc;
use std::time::Duration;

use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::group::Group;
use courier_proto::message::{AttachmentUpload, ConversationId, GroupId, Recipient, UserId};
use courier_server::engine::{Engine, EngineConfig};
use courier_server::sessions::ConnectionId;
use courier_server::store::{ChatStore, Directory, InMemoryStore};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TestEngine = Arc<Engine<InMemoryStore>>;

struct Member {
    user: UserId,
    conn: ConnectionId,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Member {
    async fn join(engine: &TestEngine, user: &str) -> Self {
        let user = UserId::new(user);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = engine.connect(&user, tx).await;
        let mut member = Self { user, conn, rx };
        member.drain();
        member
    }

    async fn send(&self, engine: &TestEngine, event: ClientEvent) {
        engine.handle(self.conn, &self.user, event).await;
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            if !matches!(
                event,
                ServerEvent::Online { .. } | ServerEvent::Offline { .. } | ServerEvent::Joined { .. } | ServerEvent::Synced { .. }
            ) {
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

fn team() -> GroupId {
    GroupId::new("team")
}

fn setup(store: InMemoryStore) -> (Arc<InMemoryStore>, TestEngine) {
    store.upsert_group(
        Group::new(team(), "Team", "alice".into()).with_members(["bob".into(), "carol".into()]),
    );
    let store = Arc::new(store);
    let engine = Engine::start(Arc::clone(&store), EngineConfig::default());
    (store, engine)
}

fn to_team(content: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        receiver_id: Recipient::Group(team()),
        content: content.to_string(),
        attachment: None,
    }
}

fn slow_to_team(content: &str, upload_id: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        receiver_id: Recipient::Group(team()),
        content: content.to_string(),
        attachment: Some(AttachmentUpload {
            upload_id: upload_id.to_string(),
            file_name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            data: b"minutes".to_vec(),
        }),
    }
}

fn deliveries(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ServerEvent::SendMessageToReceiver(_)))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn members_except_sender_receive_group_message() {
    let (_store, engine) = setup(InMemoryStore::default());
    let mut alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;
    let mut carol = Member::join(&engine, "carol").await;

    alice.send(&engine, to_team("standup in 5")).await;

    let alice_events = alice.drain();
    assert_eq!(deliveries(&alice_events), 0);
    assert!(alice_events
        .iter()
        .any(|e| matches!(e, ServerEvent::SendMessageToSender(_))));

    let conversation = ConversationId::group(&team());
    for member in [&mut bob, &mut carol] {
        let events = member.drain();
        assert_eq!(deliveries(&events), 1, "{} should get the message", member.user);
        let counter = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::UnreadCounts(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(counter.count(&conversation), 1);
    }
}

#[tokio::test]
async fn member_leaving_mid_flight_is_not_delivered() {
    let (store, engine) =
        setup(InMemoryStore::default().with_upload_delay(Duration::from_millis(200)));
    let mut alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;
    let mut carol = Member::join(&engine, "carol").await;

    // Authorization and membership checks pass; the upload is in flight.
    alice.send(&engine, slow_to_team("agenda", "up-agenda")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let left = store.remove_member(&team(), &carol.user).unwrap();
    engine.membership_changed(left).await;

    bob.recv_until(|e| matches!(e, ServerEvent::SendMessageToReceiver(_)))
        .await;
    alice
        .recv_until(|e| matches!(e, ServerEvent::SendMessageToSender(_)))
        .await;

    let carol_events = carol.drain();
    assert_eq!(deliveries(&carol_events), 0);
    assert!(carol_events
        .iter()
        .any(|e| matches!(e, ServerEvent::GroupMemberLeft { user_id, .. } if *user_id == carol.user)));
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn group_deleted_mid_flight_keeps_the_message() {
    let (store, engine) =
        setup(InMemoryStore::default().with_upload_delay(Duration::from_millis(200)));
    let mut alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;

    alice.send(&engine, slow_to_team("last words", "up-last")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deleted = store.delete_group(&team()).unwrap();
    engine.membership_changed(deleted).await;

    alice
        .recv_until(|e| matches!(e, ServerEvent::SendMessageToSender(_)))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.message_count(), 1);
    let bob_events = bob.drain();
    assert_eq!(deliveries(&bob_events), 0);
    assert!(bob_events
        .iter()
        .any(|e| matches!(e, ServerEvent::GroupDeleted { .. })));
}

#[tokio::test]
async fn membership_changes_reach_their_audience() {
    let (store, engine) = setup(InMemoryStore::default());
    let mut alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;
    let mut dave = Member::join(&engine, "dave").await;
    let mut eve = Member::join(&engine, "eve").await;

    // Join: current members plus the newcomer; outsiders hear nothing.
    let joined = store.join_group(&team(), &dave.user).unwrap();
    engine.membership_changed(joined.clone()).await;
    engine.membership_changed(joined).await;
    for member in [&mut alice, &mut bob, &mut dave] {
        let events = member.drain();
        let count = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::GroupJoined { .. }))
            .count();
        assert_eq!(count, 1, "{} should see the join once", member.user);
    }
    assert!(eve.drain().is_empty());

    // Owner leaves: ownership moves to the smallest remaining member.
    let left = store.remove_member(&team(), &alice.user).unwrap();
    engine.membership_changed(left).await;
    let alice_events = alice.drain();
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ServerEvent::GroupMemberLeft { new_owner: Some(owner), .. } if owner.as_str() == "bob"
    )));
    assert_eq!(
        bob.drain()
            .iter()
            .filter(|e| matches!(e, ServerEvent::GroupMemberLeft { .. }))
            .count(),
        1
    );

    // Deletion: everyone who was still a member.
    let deleted = store.delete_group(&team()).unwrap();
    engine.membership_changed(deleted).await;
    assert!(bob.drain().iter().any(|e| matches!(e, ServerEvent::GroupDeleted { .. })));
    assert!(dave.drain().iter().any(|e| matches!(e, ServerEvent::GroupDeleted { .. })));
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn rejoin_after_leave_is_broadcast_again() {
    let (store, engine) = setup(InMemoryStore::default());
    let mut alice = Member::join(&engine, "alice").await;
    let mut dave = Member::join(&engine, "dave").await;

    let joined = store.join_group(&team(), &dave.user).unwrap();
    assert!(engine.membership_changed(joined).await > 0);
    let left = store.remove_member(&team(), &dave.user).unwrap();
    assert!(engine.membership_changed(left).await > 0);
    let rejoined = store.join_group(&team(), &dave.user).unwrap();
    assert!(engine.membership_changed(rejoined).await > 0);

    let seen: Vec<&str> = alice
        .drain()
        .iter()
        .filter_map(|e| match e {
            ServerEvent::GroupJoined { .. } => Some("joined"),
            ServerEvent::GroupMemberLeft { .. } => Some("left"),
            _ => None,
        })
        .collect();
    assert_eq!(seen, ["joined", "left", "joined"]);
    assert!(store.group(&team()).await.unwrap().unwrap().is_member(&dave.user));
    assert!(dave
        .drain()
        .iter()
        .any(|e| matches!(e, ServerEvent::GroupJoined { .. })));
}

#[tokio::test]
async fn same_text_in_direct_and_group_counts_twice() {
    let (_store, engine) = setup(InMemoryStore::default());
    let alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;

    alice
        .send(
            &engine,
            ClientEvent::SendMessage {
                receiver_id: Recipient::User(bob.user.clone()),
                content: "ok".into(),
                attachment: None,
            },
        )
        .await;
    alice.send(&engine, to_team("ok")).await;

    let last = bob
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::UnreadCounts(counter) => Some(counter),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last.total(), 2);
    assert_eq!(last.count(&ConversationId::group(&team())), 1);
    assert_eq!(
        last.count(&ConversationId::direct(&alice.user, &bob.user)),
        1
    );
}

#[tokio::test]
async fn leaving_clears_the_group_unread_count() {
    let (store, engine) = setup(InMemoryStore::default());
    let alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;

    alice.send(&engine, to_team("first")).await;
    alice.send(&engine, to_team("second")).await;
    bob.drain();

    let left = store.remove_member(&team(), &bob.user).unwrap();
    engine.membership_changed(left).await;

    let events = bob.drain();
    let counter = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::UnreadCounts(c) => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(counter.count(&ConversationId::group(&team())), 0);
    assert_eq!(counter.total(), 0);

    // A former member can no longer send.
    bob.send(&engine, to_team("still here?")).await;
    assert!(bob
        .drain()
        .iter()
        .any(|e| matches!(e, ServerEvent::Error { .. })));
}

#[tokio::test]
async fn group_read_state_is_per_member() {
    let (store, engine) = setup(InMemoryStore::default());
    let mut alice = Member::join(&engine, "alice").await;
    let mut bob = Member::join(&engine, "bob").await;

    alice.send(&engine, to_team("a")).await;
    alice.send(&engine, to_team("b")).await;
    alice.drain();
    bob.drain();

    bob.send(
        &engine,
        ClientEvent::UserJoinedChat {
            user_id: bob.user.clone(),
            chat_id: Recipient::Group(team()),
        },
    )
    .await;

    let receipts: Vec<(UserId, u32)> = alice
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::MessagesRead {
                receiver_id,
                read_count,
                ..
            } => Some((receiver_id, read_count)),
            _ => None,
        })
        .collect();
    assert_eq!(receipts, [(bob.user.clone(), 2)]);

    let conversation = ConversationId::group(&team());
    assert!(store.unread_counts(&bob.user).await.unwrap().get(&conversation).is_none());
    assert_eq!(
        store.unread_counts(&"carol".into()).await.unwrap().get(&conversation),
        Some(&2)
    );
}
