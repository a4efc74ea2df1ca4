#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for the shared data model.
//!
//! Uses proptest to verify:
//! 1. An unread counter's total always equals the sum of its counts.
//! 2. Read status never reverts from read to unread, and `read_at` is never
//!    earlier than the creation time.
//! 3. Applying a membership change twice is the same as applying it once.
//! 4. Random bytes never cause a panic in the frame decoder.

use std::collections::BTreeMap;

use courier_proto::codec::{self, Frame};
use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::group::{Group, MembershipChange};
use courier_proto::message::{ConversationId, GroupId, ReadStatus, Timestamp, UserId};
use courier_proto::unread::UnreadCounter;
use proptest::prelude::*;

// --- Strategies ---

fn arb_conversation() -> impl Strategy<Value = ConversationId> {
    (0u8..6).prop_map(|n| ConversationId::group(&GroupId::new(format!("g{n}"))))
}

fn arb_user() -> impl Strategy<Value = UserId> {
    (0u8..8).prop_map(|n| UserId::new(format!("u{n}")))
}

#[derive(Debug, Clone)]
enum CounterOp {
    Increment(ConversationId),
    Clear(ConversationId),
    Replace(BTreeMap<ConversationId, u32>),
}

fn arb_counter_op() -> impl Strategy<Value = CounterOp> {
    prop_oneof![
        4 => arb_conversation().prop_map(CounterOp::Increment),
        2 => arb_conversation().prop_map(CounterOp::Clear),
        1 => prop::collection::btree_map(arb_conversation(), 0u32..50, 0..4)
            .prop_map(CounterOp::Replace),
    ]
}

#[derive(Debug, Clone)]
enum ReadOp {
    Mark(u64),
    Merge(ReadStatus),
}

fn arb_observation() -> impl Strategy<Value = ReadStatus> {
    prop::option::of(any::<u64>()).prop_map(|at| {
        let mut status = ReadStatus::unread();
        if let Some(at) = at {
            status.mark_read(Timestamp::from_millis(at), Timestamp::from_millis(0));
        }
        status
    })
}

fn arb_read_op() -> impl Strategy<Value = ReadOp> {
    prop_oneof![
        any::<u64>().prop_map(ReadOp::Mark),
        arb_observation().prop_map(ReadOp::Merge),
    ]
}

fn arb_group() -> impl Strategy<Value = Group> {
    (arb_user(), prop::collection::btree_set(arb_user(), 0..5)).prop_map(|(owner, members)| {
        Group::new(GroupId::new("team"), "Team", owner).with_members(members)
    })
}

fn arb_change() -> impl Strategy<Value = MembershipChange> {
    prop_oneof![
        arb_user().prop_map(|user_id| MembershipChange::Joined {
            group_id: GroupId::new("team"),
            user_id,
        }),
        (arb_user(), prop::option::of(arb_user())).prop_map(|(user_id, new_owner)| {
            MembershipChange::MemberLeft {
                group_id: GroupId::new("team"),
                user_id,
                new_owner,
            }
        }),
        (arb_group(), arb_user()).prop_map(|(group, user_id)| MembershipChange::Added {
            group,
            user_id,
        }),
        arb_group().prop_map(MembershipChange::Created),
    ]
}

// --- Properties ---

proptest! {
    #[test]
    fn counter_total_is_sum_of_counts(ops in prop::collection::vec(arb_counter_op(), 0..64)) {
        let mut counter = UnreadCounter::new(UserId::new("me"));
        for op in ops {
            match op {
                CounterOp::Increment(conversation) => {
                    let before = counter.count(&conversation);
                    prop_assert_eq!(counter.increment(&conversation), before + 1);
                }
                CounterOp::Clear(conversation) => {
                    let before = counter.count(&conversation);
                    prop_assert_eq!(counter.clear(&conversation), before);
                    prop_assert_eq!(counter.count(&conversation), 0);
                }
                CounterOp::Replace(counts) => counter.replace(counts),
            }
            let sum: u32 = counter.per_conversation().values().sum();
            prop_assert_eq!(counter.total(), sum);
            prop_assert!(counter.per_conversation().values().all(|n| *n > 0));
        }
    }

    #[test]
    fn read_status_is_monotonic(
        created in 0u64..1_000_000,
        ops in prop::collection::vec(arb_read_op(), 0..32),
    ) {
        let created_at = Timestamp::from_millis(created);
        let mut status = ReadStatus::unread();
        let mut first_read_at = None;
        for op in ops {
            let was_read = status.is_read();
            let changed = match op {
                ReadOp::Mark(at) => status.mark_read(Timestamp::from_millis(at), created_at),
                ReadOp::Merge(other) => status.merge(&other, created_at),
            };
            if was_read {
                prop_assert!(!changed);
                prop_assert!(status.is_read());
                prop_assert_eq!(status.read_at(), first_read_at);
            } else if changed {
                first_read_at = status.read_at();
            }
            if let Some(at) = status.read_at() {
                prop_assert!(at >= created_at);
            }
            prop_assert_eq!(status.is_read(), status.read_at().is_some());
        }
    }

    #[test]
    fn membership_changes_are_idempotent(group in arb_group(), change in arb_change()) {
        let mut once = group.clone();
        once.apply(&change);

        let mut twice = group;
        twice.apply(&change);
        let changed_again = twice.apply(&change);

        prop_assert!(!changed_again);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn random_binary_frames_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let frame = Frame::Binary(bytes);
        let _ = codec::decode_frame::<ClientEvent>(&frame);
        let _ = codec::decode_frame::<ServerEvent>(&frame);
    }

    #[test]
    fn random_text_frames_never_panic(text in ".{0,256}") {
        let frame = Frame::Text(text);
        let _ = codec::decode_frame::<ClientEvent>(&frame);
        let _ = codec::decode_frame::<ServerEvent>(&frame);
    }
}
