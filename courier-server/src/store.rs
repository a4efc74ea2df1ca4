//! Collaborator interfaces for the external stores, plus an in-memory backend.
//!
//! The engine never owns durable state. Messages and conversations live in a
//! [`ChatStore`], friendships and groups are resolved through a
//! [`Directory`], and attachment bytes go to a [`BlobStore`]. A
//! [`Backend`] is anything that provides all three.
//!
//! [`InMemoryStore`] implements every trait and is what the server binary and
//! the tests run against.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_proto::group::{Group, MembershipChange, MembershipUpdate};
use courier_proto::message::{
    Attachment, AttachmentUpload, Conversation, ConversationId, GroupId, Message, MessageId,
    Recipient, Timestamp, UserId,
};
use parking_lot::Mutex;

/// Errors reported by the external stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The addressed row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was rejected.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// A message before the store has assigned its id and creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Addressee.
    pub recipient: Recipient,
    /// Validated content.
    pub content: String,
    /// Uploaded attachment, if any.
    pub attachment: Option<Attachment>,
}

/// Outcome of a tombstone request on an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tombstone {
    /// The message was deleted by this call.
    Applied(Message),
    /// The message had already been deleted.
    AlreadyDeleted(Message),
}

/// Authoritative message and conversation storage.
pub trait ChatStore: Send + Sync {
    /// Persists a draft, assigning `id` and a `created_at` strictly greater
    /// than any earlier message in the same conversation.
    fn insert_message(
        &self,
        draft: MessageDraft,
    ) -> impl Future<Output = Result<Message, StoreError>> + Send;

    /// Fetches a message by id.
    fn message(
        &self,
        id: &MessageId,
    ) -> impl Future<Output = Result<Option<Message>, StoreError>> + Send;

    /// Tombstones a message. Returns `None` if it does not exist.
    fn tombstone(
        &self,
        id: &MessageId,
    ) -> impl Future<Output = Result<Option<Tombstone>, StoreError>> + Send;

    /// Marks every message in `conversation` that is unread by `reader` as
    /// read at `at`, returning the messages that changed.
    fn mark_read(
        &self,
        conversation: &ConversationId,
        reader: &UserId,
        at: Timestamp,
    ) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// The most recent `limit` messages visible to `viewer`, oldest first,
    /// with read status as seen by `viewer`.
    fn history(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Unread message count per conversation for `user`. Zero counts are omitted.
    fn unread_counts(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<BTreeMap<ConversationId, u32>, StoreError>> + Send;

    /// Fetches a conversation row.
    fn conversation(
        &self,
        id: &ConversationId,
    ) -> impl Future<Output = Result<Option<Conversation>, StoreError>> + Send;

    /// Hides every message created at or before `at` from `user` only.
    fn clear_for(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        at: Timestamp,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Friendship and group lookups.
pub trait Directory: Send + Sync {
    /// Whether `sender` may send a direct message to `recipient`.
    fn can_message(
        &self,
        sender: &UserId,
        recipient: &UserId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Resolves a group with its current membership.
    fn group(
        &self,
        id: &GroupId,
    ) -> impl Future<Output = Result<Option<Group>, StoreError>> + Send;

    /// Users who should see `user`'s presence: friends, direct-message
    /// peers, and group co-members.
    fn contacts(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<UserId>, StoreError>> + Send;
}

/// Attachment storage.
pub trait BlobStore: Send + Sync {
    /// Stores the upload and returns the metadata to attach to the message.
    fn put(
        &self,
        upload: AttachmentUpload,
    ) -> impl Future<Output = Result<Attachment, StoreError>> + Send;
}

/// Everything the engine needs from the outside world.
pub trait Backend: ChatStore + Directory + BlobStore + 'static {}

impl<T: ChatStore + Directory + BlobStore + 'static> Backend for T {}

/// Who may open a direct conversation with whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FriendPolicy {
    /// Anyone may message anyone.
    #[default]
    Open,
    /// Only users with a recorded friendship may message each other.
    FriendsOnly,
}

#[derive(Default)]
struct State {
    messages: HashMap<MessageId, Message>,
    by_conversation: HashMap<ConversationId, Vec<MessageId>>,
    conversations: HashMap<ConversationId, Conversation>,
    /// Per-member read watermark for group conversations.
    group_reads: HashMap<(ConversationId, UserId), Timestamp>,
    friendships: HashSet<(UserId, UserId)>,
    groups: HashMap<GroupId, Group>,
    /// Last revision handed out to a membership change.
    membership_revision: u64,
    blobs: HashMap<String, Vec<u8>>,
}

impl State {
    fn stamp(&mut self, change: MembershipChange) -> MembershipUpdate {
        self.membership_revision += 1;
        change.at(self.membership_revision)
    }

    fn group_of(&self, conversation: &ConversationId) -> Option<&Group> {
        self.groups
            .values()
            .find(|g| ConversationId::group(&g.id) == *conversation)
    }

    fn watermark(&self, conversation: &ConversationId, user: &UserId) -> Option<Timestamp> {
        self.group_reads
            .get(&(conversation.clone(), user.clone()))
            .copied()
    }

    fn conversation_messages(&self, conversation: &ConversationId) -> Vec<&Message> {
        self.by_conversation
            .get(conversation)
            .map(|ids| ids.iter().filter_map(|id| self.messages.get(id)).collect())
            .unwrap_or_default()
    }

    fn is_visible(&self, message: &Message, user: &UserId) -> bool {
        self.conversations
            .get(&message.conversation_id)
            .is_none_or(|c| c.is_visible_to(user, message))
    }
}

fn friendship(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// In-memory [`Backend`] used by the server binary and the tests.
///
/// Direct messages carry their read status on the row. Group messages are
/// read per member, so the store keeps a read watermark per (conversation,
/// member) instead of flipping the shared row.
pub struct InMemoryStore {
    state: Mutex<State>,
    policy: FriendPolicy,
    fail_writes: AtomicBool,
    upload_delay: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(FriendPolicy::Open)
    }
}

impl InMemoryStore {
    /// An empty store with the given friendship policy.
    #[must_use]
    pub fn new(policy: FriendPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy,
            fail_writes: AtomicBool::new(false),
            upload_delay: Duration::ZERO,
        }
    }

    /// Makes every blob upload take `delay`.
    #[must_use]
    pub const fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// While set, every write fails with [`StoreError::WriteFailed`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Records a mutual friendship.
    pub fn add_friendship(&self, a: &UserId, b: &UserId) {
        self.state.lock().friendships.insert(friendship(a, b));
    }

    /// Inserts or replaces a group. Returns the matching creation change.
    pub fn upsert_group(&self, group: Group) -> MembershipUpdate {
        let mut state = self.state.lock();
        state.groups.insert(group.id.clone(), group.clone());
        state.stamp(MembershipChange::Created(group))
    }

    /// A user joins a group of their own accord.
    pub fn join_group(&self, group_id: &GroupId, user: &UserId) -> Option<MembershipUpdate> {
        let mut state = self.state.lock();
        state.groups.get_mut(group_id)?.member_ids.insert(user.clone());
        Some(state.stamp(MembershipChange::Joined {
            group_id: group_id.clone(),
            user_id: user.clone(),
        }))
    }

    /// A user is added to a group by another member.
    pub fn add_member(&self, group_id: &GroupId, user: &UserId) -> Option<MembershipUpdate> {
        let mut state = self.state.lock();
        let group = state.groups.get_mut(group_id)?;
        group.member_ids.insert(user.clone());
        let group = group.clone();
        Some(state.stamp(MembershipChange::Added {
            group,
            user_id: user.clone(),
        }))
    }

    /// Removes a member, handing ownership to the smallest remaining member
    /// id when the owner leaves.
    pub fn remove_member(&self, group_id: &GroupId, user: &UserId) -> Option<MembershipUpdate> {
        let mut state = self.state.lock();
        let group = state.groups.get_mut(group_id)?;
        if !group.member_ids.remove(user) {
            return None;
        }
        let new_owner = if group.owner_id == *user {
            let next = group.member_ids.iter().next().cloned();
            if let Some(next) = &next {
                group.owner_id = next.clone();
            }
            next
        } else {
            None
        };
        let conversation = ConversationId::group(group_id);
        state.group_reads.remove(&(conversation, user.clone()));
        Some(state.stamp(MembershipChange::MemberLeft {
            group_id: group_id.clone(),
            user_id: user.clone(),
            new_owner,
        }))
    }

    /// Deletes a group. Its messages stay stored.
    pub fn delete_group(&self, group_id: &GroupId) -> Option<MembershipUpdate> {
        let mut state = self.state.lock();
        let group = state.groups.remove(group_id)?;
        Some(state.stamp(MembershipChange::Deleted {
            group_id: group.id,
            member_ids: group.member_ids,
        }))
    }

    /// Number of stored messages across all conversations.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.state.lock().blobs.len()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::WriteFailed("store is rejecting writes".into()))
        } else {
            Ok(())
        }
    }
}

impl ChatStore for InMemoryStore {
    async fn insert_message(&self, draft: MessageDraft) -> Result<Message, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock();

        let last = state
            .by_conversation
            .get(&draft.conversation_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.messages.get(id))
            .map(|m| m.created_at);
        let now = Timestamp::now();
        let created_at = match last {
            Some(last) if now <= last => last.next(),
            _ => now,
        };

        let message = Message::new(
            MessageId::new(),
            draft.conversation_id.clone(),
            draft.sender_id.clone(),
            draft.recipient.clone(),
            draft.content,
            draft.attachment,
            created_at,
        );

        let participants = match &draft.recipient {
            Recipient::User(peer) => vec![draft.sender_id.clone(), peer.clone()],
            Recipient::Group(group_id) => state
                .groups
                .get(group_id)
                .map(|g| g.member_ids.iter().cloned().collect())
                .unwrap_or_else(|| vec![draft.sender_id.clone()]),
        };
        let conversation = state
            .conversations
            .entry(draft.conversation_id.clone())
            .or_insert_with(|| match &draft.recipient {
                Recipient::User(peer) => Conversation::direct(&draft.sender_id, peer),
                Recipient::Group(group_id) => Conversation::group(group_id, Vec::new()),
            });
        conversation.participant_ids = participants;
        conversation.last_message_id = Some(message.id.clone());

        state
            .by_conversation
            .entry(draft.conversation_id)
            .or_default()
            .push(message.id.clone());
        state.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.state.lock().messages.get(id).cloned())
    }

    async fn tombstone(&self, id: &MessageId) -> Result<Option<Tombstone>, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let Some(message) = state.messages.get_mut(id) else {
            return Ok(None);
        };
        if message.tombstone() {
            Ok(Some(Tombstone::Applied(message.clone())))
        } else {
            Ok(Some(Tombstone::AlreadyDeleted(message.clone())))
        }
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        reader: &UserId,
        at: Timestamp,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock();

        if conversation.is_group() {
            let watermark = state.watermark(conversation, reader);
            let newly: Vec<Message> = state
                .conversation_messages(conversation)
                .into_iter()
                .filter(|m| m.sender_id != *reader)
                .filter(|m| watermark.is_none_or(|w| m.created_at > w))
                .map(|m| {
                    let mut m = m.clone();
                    m.mark_read(at);
                    m
                })
                .collect();
            if let Some(latest) = newly.iter().map(|m| m.created_at).max() {
                state
                    .group_reads
                    .insert((conversation.clone(), reader.clone()), latest);
            }
            return Ok(newly);
        }

        let ids = state
            .by_conversation
            .get(conversation)
            .cloned()
            .unwrap_or_default();
        let mut newly = Vec::new();
        for id in ids {
            if let Some(message) = state.messages.get_mut(&id)
                && message.is_addressed_to(reader)
                && message.mark_read(at)
            {
                newly.push(message.clone());
            }
        }
        Ok(newly)
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock();
        let watermark = conversation
            .is_group()
            .then(|| state.watermark(conversation, viewer))
            .flatten();

        let mut visible: Vec<Message> = state
            .conversation_messages(conversation)
            .into_iter()
            .filter(|m| state.is_visible(m, viewer))
            .cloned()
            .map(|mut m| {
                if let Some(w) = watermark
                    && m.sender_id != *viewer
                    && m.created_at <= w
                {
                    m.mark_read(w);
                }
                m
            })
            .collect();

        let skip = visible.len().saturating_sub(limit);
        visible.drain(..skip);
        Ok(visible)
    }

    async fn unread_counts(
        &self,
        user: &UserId,
    ) -> Result<BTreeMap<ConversationId, u32>, StoreError> {
        let state = self.state.lock();
        let mut counts: BTreeMap<ConversationId, u32> = BTreeMap::new();

        for message in state.messages.values() {
            if !message.is_addressed_to(user) || message.read_status().is_read() {
                continue;
            }
            if state.is_visible(message, user) {
                *counts.entry(message.conversation_id.clone()).or_default() += 1;
            }
        }

        for group in state.groups.values().filter(|g| g.is_member(user)) {
            let conversation = ConversationId::group(&group.id);
            let watermark = state.watermark(&conversation, user);
            let unread = state
                .conversation_messages(&conversation)
                .into_iter()
                .filter(|m| m.sender_id != *user)
                .filter(|m| watermark.is_none_or(|w| m.created_at > w))
                .filter(|m| state.is_visible(m, user))
                .count();
            if unread > 0 {
                counts.insert(conversation, u32::try_from(unread).unwrap_or(u32::MAX));
            }
        }

        Ok(counts)
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state.lock().conversations.get(id).cloned())
    }

    async fn clear_for(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let row = state
            .conversations
            .get_mut(conversation)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation}")))?;
        row.cleared_for.insert(user.clone(), at);
        Ok(())
    }
}

impl Directory for InMemoryStore {
    async fn can_message(&self, sender: &UserId, recipient: &UserId) -> Result<bool, StoreError> {
        match self.policy {
            FriendPolicy::Open => Ok(true),
            FriendPolicy::FriendsOnly => Ok(self
                .state
                .lock()
                .friendships
                .contains(&friendship(sender, recipient))),
        }
    }

    async fn group(&self, id: &GroupId) -> Result<Option<Group>, StoreError> {
        Ok(self.state.lock().groups.get(id).cloned())
    }

    async fn contacts(&self, user: &UserId) -> Result<Vec<UserId>, StoreError> {
        let state = self.state.lock();
        let mut contacts = BTreeSet::new();

        for (a, b) in &state.friendships {
            if a == user {
                contacts.insert(b.clone());
            } else if b == user {
                contacts.insert(a.clone());
            }
        }
        for conversation in state.conversations.values() {
            if !conversation.id.is_group() && conversation.participant_ids.contains(user) {
                contacts.extend(conversation.participant_ids.iter().cloned());
            }
        }
        for group in state.groups.values().filter(|g| g.is_member(user)) {
            contacts.extend(group.member_ids.iter().cloned());
        }

        contacts.remove(user);
        Ok(contacts.into_iter().collect())
    }
}

impl BlobStore for InMemoryStore {
    async fn put(&self, upload: AttachmentUpload) -> Result<Attachment, StoreError> {
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        self.check_writable()?;

        let key = uuid::Uuid::now_v7();
        let attachment = Attachment {
            url: format!("mem://blob/{key}"),
            file_name: upload.file_name,
            mime_type: upload.mime_type,
            size_bytes: upload.data.len() as u64,
        };
        self.state
            .lock()
            .blobs
            .insert(attachment.url.clone(), upload.data);
        Ok(attachment)
    }
}
