//! Client-side view of the conversation state.
//!
//! [`ClientState`] folds [`ServerEvent`]s into a local picture: open
//! conversations and their messages, presence, typing indicators, groups,
//! and the unread cache. Live events are best effort; the state converges
//! through `synced` snapshots and history fetches, and server data always
//! replaces local data.
//!
//! Opening a conversation follows `Closed → Opening → Open`. Live messages
//! that arrive while the history fetch is in flight are buffered and merged
//! by id once `receive_messages` lands, so nothing is lost or duplicated in
//! the gap.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::group::{Group, MembershipChange};
use courier_proto::message::{ConversationId, GroupId, Message, MessageId, Recipient, Timestamp, UserId};
use courier_proto::presence::PresenceState;
use courier_proto::unread::UnreadCounter;
use tokio::time::Instant;

use crate::cache::UnreadCache;

/// Default time a processed message id is remembered.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(300);

/// Default upper bound on remembered ids.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Default local expiry of a remote typing indicator.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(6);

/// Per-conversation view state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    /// Not displayed.
    #[default]
    Closed,
    /// History requested but not yet received.
    Opening,
    /// History merged; live messages apply directly.
    Open,
}

/// Recently processed message ids, bounded by age and count.
#[derive(Debug)]
pub struct SeenIds {
    ttl: Duration,
    capacity: usize,
    order: VecDeque<(Instant, MessageId)>,
    index: HashMap<MessageId, Instant>,
}

impl SeenIds {
    /// Remembers at most `capacity` ids, each for at most `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            order: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    /// Records `id`. Returns `false` if it was already seen within the TTL.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        let now = Instant::now();
        self.purge(now);
        if self.index.contains_key(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            self.evict_oldest();
        }
        self.order.push_back((now, id.clone()));
        self.index.insert(id.clone(), now);
        true
    }

    /// Whether `id` is currently remembered.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index
            .get(id)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((at, id)) = self.order.pop_front() {
            // Only drop the index entry if it belongs to this insertion.
            if self.index.get(&id) == Some(&at) {
                self.index.remove(&id);
            }
        }
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_TTL, DEFAULT_SEEN_CAPACITY)
    }
}

/// Groups the local user belongs to.
#[derive(Debug, Default, Clone)]
pub struct GroupBook {
    groups: BTreeMap<GroupId, Group>,
}

impl GroupBook {
    /// Applies a membership change on behalf of `me`.
    ///
    /// Returns `true` if the book changed. Applying the same change twice
    /// is a no-op the second time.
    pub fn apply(&mut self, me: &UserId, change: &MembershipChange) -> bool {
        let group_id = change.group_id().clone();
        match change {
            MembershipChange::Deleted { .. } => self.groups.remove(&group_id).is_some(),
            MembershipChange::MemberLeft { user_id, .. } if user_id == me => {
                self.groups.remove(&group_id).is_some()
            }
            MembershipChange::Created(group) | MembershipChange::Added { group, .. }
                if !self.groups.contains_key(&group_id) =>
            {
                let mut group = group.clone();
                group.apply(change);
                self.groups.insert(group_id, group);
                true
            }
            _ => self
                .groups
                .get_mut(&group_id)
                .is_some_and(|group| group.apply(change)),
        }
    }

    /// A group by id.
    #[must_use]
    pub fn get(&self, id: &GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Every known group.
    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Number of known groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Debug, Default)]
struct View {
    state: ViewState,
    messages: Vec<Message>,
    buffered: Vec<Message>,
}

impl View {
    /// Inserts or merges by id, keeping `created_at` order.
    fn upsert(&mut self, incoming: Message) {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == incoming.id) {
            merge_into(existing, &incoming);
            return;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= incoming.created_at);
        self.messages.insert(at, incoming);
    }

    fn tombstone(&mut self, id: &MessageId) -> bool {
        let mut changed = false;
        for message in self
            .messages
            .iter_mut()
            .chain(self.buffered.iter_mut())
            .filter(|m| &m.id == id)
        {
            changed |= message.tombstone();
        }
        changed
    }
}

/// Folds the observable parts of a duplicate copy into `existing`.
fn merge_into(existing: &mut Message, incoming: &Message) {
    existing.merge_read_status(&incoming.read_status());
    if incoming.is_deleted() {
        existing.tombstone();
    }
}

/// Everything the client knows, rebuilt from server events.
#[derive(Debug)]
pub struct ClientState {
    me: UserId,
    views: HashMap<ConversationId, View>,
    active: Option<Recipient>,
    seen: SeenIds,
    presence: HashMap<UserId, PresenceState>,
    typing: HashMap<(UserId, ConversationId), Instant>,
    typing_timeout: Duration,
    groups: GroupBook,
    unread: UnreadCache,
}

impl ClientState {
    /// Fresh state for `me`, seeded with the cached unread counters.
    #[must_use]
    pub fn new(me: UserId, unread: UnreadCache) -> Self {
        Self {
            me,
            views: HashMap::new(),
            active: None,
            seen: SeenIds::default(),
            presence: HashMap::new(),
            typing: HashMap::new(),
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            groups: GroupBook::default(),
            unread,
        }
    }

    /// Builder-style helper that replaces the id dedup.
    #[must_use]
    pub fn with_seen(mut self, seen: SeenIds) -> Self {
        self.seen = seen;
        self
    }

    /// Builder-style helper that sets the local typing expiry.
    #[must_use]
    pub const fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    /// The local identity.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// Opens `target`, closing the previously active conversation.
    ///
    /// Returns the events to send: `user_left_chat` for the old view, then
    /// `user_joined_chat` and `all_messages` for the new one.
    pub fn open(&mut self, target: Recipient) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if self.active.as_ref() == Some(&target) {
            return self.reopen();
        }
        if let Some(left) = self.close() {
            events.push(left);
        }
        self.active = Some(target);
        events.extend(self.reopen());
        events
    }

    /// Closes the active conversation, if any.
    pub fn close(&mut self) -> Option<ClientEvent> {
        let target = self.active.take()?;
        let conversation = target.conversation_with(&self.me);
        self.views.remove(&conversation);
        tracing::debug!(conversation = %conversation, "view closed");
        Some(ClientEvent::UserLeftChat {
            user_id: self.me.clone(),
            chat_id: target,
        })
    }

    /// Restarts the open sequence for the active conversation.
    ///
    /// Used after a reconnect: the server forgot the view with the old
    /// session, so it must be opened again. Messages already shown stay
    /// and are merged with the fresh history.
    pub fn reopen(&mut self) -> Vec<ClientEvent> {
        let Some(target) = self.active.clone() else {
            return Vec::new();
        };
        let conversation = target.conversation_with(&self.me);
        let view = self.views.entry(conversation.clone()).or_default();
        view.state = ViewState::Opening;
        tracing::debug!(conversation = %conversation, "view opening");
        vec![
            ClientEvent::UserJoinedChat {
                user_id: self.me.clone(),
                chat_id: target.clone(),
            },
            ClientEvent::AllMessages {
                sender_id: self.me.clone(),
                receiver_id: target,
            },
        ]
    }

    /// Applies a server event. Returns `true` if local state changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Joined { .. }
            | ServerEvent::NewMessage { .. }
            | ServerEvent::UploadCancelled { .. }
            | ServerEvent::Error { .. } => false,
            ServerEvent::Synced { unread, presence } => {
                let mut changed = self.unread.replace_with(unread.clone());
                for state in presence {
                    changed |= self.set_presence(state.clone());
                }
                changed
            }
            ServerEvent::Online { user_id } => self.set_presence(PresenceState::online(user_id.clone())),
            ServerEvent::Offline {
                user_id,
                last_seen_at,
            } => {
                self.typing.retain(|(u, _), _| u != user_id);
                self.set_presence(PresenceState::offline(user_id.clone(), *last_seen_at))
            }
            ServerEvent::IsTyping {
                user_id,
                conversation_id,
            } => {
                let deadline = Instant::now() + self.typing_timeout;
                self.typing
                    .insert((user_id.clone(), conversation_id.clone()), deadline)
                    .is_none()
            }
            ServerEvent::NotTyping {
                user_id,
                conversation_id,
            } => self
                .typing
                .remove(&(user_id.clone(), conversation_id.clone()))
                .is_some(),
            ServerEvent::ReceiveMessages {
                conversation_id,
                messages,
            } => self.merge_history(conversation_id, messages),
            ServerEvent::SendMessageToReceiver(message) | ServerEvent::SendMessageToSender(message) => {
                self.receive_live(message)
            }
            ServerEvent::MessagesRead {
                receiver_id,
                conversation_id,
                read_count,
            } => self.apply_receipt(receiver_id, conversation_id, *read_count),
            ServerEvent::MessageDeleted {
                id, conversation_id, ..
            } => self
                .views
                .get_mut(conversation_id)
                .is_some_and(|view| view.tombstone(id)),
            ServerEvent::UnreadCounts(counter) => self.unread.replace_with(counter.clone()),
            ServerEvent::GroupCreated(_)
            | ServerEvent::GroupJoined { .. }
            | ServerEvent::GroupAdded { .. }
            | ServerEvent::GroupMemberLeft { .. }
            | ServerEvent::GroupDeleted { .. } => {
                let Some(change) = membership_change(event) else {
                    return false;
                };
                self.apply_membership(&change)
            }
        }
    }

    fn set_presence(&mut self, state: PresenceState) -> bool {
        if self.presence.get(&state.user_id) == Some(&state) {
            return false;
        }
        self.presence.insert(state.user_id.clone(), state);
        true
    }

    fn merge_history(&mut self, conversation: &ConversationId, messages: &[Message]) -> bool {
        let Some(view) = self.views.get_mut(conversation) else {
            tracing::debug!(conversation = %conversation, "history for a closed view, dropping");
            return false;
        };
        if view.state == ViewState::Closed {
            return false;
        }

        for message in messages {
            self.seen.insert(&message.id);
            view.upsert(message.clone());
        }
        let buffered = std::mem::take(&mut view.buffered);
        let merged = buffered.len();
        for message in buffered {
            view.upsert(message);
        }
        view.state = ViewState::Open;
        tracing::debug!(conversation = %conversation, history = messages.len(), buffered = merged, "view open");
        true
    }

    fn receive_live(&mut self, message: &Message) -> bool {
        if !self.seen.insert(&message.id) {
            tracing::debug!(message_id = %message.id, "duplicate delivery, dropping");
            return false;
        }
        match self.views.get_mut(&message.conversation_id) {
            Some(view) if view.state == ViewState::Opening => {
                view.buffered.push(message.clone());
                true
            }
            Some(view) if view.state == ViewState::Open => {
                view.upsert(message.clone());
                true
            }
            _ => false,
        }
    }

    /// Marks up to `read_count` of my messages as read by `reader`.
    ///
    /// In a direct conversation these are my messages to `reader`, oldest
    /// unread first. In a group the count covers my messages past the
    /// reader's previous watermark, so the newest `read_count` of mine are
    /// marked; a message counts as read once any member has read it.
    fn apply_receipt(&mut self, reader: &UserId, conversation: &ConversationId, read_count: u32) -> bool {
        if reader == &self.me {
            return false;
        }
        let Some(view) = self.views.get_mut(conversation) else {
            return false;
        };
        let me = &self.me;
        let now = Timestamp::now();
        let limit = usize::try_from(read_count).unwrap_or(usize::MAX);
        let mut changed = false;
        if conversation.is_group() {
            for message in view
                .messages
                .iter_mut()
                .rev()
                .filter(|m| &m.sender_id == me && !m.is_deleted())
                .take(limit)
            {
                changed |= message.mark_read(now);
            }
        } else {
            for message in view
                .messages
                .iter_mut()
                .filter(|m| &m.sender_id == me && m.is_addressed_to(reader) && !m.read_status().is_read())
                .take(limit)
            {
                changed |= message.mark_read(now);
            }
        }
        changed
    }

    fn apply_membership(&mut self, change: &MembershipChange) -> bool {
        let changed = self.groups.apply(&self.me, change);
        let removed_me = match change {
            MembershipChange::Deleted { .. } => true,
            MembershipChange::MemberLeft { user_id, .. } => user_id == &self.me,
            _ => false,
        };
        if removed_me {
            let group = Recipient::Group(change.group_id().clone());
            if self.active.as_ref() == Some(&group) {
                self.active = None;
            }
            self.views.remove(&ConversationId::group(change.group_id()));
        }
        changed
    }

    /// Drops typing indicators past their local deadline.
    ///
    /// Returns the expired `(user, conversation)` pairs.
    pub fn expire_typing(&mut self) -> Vec<(UserId, ConversationId)> {
        let now = Instant::now();
        let expired: Vec<_> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.typing.remove(key);
        }
        expired
    }

    /// Whether `user` is shown as typing in `conversation`.
    #[must_use]
    pub fn is_typing(&self, user: &UserId, conversation: &ConversationId) -> bool {
        self.typing
            .get(&(user.clone(), conversation.clone()))
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// The active conversation target.
    #[must_use]
    pub const fn active(&self) -> Option<&Recipient> {
        self.active.as_ref()
    }

    /// State of the view for `conversation`.
    #[must_use]
    pub fn view_state(&self, conversation: &ConversationId) -> ViewState {
        self.views
            .get(conversation)
            .map_or(ViewState::Closed, |view| view.state)
    }

    /// Messages shown for `conversation`, oldest first.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> &[Message] {
        self.views
            .get(conversation)
            .map_or(&[], |view| view.messages.as_slice())
    }

    /// Last known presence of `user`.
    #[must_use]
    pub fn presence(&self, user: &UserId) -> Option<&PresenceState> {
        self.presence.get(user)
    }

    /// Known groups.
    #[must_use]
    pub const fn groups(&self) -> &GroupBook {
        &self.groups
    }

    /// Current unread counters.
    #[must_use]
    pub const fn unread(&self) -> &UnreadCounter {
        self.unread.counter()
    }

    /// The persisted cache behind [`unread`](Self::unread).
    #[must_use]
    pub const fn unread_cache(&self) -> &UnreadCache {
        &self.unread
    }

    /// Processed-id dedup.
    #[must_use]
    pub const fn seen(&self) -> &SeenIds {
        &self.seen
    }
}

fn membership_change(event: &ServerEvent) -> Option<MembershipChange> {
    let change = match event {
        ServerEvent::GroupCreated(group) => MembershipChange::Created(group.clone()),
        ServerEvent::GroupJoined { group_id, user_id } => MembershipChange::Joined {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
        },
        ServerEvent::GroupAdded { group, user_id } => MembershipChange::Added {
            group: group.clone(),
            user_id: user_id.clone(),
        },
        ServerEvent::GroupMemberLeft {
            group_id,
            user_id,
            new_owner,
        } => MembershipChange::MemberLeft {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
            new_owner: new_owner.clone(),
        },
        ServerEvent::GroupDeleted { group_id } => MembershipChange::Deleted {
            group_id: group_id.clone(),
            member_ids: std::collections::BTreeSet::new(),
        },
        _ => return None,
    };
    Some(change)
}
