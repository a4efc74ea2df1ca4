//! Real-time event contract between clients and the Courier server.
//!
//! Every variant is externally tagged with its snake_case event name, so the
//! JSON encoding reads `{"join_room":{"user_id":"alice"}}` and the binary
//! encoding carries the same variant index.

use serde::{Deserialize, Serialize};

use crate::group::{Group, MembershipChange};
use crate::message::{
    AttachmentUpload, ConversationId, GroupId, Message, MessageId, Recipient, Timestamp, UserId,
};
use crate::presence::PresenceState;
use crate::unread::UnreadCounter;

/// Events sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    /// Registers this connection as a session of `user_id`.
    ///
    /// Must be the first event on a connection. The server answers with
    /// [`ServerEvent::Joined`] followed by [`ServerEvent::Synced`].
    JoinRoom {
        /// Identity issued by the identity provider.
        user_id: UserId,
    },
    /// Requests the current presence of a user.
    Status {
        /// User whose presence is requested.
        receiver_id: UserId,
    },
    /// The local user is typing to `receiver_id`.
    Typing {
        /// Conversation target.
        receiver_id: Recipient,
    },
    /// The local user stopped typing to `receiver_id`.
    NotTyping {
        /// Conversation target.
        receiver_id: Recipient,
    },
    /// Requests the history of a conversation; answered with
    /// [`ServerEvent::ReceiveMessages`].
    AllMessages {
        /// The requesting user (enforced server-side).
        sender_id: UserId,
        /// Conversation target.
        receiver_id: Recipient,
    },
    /// Composes a new message.
    SendMessage {
        /// Addressee.
        receiver_id: Recipient,
        /// Message text.
        content: String,
        /// Optional attachment to upload before persisting.
        attachment: Option<AttachmentUpload>,
    },
    /// Cancels an attachment upload that has not been persisted yet.
    CancelUpload {
        /// Id chosen by the client in [`AttachmentUpload::upload_id`].
        upload_id: String,
    },
    /// Deletes (tombstones) one of the user's own messages.
    MessageDeleted {
        /// Message to delete.
        id: MessageId,
        /// Addressee of the message.
        receiver_id: Recipient,
    },
    /// The user opened a conversation.
    UserJoinedChat {
        /// The viewing user (enforced server-side).
        user_id: UserId,
        /// Conversation target.
        chat_id: Recipient,
    },
    /// The user closed a conversation.
    UserLeftChat {
        /// The viewing user (enforced server-side).
        user_id: UserId,
        /// Conversation target.
        chat_id: Recipient,
    },
    /// Mutes or unmutes notifications for a conversation.
    MuteConversation {
        /// Conversation target.
        chat_id: Recipient,
        /// New mute flag.
        muted: bool,
    },
    /// Requests a fresh reconciliation snapshot.
    Sync,
}

/// Coarse classification of errors reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Sender is not permitted to address the recipient or group.
    Authorization,
    /// Conversation, group, or message does not exist.
    NotFound,
    /// Content failed validation.
    Validation,
    /// The authoritative write failed; the send was aborted.
    Persistence,
    /// The send was cancelled before it was persisted.
    Cancelled,
    /// The frame could not be decoded or was out of sequence.
    Protocol,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Persistence => "persistence",
            Self::Cancelled => "cancelled",
            Self::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Events sent by the server to a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    /// Registration acknowledgment.
    Joined {
        /// The registered identity.
        user_id: UserId,
    },
    /// Reconciliation snapshot: server state that replaces local caches.
    Synced {
        /// Unread counters recomputed from the store.
        unread: UnreadCounter,
        /// Presence of every contact.
        presence: Vec<PresenceState>,
    },
    /// A user came online.
    Online {
        /// The user.
        user_id: UserId,
    },
    /// A user went offline.
    Offline {
        /// The user.
        user_id: UserId,
        /// When their last session closed.
        last_seen_at: Option<Timestamp>,
    },
    /// A user started typing.
    IsTyping {
        /// The typing user.
        user_id: UserId,
        /// Where they are typing.
        conversation_id: ConversationId,
    },
    /// A user stopped typing, explicitly or by expiry.
    NotTyping {
        /// The user.
        user_id: UserId,
        /// Where they were typing.
        conversation_id: ConversationId,
    },
    /// History of a conversation, oldest first.
    ReceiveMessages {
        /// The conversation.
        conversation_id: ConversationId,
        /// Visible messages with their current read status.
        messages: Vec<Message>,
    },
    /// A message delivered to its recipient.
    SendMessageToReceiver(Message),
    /// A message echoed to its sender's sessions.
    SendMessageToSender(Message),
    /// Toast-level notification, decoupled from full delivery.
    NewMessage {
        /// Message text.
        content: String,
        /// Addressee.
        receiver_id: Recipient,
        /// Author.
        sender_id: UserId,
        /// Conversation the message belongs to.
        conversation_id: ConversationId,
    },
    /// Read receipt for the original sender.
    MessagesRead {
        /// The reader.
        receiver_id: UserId,
        /// Conversation in which messages were read.
        conversation_id: ConversationId,
        /// Number of messages newly marked read.
        read_count: u32,
    },
    /// A message was tombstoned.
    MessageDeleted {
        /// The deleted message.
        id: MessageId,
        /// Its addressee.
        receiver_id: Recipient,
        /// Its conversation.
        conversation_id: ConversationId,
    },
    /// The user's unread counters changed.
    UnreadCounts(UnreadCounter),
    /// A group was created.
    GroupCreated(Group),
    /// A user joined a group.
    GroupJoined {
        /// The group.
        group_id: GroupId,
        /// The new member.
        user_id: UserId,
    },
    /// A user was added to a group.
    GroupAdded {
        /// The group after the addition.
        group: Group,
        /// The added user.
        user_id: UserId,
    },
    /// A member left a group.
    GroupMemberLeft {
        /// The group.
        group_id: GroupId,
        /// The departing member.
        user_id: UserId,
        /// New owner, if ownership moved.
        new_owner: Option<UserId>,
    },
    /// A group was deleted.
    GroupDeleted {
        /// The deleted group.
        group_id: GroupId,
    },
    /// An attachment upload was cancelled; nothing was persisted.
    UploadCancelled {
        /// The cancelled upload.
        upload_id: String,
    },
    /// A request from this connection failed.
    Error {
        /// Error class.
        kind: ErrorKind,
        /// Human-readable description.
        reason: String,
    },
}

impl From<MembershipChange> for ServerEvent {
    fn from(change: MembershipChange) -> Self {
        match change {
            MembershipChange::Created(group) => Self::GroupCreated(group),
            MembershipChange::Joined { group_id, user_id } => Self::GroupJoined { group_id, user_id },
            MembershipChange::Added { group, user_id } => Self::GroupAdded { group, user_id },
            MembershipChange::MemberLeft {
                group_id,
                user_id,
                new_owner,
            } => Self::GroupMemberLeft {
                group_id,
                user_id,
                new_owner,
            },
            MembershipChange::Deleted { group_id, .. } => Self::GroupDeleted { group_id },
        }
    }
}

impl ServerEvent {
    /// An error report.
    pub fn error(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self::Error {
            kind,
            reason: reason.into(),
        }
    }

    /// The snake_case event name, as used on the wire and in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::Synced { .. } => "synced",
            Self::Online { .. } => "online",
            Self::Offline { .. } => "offline",
            Self::IsTyping { .. } => "is_typing",
            Self::NotTyping { .. } => "not_typing",
            Self::ReceiveMessages { .. } => "receive_messages",
            Self::SendMessageToReceiver(_) => "send_message_to_receiver",
            Self::SendMessageToSender(_) => "send_message_to_sender",
            Self::NewMessage { .. } => "new_message",
            Self::MessagesRead { .. } => "messages_read",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::UnreadCounts(_) => "unread_counts",
            Self::GroupCreated(_) => "group_created",
            Self::GroupJoined { .. } => "group_joined",
            Self::GroupAdded { .. } => "group_added",
            Self::GroupMemberLeft { .. } => "group_member_left",
            Self::GroupDeleted { .. } => "group_deleted",
            Self::UploadCancelled { .. } => "upload_cancelled",
            Self::Error { .. } => "error",
        }
    }
}
