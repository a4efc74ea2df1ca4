//! Core data model shared by the Courier server and clients.
//!
//! Identifiers, timestamps, messages, and conversations. Every type here
//! is serializable in both the binary (postcard) and JSON encodings used on
//! the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum message content size in bytes (64 KB).
pub const MAX_CONTENT_LEN: usize = 64 * 1024;

/// Sentinel that replaces the content of a deleted message.
pub const TOMBSTONE: &str = "This message was deleted";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from its string form.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the string form of this identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Stable user identity, as issued by the external identity provider.
    UserId
);

string_id!(
    /// Identifier of a group managed by the external group store.
    GroupId
);

string_id!(
    /// Identifier of a conversation.
    ///
    /// Conversation ids are derived deterministically from their
    /// participants so that both sides agree without a lookup.
    ConversationId
);

impl ConversationId {
    /// The direct conversation between two users, independent of argument order.
    #[must_use]
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm:{lo}:{hi}"))
    }

    /// The conversation backing a group.
    #[must_use]
    pub fn group(group_id: &GroupId) -> Self {
        Self(format!("group:{group_id}"))
    }

    /// Returns `true` if this is a group conversation id.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.0.starts_with("group:")
    }
}

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Index of the coarse bucket of width `bucket_ms` containing this instant.
    ///
    /// A zero width puts every instant in its own bucket.
    #[must_use]
    pub const fn bucket(&self, bucket_ms: u64) -> u64 {
        if bucket_ms == 0 {
            self.0
        } else {
            self.0 / bucket_ms
        }
    }

    /// The next representable instant (one millisecond later).
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Addressee of a message: a single user or a whole group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A direct message to one user.
    User(UserId),
    /// A message to every member of a group.
    Group(GroupId),
}

impl Recipient {
    /// The conversation `me` shares with this recipient.
    #[must_use]
    pub fn conversation_with(&self, me: &UserId) -> ConversationId {
        match self {
            Self::User(peer) => ConversationId::direct(me, peer),
            Self::Group(group) => ConversationId::group(group),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Group(group) => write!(f, "group:{group}"),
        }
    }
}

/// Metadata for a stored attachment. The bytes live in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    /// Where the blob store serves the file from.
    pub url: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type reported by the uploader.
    pub mime_type: String,
    /// Size of the stored blob in bytes.
    pub size_bytes: u64,
}

/// An attachment being uploaded as part of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentUpload {
    /// Client-chosen id used to cancel the upload while it is in flight.
    pub upload_id: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type of the file.
    pub mime_type: String,
    /// Raw file bytes.
    pub data: Vec<u8>,
}

/// Read state of a message. Only ever moves from unread to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadStatus {
    is_read: bool,
    read_at: Option<Timestamp>,
}

impl ReadStatus {
    /// An unread status.
    #[must_use]
    pub const fn unread() -> Self {
        Self {
            is_read: false,
            read_at: None,
        }
    }

    /// Whether the message has been read.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        self.is_read
    }

    /// When the message was read, if it has been.
    #[must_use]
    pub const fn read_at(&self) -> Option<Timestamp> {
        self.read_at
    }

    /// Marks the status read at `at`, never earlier than `created_at`.
    ///
    /// Returns `false` (and changes nothing) if it was already read.
    pub fn mark_read(&mut self, at: Timestamp, created_at: Timestamp) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = Some(at.max(created_at));
        true
    }

    /// Merges another observation of the same message's status.
    ///
    /// A read observation wins over an unread one; an unread observation
    /// never reverts a read status. Returns `true` if `self` changed.
    pub fn merge(&mut self, other: &Self, created_at: Timestamp) -> bool {
        match (self.is_read, other.is_read) {
            (false, true) => self.mark_read(other.read_at.unwrap_or(created_at), created_at),
            _ => false,
        }
    }
}

/// A persisted chat message.
///
/// Everything except the content (tombstoned on delete) and the read
/// status (monotonic) is fixed once the store has assigned the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Addressee: a user or a group.
    pub recipient: Recipient,
    content: String,
    /// Optional attachment metadata.
    pub attachment: Option<Attachment>,
    /// Store-assigned creation time, strictly increasing per conversation.
    pub created_at: Timestamp,
    read_status: ReadStatus,
}

impl Message {
    /// Builds an unread message as assigned by a store.
    #[must_use]
    pub const fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        recipient: Recipient,
        content: String,
        attachment: Option<Attachment>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            recipient,
            content,
            attachment,
            created_at,
            read_status: ReadStatus::unread(),
        }
    }

    /// The message text, or [`TOMBSTONE`] once deleted.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Current read status.
    #[must_use]
    pub const fn read_status(&self) -> ReadStatus {
        self.read_status
    }

    /// Whether the message has been tombstoned.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.content == TOMBSTONE
    }

    /// Whether `user` is the direct recipient of this message.
    #[must_use]
    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        matches!(&self.recipient, Recipient::User(u) if u == user)
    }

    /// Marks the message read at `at`. Returns `false` if it already was.
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        self.read_status.mark_read(at, self.created_at)
    }

    /// Folds in a read status observed elsewhere, keeping monotonicity.
    pub fn merge_read_status(&mut self, other: &ReadStatus) -> bool {
        self.read_status.merge(other, self.created_at)
    }

    /// Replaces content with [`TOMBSTONE`] and drops the attachment.
    ///
    /// Returns `false` if the message was already deleted.
    pub fn tombstone(&mut self) -> bool {
        if self.is_deleted() {
            return false;
        }
        TOMBSTONE.clone_into(&mut self.content);
        self.attachment = None;
        true
    }
}

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Two participants.
    Direct,
    /// Backed by a group; membership may change externally.
    Group,
}

/// A conversation row as kept by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable conversation identifier.
    pub id: ConversationId,
    /// Direct or group.
    pub kind: ConversationKind,
    /// Participants at the time the row was last touched.
    pub participant_ids: Vec<UserId>,
    /// Most recently persisted message.
    pub last_message_id: Option<MessageId>,
    /// Per-user soft-clear boundary: messages created at or before it are
    /// hidden from that user only.
    pub cleared_for: BTreeMap<UserId, Timestamp>,
}

impl Conversation {
    /// A new, empty direct conversation between two users.
    #[must_use]
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        Self {
            id: ConversationId::direct(a, b),
            kind: ConversationKind::Direct,
            participant_ids: vec![a.clone(), b.clone()],
            last_message_id: None,
            cleared_for: BTreeMap::new(),
        }
    }

    /// A new, empty group conversation.
    #[must_use]
    pub fn group(group_id: &GroupId, members: Vec<UserId>) -> Self {
        Self {
            id: ConversationId::group(group_id),
            kind: ConversationKind::Group,
            participant_ids: members,
            last_message_id: None,
            cleared_for: BTreeMap::new(),
        }
    }

    /// Whether `message` is visible to `user` given their clear boundary.
    #[must_use]
    pub fn is_visible_to(&self, user: &UserId, message: &Message) -> bool {
        self.cleared_for
            .get(user)
            .is_none_or(|boundary| message.created_at > *boundary)
    }
}

/// Errors returned when validating outgoing content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty and there is no attachment.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates content for sending.
///
/// Empty content is only accepted when an attachment carries the message.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] or [`ValidationError::TooLarge`].
pub const fn validate_content(
    content: &str,
    has_attachment: bool,
    max_len: usize,
) -> Result<(), ValidationError> {
    if content.is_empty() && !has_attachment {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > max_len {
        return Err(ValidationError::TooLarge { size, max: max_len });
    }
    Ok(())
}
