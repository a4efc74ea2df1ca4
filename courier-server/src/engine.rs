//! The event engine: shared state and per-event dispatch.
//!
//! One [`Engine`] serves every connection of the process. Connections feed it
//! decoded [`ClientEvent`]s through [`Engine::handle`], and it answers by
//! emitting [`ServerEvent`]s through the session registry. Message delivery,
//! group fan-out, and reconciliation live in their own modules as further
//! `impl` blocks on [`Engine`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::message::{MAX_CONTENT_LEN, Recipient, UserId};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::dedup::{self, DedupCache};
use crate::error::EngineError;
use crate::lanes::{QueuedSend, SendLane};
use crate::notify::NotificationAggregator;
use crate::presence::{DEFAULT_TYPING_TIMEOUT, PresenceTracker};
use crate::sessions::{ConnectionId, EventSender, PresenceTransition, SessionRegistry};
use crate::store::Backend;
use crate::uploads::UploadTracker;
use crate::views::ActiveViews;

/// Default maximum attachment size in bytes (10 MB).
pub const DEFAULT_MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;

/// Default number of messages returned by a history fetch.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Tunables for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a typing indicator lives without a refresh.
    pub typing_timeout: Duration,
    /// How long a fingerprint suppresses repeats.
    pub dedup_ttl: Duration,
    /// Width of the time bucket in message fingerprints.
    pub dedup_bucket: Duration,
    /// Maximum content size in bytes.
    pub max_content_len: usize,
    /// Maximum attachment size in bytes.
    pub max_attachment_size: usize,
    /// Maximum number of messages per history fetch.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            dedup_ttl: Duration::from_secs(30),
            dedup_bucket: Duration::from_secs(10),
            max_content_len: MAX_CONTENT_LEN,
            max_attachment_size: DEFAULT_MAX_ATTACHMENT_SIZE,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl EngineConfig {
    pub(crate) fn bucket_ms(&self) -> u64 {
        u64::try_from(self.dedup_bucket.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Shared delivery and synchronization state.
pub struct Engine<B: Backend> {
    pub(crate) backend: Arc<B>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) presence: Arc<PresenceTracker>,
    pub(crate) dedup: Arc<DedupCache>,
    pub(crate) views: ActiveViews,
    pub(crate) unread: NotificationAggregator,
    pub(crate) uploads: UploadTracker,
    pub(crate) lanes: DashMap<ConnectionId, SendLane>,
    pub(crate) config: EngineConfig,
}

impl<B: Backend> Engine<B> {
    /// Builds an engine and starts its background tasks.
    ///
    /// Must be called from within a tokio runtime. The tasks hold only weak
    /// references and stop once the returned engine is dropped.
    pub fn start(backend: Arc<B>, config: EngineConfig) -> Arc<Self> {
        let (registry, transitions) = SessionRegistry::new();
        let sessions = Arc::new(registry);
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&sessions),
            config.typing_timeout,
        ));
        let dedup = Arc::new(DedupCache::new(config.dedup_ttl));
        let unread = NotificationAggregator::new(Arc::clone(&dedup), config.bucket_ms());

        let engine = Arc::new(Self {
            backend,
            sessions,
            presence,
            dedup,
            views: ActiveViews::new(),
            unread,
            uploads: UploadTracker::new(),
            lanes: DashMap::new(),
            config,
        });

        spawn_presence_loop(Arc::downgrade(&engine), transitions);
        dedup::spawn_sweeper(&engine.dedup, engine.config.dedup_ttl);
        engine
    }

    /// The backing stores.
    #[must_use]
    pub const fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The session registry.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// The presence tracker.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a new session for `user` and sends it the `joined`
    /// acknowledgment followed by a `synced` snapshot.
    pub async fn connect(&self, user: &UserId, tx: EventSender) -> ConnectionId {
        let (connection, first) = self.sessions.register(user, tx);
        tracing::info!(user_id = %user, connection = %connection, first, "session joined");

        self.sessions.emit_to(
            connection,
            &ServerEvent::Joined {
                user_id: user.clone(),
            },
        );
        match self.sync_snapshot(user).await {
            Ok(snapshot) => {
                self.sessions.emit_to(connection, &snapshot);
            }
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "failed to build sync snapshot");
                self.sessions.emit_to(connection, &e.to_event());
            }
        }
        connection
    }

    /// Tears down a session and every view it had open.
    pub fn disconnect(&self, connection: ConnectionId) {
        self.views.drop_connection(connection);
        self.close_lane(connection);
        if let Some((user, last)) = self.sessions.unregister(connection) {
            tracing::info!(user_id = %user, connection = %connection, last, "session closed");
        }
    }

    /// Handles one event from `connection`, owned by `user`.
    ///
    /// Failures are reported to the originating connection only.
    pub async fn handle(self: &Arc<Self>, connection: ConnectionId, user: &UserId, event: ClientEvent) {
        let name = event_name(&event);
        tracing::debug!(user_id = %user, connection = %connection, event = name, "handling event");
        if let Err(e) = self.dispatch(connection, user, event).await {
            self.report(connection, user, name, &e);
        }
    }

    pub(crate) fn report(&self, connection: ConnectionId, user: &UserId, event: &str, error: &EngineError) {
        match error {
            EngineError::Persistence(_) => {
                tracing::error!(user_id = %user, connection = %connection, event, error = %error, "event failed");
            }
            EngineError::Cancelled(_) => {
                tracing::info!(user_id = %user, connection = %connection, event, error = %error, "event cancelled");
            }
            _ => {
                tracing::warn!(user_id = %user, connection = %connection, event, error = %error, "event rejected");
            }
        }
        self.sessions.emit_to(connection, &error.to_event());
    }

    async fn dispatch(
        self: &Arc<Self>,
        connection: ConnectionId,
        user: &UserId,
        event: ClientEvent,
    ) -> Result<(), EngineError> {
        match event {
            ClientEvent::JoinRoom { user_id } => Err(EngineError::Protocol(format!(
                "connection already joined as {user}, ignoring join_room for {user_id}"
            ))),
            ClientEvent::Status { receiver_id } => {
                let reply = self.status(user, &receiver_id).await?;
                self.sessions.emit_to(connection, &reply);
                Ok(())
            }
            ClientEvent::Typing { receiver_id } => self.typing(user, &receiver_id).await,
            ClientEvent::NotTyping { receiver_id } => {
                self.presence
                    .stop_typing(user, &receiver_id.conversation_with(user));
                Ok(())
            }
            ClientEvent::AllMessages {
                sender_id,
                receiver_id,
            } => {
                warn_identity_mismatch(user, &sender_id, "all_messages");
                self.open_conversation(connection, user, &receiver_id, true)
                    .await
            }
            ClientEvent::SendMessage {
                receiver_id,
                content,
                attachment,
            } => {
                let send = QueuedSend {
                    sender: user.clone(),
                    recipient: receiver_id,
                    content,
                    attachment,
                };
                self.submit_send(connection, send).await
            }
            ClientEvent::CancelUpload { upload_id } => {
                if self.uploads.cancel(user, &upload_id) {
                    tracing::info!(user_id = %user, upload_id = %upload_id, "upload cancel requested");
                } else {
                    tracing::debug!(user_id = %user, upload_id = %upload_id, "no upload in flight to cancel");
                }
                Ok(())
            }
            ClientEvent::MessageDeleted { id, .. } => self.delete(&id, user).await.map(drop),
            ClientEvent::UserJoinedChat { user_id, chat_id } => {
                warn_identity_mismatch(user, &user_id, "user_joined_chat");
                self.open_conversation(connection, user, &chat_id, false)
                    .await
            }
            ClientEvent::UserLeftChat { user_id, chat_id } => {
                warn_identity_mismatch(user, &user_id, "user_left_chat");
                self.views
                    .close(connection, &chat_id.conversation_with(user));
                Ok(())
            }
            ClientEvent::MuteConversation { chat_id, muted } => {
                let conversation = chat_id.conversation_with(user);
                let counter = self.unread.set_muted(user, &conversation, muted);
                tracing::info!(user_id = %user, conversation = %conversation, muted, "mute changed");
                self.sessions
                    .emit(user, &ServerEvent::UnreadCounts(counter));
                Ok(())
            }
            ClientEvent::Sync => {
                let snapshot = self.sync_snapshot(user).await?;
                self.sessions.emit_to(connection, &snapshot);
                Ok(())
            }
        }
    }

    /// Presence of `subject` as seen by `user`. Only contacts are visible.
    async fn status(&self, user: &UserId, subject: &UserId) -> Result<ServerEvent, EngineError> {
        if subject != user && !self.backend.contacts(user).await?.contains(subject) {
            return Err(EngineError::Authorization(format!(
                "{user} may not see the presence of {subject}"
            )));
        }
        let state = self.presence.state(subject);
        Ok(if state.is_online() {
            ServerEvent::Online {
                user_id: state.user_id,
            }
        } else {
            ServerEvent::Offline {
                user_id: state.user_id,
                last_seen_at: state.last_seen_at,
            }
        })
    }

    async fn typing(self: &Arc<Self>, user: &UserId, target: &Recipient) -> Result<(), EngineError> {
        let audience = match target {
            Recipient::User(peer) => {
                if !self.backend.can_message(user, peer).await? {
                    return Err(EngineError::Authorization(format!(
                        "{user} may not message {peer}"
                    )));
                }
                vec![peer.clone()]
            }
            Recipient::Group(group_id) => {
                let group = self
                    .backend
                    .group(group_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;
                if !group.is_member(user) {
                    return Err(EngineError::Authorization(format!(
                        "{user} is not a member of {group_id}"
                    )));
                }
                group
                    .member_ids
                    .into_iter()
                    .filter(|member| member != user)
                    .collect()
            }
        };
        self.presence
            .typing(user, &target.conversation_with(user), audience);
        Ok(())
    }

    async fn apply_transition(&self, transition: PresenceTransition) {
        let user = match &transition {
            PresenceTransition::Online(user) | PresenceTransition::Offline(user) => user,
        };
        let contacts = match self.backend.contacts(user).await {
            Ok(contacts) => contacts,
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "contact lookup failed, presence not broadcast");
                Vec::new()
            }
        };
        match &transition {
            PresenceTransition::Online(user) => self.presence.went_online(user, &contacts),
            PresenceTransition::Offline(user) => {
                self.presence.went_offline(user, &contacts);
            }
        }
    }
}

/// Consumes presence transitions in order until the engine is dropped.
fn spawn_presence_loop<B: Backend>(
    engine: Weak<Engine<B>>,
    mut transitions: mpsc::UnboundedReceiver<PresenceTransition>,
) {
    tokio::spawn(async move {
        while let Some(transition) = transitions.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.apply_transition(transition).await;
        }
        tracing::debug!("presence loop stopped");
    });
}

fn warn_identity_mismatch(session_user: &UserId, claimed: &UserId, event: &str) {
    if session_user != claimed {
        tracing::warn!(
            user_id = %session_user,
            claimed = %claimed,
            event,
            "payload user id differs from session, using session identity"
        );
    }
}

const fn event_name(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::JoinRoom { .. } => "join_room",
        ClientEvent::Status { .. } => "status",
        ClientEvent::Typing { .. } => "typing",
        ClientEvent::NotTyping { .. } => "not_typing",
        ClientEvent::AllMessages { .. } => "all_messages",
        ClientEvent::SendMessage { .. } => "send_message",
        ClientEvent::CancelUpload { .. } => "cancel_upload",
        ClientEvent::MessageDeleted { .. } => "message_deleted",
        ClientEvent::UserJoinedChat { .. } => "user_joined_chat",
        ClientEvent::UserLeftChat { .. } => "user_left_chat",
        ClientEvent::MuteConversation { .. } => "mute_conversation",
        ClientEvent::Sync => "sync",
    }
}
