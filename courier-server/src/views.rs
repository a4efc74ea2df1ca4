//! Per-connection record of which conversations are open on screen.
//!
//! The delivery router consults this to decide whether an incoming message
//! is read on arrival. A view only counts once it is fully open: while the
//! history for a conversation is still being loaded the view is `Opening`,
//! and messages arriving in that window are counted unread and then swept
//! up by the retroactive read pass that finishes the open.

use std::collections::HashMap;

use courier_proto::message::ConversationId;
use dashmap::DashMap;

use crate::sessions::ConnectionId;

/// State of a conversation view on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    /// Not displayed.
    #[default]
    Closed,
    /// Open requested, history not yet delivered.
    Opening,
    /// Displayed and live.
    Open,
}

/// Tracks open conversation views for every connection.
#[derive(Debug, Default)]
pub struct ActiveViews {
    views: DashMap<ConnectionId, HashMap<ConversationId, ViewState>>,
}

impl ActiveViews {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts opening `conversation` on `connection`.
    ///
    /// A view that is already open stays open. Returns whether it was.
    pub fn begin_open(&self, connection: ConnectionId, conversation: &ConversationId) -> bool {
        let mut views = self.views.entry(connection).or_default();
        let state = views.entry(conversation.clone()).or_default();
        if *state == ViewState::Open {
            return true;
        }
        *state = ViewState::Opening;
        false
    }

    /// Completes an open started with [`begin_open`](Self::begin_open).
    ///
    /// Returns `false` if the view was closed in the meantime.
    pub fn finish_open(&self, connection: ConnectionId, conversation: &ConversationId) -> bool {
        let Some(mut views) = self.views.get_mut(&connection) else {
            return false;
        };
        match views.get_mut(conversation) {
            Some(state @ (ViewState::Opening | ViewState::Open)) => {
                *state = ViewState::Open;
                true
            }
            _ => false,
        }
    }

    /// Closes a view. Closing an unopened view is a no-op.
    pub fn close(&self, connection: ConnectionId, conversation: &ConversationId) {
        if let Some(mut views) = self.views.get_mut(&connection) {
            views.remove(conversation);
        }
    }

    /// Current state of a view.
    #[must_use]
    pub fn state(&self, connection: ConnectionId, conversation: &ConversationId) -> ViewState {
        self.views
            .get(&connection)
            .and_then(|views| views.get(conversation).copied())
            .unwrap_or_default()
    }

    /// Whether any of `connections` has `conversation` fully open.
    #[must_use]
    pub fn is_viewing(&self, connections: &[ConnectionId], conversation: &ConversationId) -> bool {
        connections
            .iter()
            .any(|c| self.state(*c, conversation) == ViewState::Open)
    }

    /// Conversations open (or opening) on a connection.
    #[must_use]
    pub fn open_on(&self, connection: ConnectionId) -> Vec<ConversationId> {
        self.views
            .get(&connection)
            .map(|views| views.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets every view of a closed connection.
    pub fn drop_connection(&self, connection: ConnectionId) {
        self.views.remove(&connection);
    }

    /// Closes `conversation` on each of `connections`.
    pub fn close_for(&self, connections: &[ConnectionId], conversation: &ConversationId) {
        for connection in connections {
            self.close(*connection, conversation);
        }
    }
}
