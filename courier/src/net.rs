//! Connection supervisor: keeps a session alive across network failures.
//!
//! [`spawn_net`] runs a background task that owns the [`Connection`]. It
//! applies every server event to the shared [`ClientState`] before
//! forwarding it, and reconnects with exponential backoff when the socket
//! drops.
//!
//! # Architecture
//!
//! ```text
//! caller  ←── NetEvent ───  supervisor task  ←── ServerEvent ── server
//!         ─── NetCommand →                   ─── ClientEvent →
//! ```
//!
//! After every (re)connect the server sends `synced`; once it has been
//! applied the supervisor re-opens the active conversation so the new
//! session is registered as viewing it again.

use std::sync::Arc;
use std::time::Duration;

use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::message::{Recipient, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{ConnectOptions, Connection};
use crate::sync::ClientState;

/// Default channel capacity for commands and events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Commands from the caller to the supervisor.
#[derive(Debug)]
pub enum NetCommand {
    /// Sends an event as-is.
    Send(ClientEvent),
    /// Opens a conversation, leaving the previous one.
    Open(Recipient),
    /// Closes the active conversation.
    Close,
    /// Stops the supervisor and drops the connection.
    Shutdown,
}

/// Events from the supervisor to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A session was established (the `joined` ack was received).
    Connected {
        /// The joined identity.
        user_id: UserId,
    },
    /// The session was lost or could not be established.
    Disconnected {
        /// Why.
        reason: String,
        /// Delay before the next attempt.
        retry_in: Duration,
    },
    /// A server event, already applied to the shared state.
    Server(ServerEvent),
    /// A command could not be carried out.
    Error(String),
}

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Starts at `initial` and doubles up to `max`.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; the following one will be twice as long.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to the initial delay after a successful connect.
    pub const fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// How a session ended.
enum SessionEnd {
    Lost(String),
    Shutdown,
}

/// Spawns the supervisor and returns its channel handles.
///
/// The supervisor keeps trying to connect until it receives
/// [`NetCommand::Shutdown`] or the command sender is dropped. Commands
/// that arrive while disconnected still update `state`, so an `Open`
/// issued offline takes effect on the next session.
#[must_use]
pub fn spawn_net(
    opts: ConnectOptions,
    backoff: Backoff,
    state: Arc<Mutex<ClientState>>,
) -> (mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let (evt_tx, evt_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    tokio::spawn(supervise(opts, backoff, state, cmd_rx, evt_tx));
    (cmd_tx, evt_rx)
}

async fn supervise(
    opts: ConnectOptions,
    mut backoff: Backoff,
    state: Arc<Mutex<ClientState>>,
    mut cmd_rx: mpsc::Receiver<NetCommand>,
    evt_tx: mpsc::Sender<NetEvent>,
) {
    loop {
        let reason = match Connection::connect(&opts).await {
            Ok(conn) => {
                backoff.reset();
                let connected = NetEvent::Connected {
                    user_id: conn.user_id().clone(),
                };
                if evt_tx.send(connected).await.is_err() {
                    return;
                }
                match run_session(conn, &state, &mut cmd_rx, &evt_tx).await {
                    SessionEnd::Shutdown => {
                        tracing::info!(user_id = %opts.user_id, "supervisor shutting down");
                        return;
                    }
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        let retry_in = backoff.next_delay();
        tracing::warn!(user_id = %opts.user_id, reason = %reason, retry_in_ms = retry_in.as_millis(), "session lost, reconnecting");
        if evt_tx
            .send(NetEvent::Disconnected { reason, retry_in })
            .await
            .is_err()
        {
            return;
        }

        let sleep = tokio::time::sleep(retry_in);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(NetCommand::Shutdown) => return,
                    Some(cmd) => {
                        if !command_events(&state, cmd).is_empty() {
                            let _ = evt_tx.send(NetEvent::Error("offline, event dropped".to_string())).await;
                        }
                    }
                },
            }
        }
    }
}

async fn run_session(
    mut conn: Connection,
    state: &Mutex<ClientState>,
    cmd_rx: &mut mpsc::Receiver<NetCommand>,
    evt_tx: &mpsc::Sender<NetEvent>,
) -> SessionEnd {
    let mut reopened = false;
    loop {
        tokio::select! {
            event = conn.recv() => {
                let Some(event) = event else {
                    return SessionEnd::Lost("connection closed".to_string());
                };
                let resync = matches!(event, ServerEvent::Synced { .. }) && !reopened;
                state.lock().apply(&event);
                if evt_tx.send(NetEvent::Server(event)).await.is_err() {
                    return SessionEnd::Shutdown;
                }
                if resync {
                    reopened = true;
                    let events = state.lock().reopen();
                    if !events.is_empty() {
                        tracing::info!(user_id = %conn.user_id(), "re-opening active conversation");
                    }
                    for event in events {
                        if let Err(e) = conn.send(event) {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    return SessionEnd::Shutdown;
                };
                if matches!(cmd, NetCommand::Shutdown) {
                    return SessionEnd::Shutdown;
                }
                for event in command_events(state, cmd) {
                    if let Err(e) = conn.send(event) {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }
}

/// Applies a command to the local state and returns what to send.
fn command_events(state: &Mutex<ClientState>, cmd: NetCommand) -> Vec<ClientEvent> {
    match cmd {
        NetCommand::Send(event) => vec![event],
        NetCommand::Open(target) => state.lock().open(target),
        NetCommand::Close => state.lock().close().into_iter().collect(),
        NetCommand::Shutdown => Vec::new(),
    }
}
