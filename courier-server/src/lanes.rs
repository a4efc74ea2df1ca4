//! Per-connection send ordering.
//!
//! Sends from one connection are applied in the order they arrived, even
//! when an earlier one is still uploading an attachment. Each connection
//! gets a lane: a FIFO worker task that runs queued sends one at a time.
//! A text send that finds its lane idle runs inline so it completes before
//! [`Engine::handle`] returns; anything else is queued behind the lane.
//!
//! The dispatcher never waits on a queued send, so `cancel_upload` frames
//! behind it are still read and can cancel the upload.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use courier_proto::message::{AttachmentUpload, Recipient, UserId};
use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::sessions::ConnectionId;
use crate::store::Backend;

/// A send waiting for its turn.
#[derive(Debug)]
pub(crate) struct QueuedSend {
    pub(crate) sender: UserId,
    pub(crate) recipient: Recipient,
    pub(crate) content: String,
    pub(crate) attachment: Option<AttachmentUpload>,
}

/// Handle to one connection's send worker.
#[derive(Debug, Clone)]
pub(crate) struct SendLane {
    tx: mpsc::UnboundedSender<QueuedSend>,
    pending: Arc<AtomicUsize>,
}

impl SendLane {
    /// Whether no send is queued or running.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    fn push(&self, send: QueuedSend) -> Result<(), QueuedSend> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(send).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }
}

impl<B: Backend> Engine<B> {
    /// Runs or queues a send from `connection`, preserving arrival order.
    ///
    /// Must not be called concurrently for the same connection; the
    /// WebSocket reader handles one frame at a time.
    pub(crate) async fn submit_send(
        self: &Arc<Self>,
        connection: ConnectionId,
        send: QueuedSend,
    ) -> Result<(), EngineError> {
        let lane = self.lane(connection);
        if send.attachment.is_none() && lane.is_idle() {
            return self
                .send(&send.sender, send.recipient, send.content, None)
                .await
                .map(drop);
        }

        // Registered now so the upload can be cancelled while still queued.
        if let Some(upload) = &send.attachment {
            self.uploads.token_for(&send.sender, &upload.upload_id);
        }
        let sender = send.sender.clone();
        tracing::debug!(user_id = %sender, connection = %connection, "send queued behind lane");
        lane.push(send).map_err(|send| {
            if let Some(upload) = &send.attachment {
                self.uploads.finish(&sender, &upload.upload_id);
            }
            EngineError::Protocol("connection is closing".to_string())
        })
    }

    /// The connection's lane, starting its worker on first use.
    fn lane(self: &Arc<Self>, connection: ConnectionId) -> SendLane {
        self.lanes
            .entry(connection)
            .or_insert_with(|| spawn_lane(Arc::downgrade(self), connection))
            .clone()
    }

    /// Drops the connection's lane. Sends already queued still run.
    pub(crate) fn close_lane(&self, connection: ConnectionId) {
        self.lanes.remove(&connection);
    }
}

fn spawn_lane<B: Backend>(engine: Weak<Engine<B>>, connection: ConnectionId) -> SendLane {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedSend>();
    let pending = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pending);

    tokio::spawn(async move {
        while let Some(queued) = rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let upload_id = queued.attachment.as_ref().map(|a| a.upload_id.clone());
            let sender = queued.sender;
            if let Err(e) = engine
                .send(&sender, queued.recipient, queued.content, queued.attachment)
                .await
            {
                engine.report(connection, &sender, "send_message", &e);
            }
            if let Some(upload_id) = upload_id {
                engine.uploads.finish(&sender, &upload_id);
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(connection = %connection, "send lane closed");
    });

    SendLane { tx, pending }
}
