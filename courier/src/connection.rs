//! A single WebSocket session with the Courier server.
//!
//! [`Connection::connect`] opens the socket, sends `join_room`, and waits
//! for the `joined` acknowledgment. After that a reader task decodes
//! frames into [`ServerEvent`]s and a writer task encodes outbound
//! [`ClientEvent`]s. Dropping the connection stops both tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_proto::codec::{self, CodecError, Frame, WireFormat};
use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::message::UserId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Errors from establishing or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting or joining took too long.
    #[error("timed out waiting for the server")]
    Timeout,

    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server refused the join.
    #[error("join rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Any other WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The server URL is malformed.
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Settings for [`Connection::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// WebSocket URL, e.g. `ws://127.0.0.1:9100/ws`.
    pub url: String,
    /// Identity to join as.
    pub user_id: UserId,
    /// Encoding for outbound frames; the server answers in kind.
    pub format: WireFormat,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Timeout for the `joined` acknowledgment.
    pub join_timeout: Duration,
}

impl ConnectOptions {
    /// Options with default timeouts and binary framing.
    #[must_use]
    pub fn new(url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            url: url.into(),
            user_id,
            format: WireFormat::Binary,
            connect_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(5),
        }
    }

    /// Builder-style helper that selects the wire format.
    #[must_use]
    pub const fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }
}

/// A joined session.
pub struct Connection {
    user_id: UserId,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.user_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects to the server and joins as `opts.user_id`.
    ///
    /// 1. Opens the WebSocket (`connect_timeout`)
    /// 2. Sends `join_room`
    /// 3. Waits for `joined` (`join_timeout`)
    /// 4. Spawns the reader and writer tasks
    ///
    /// The `synced` snapshot that follows `joined` is the first event
    /// returned by [`recv`](Self::recv).
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidUrl`] if the URL does not parse.
    /// - [`ClientError::Timeout`] if either step times out.
    /// - [`ClientError::Unreachable`] if nothing listens at the URL.
    /// - [`ClientError::Rejected`] if the server answers with an error.
    /// - [`ClientError::ConnectionClosed`] if the socket closes first.
    pub async fn connect(opts: &ConnectOptions) -> Result<Self, ClientError> {
        url::Url::parse(&opts.url)?;

        let (ws_stream, _response) = tokio::time::timeout(opts.connect_timeout, connect_async(&opts.url))
            .await
            .map_err(|_| {
                tracing::warn!(url = %opts.url, "WebSocket connect timed out");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %opts.url, error = %e, "WebSocket connect failed");
                map_connect_error(e)
            })?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = ClientEvent::JoinRoom {
            user_id: opts.user_id.clone(),
        };
        let frame = codec::encode_frame(&join, opts.format)?;
        ws_writer
            .send(frame_to_ws(frame))
            .await
            .map_err(|e| ClientError::WebSocket(format!("failed to send join_room: {e}")))?;

        tokio::time::timeout(opts.join_timeout, wait_for_joined(&mut ws_reader, &opts.user_id))
            .await
            .map_err(|_| {
                tracing::warn!(url = %opts.url, "join acknowledgment timed out");
                ClientError::Timeout
            })??;
        tracing::info!(user_id = %opts.user_id, url = %opts.url, format = ?opts.format, "joined");

        let connected = Arc::new(AtomicBool::new(true));
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(reader_loop(ws_reader, in_tx, Arc::clone(&connected)));
        let writer = tokio::spawn(writer_loop(
            ws_writer,
            out_rx,
            opts.format,
            Arc::clone(&connected),
        ));

        Ok(Self {
            user_id: opts.user_id.clone(),
            outbound,
            inbound,
            connected,
            reader,
            writer,
        })
    }

    /// The joined identity.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether both the reader and writer are still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queues an event for the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] once the writer has stopped.
    pub fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Receives the next server event, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn wait_for_joined(reader: &mut WsReader, user: &UserId) -> Result<(), ClientError> {
    while let Some(msg) = reader.next().await {
        let frame = match msg {
            Ok(Message::Binary(data)) => Frame::Binary(data.to_vec()),
            Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
            Ok(Message::Close(_)) => return Err(ClientError::ConnectionClosed),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => return Err(ClientError::WebSocket(e.to_string())),
        };
        return match codec::decode_frame::<ServerEvent>(&frame)? {
            ServerEvent::Joined { user_id } if &user_id == user => Ok(()),
            ServerEvent::Joined { user_id } => Err(ClientError::Rejected(format!(
                "server registered {user_id}"
            ))),
            ServerEvent::Error { kind, reason } => {
                tracing::warn!(%kind, reason = %reason, "join rejected");
                Err(ClientError::Rejected(reason))
            }
            other => Err(ClientError::Rejected(format!(
                "unexpected {} before joined",
                other.name()
            ))),
        };
    }
    Err(ClientError::ConnectionClosed)
}

async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::UnboundedSender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = ws_reader.next().await {
        let frame = match msg {
            Ok(Message::Binary(data)) => Frame::Binary(data.to_vec()),
            Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
            Ok(Message::Close(_)) => {
                tracing::info!("server closed the connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read error");
                break;
            }
        };
        match codec::decode_frame::<ServerEvent>(&frame) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            // Malformed frame: skip it and keep the connection.
            Err(e) => tracing::warn!(error = %e, "malformed server frame, skipping"),
        }
    }
    connected.store(false, Ordering::Relaxed);
}

async fn writer_loop(
    mut ws_writer: WsWriter,
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    format: WireFormat,
    connected: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        let frame = match codec::encode_frame(&event, format) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode event");
                continue;
            }
        };
        if let Err(e) = ws_writer.send(frame_to_ws(frame)).await {
            tracing::warn!(error = %e, "WebSocket write failed");
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
    let _ = ws_writer.close().await;
}

fn frame_to_ws(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::text(text),
    }
}

fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ClientError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            ClientError::Unreachable(io_err.to_string())
        }
        WsError::Http(response) => {
            ClientError::WebSocket(format!("HTTP error: status {}", response.status()))
        }
        other => ClientError::WebSocket(other.to_string()),
    }
}
