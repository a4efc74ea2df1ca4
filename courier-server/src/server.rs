//! WebSocket transport: accepts connections and bridges them to the engine.
//!
//! Each connection runs as two tasks. The reader decodes frames and hands
//! events to [`Engine::handle`] in arrival order; the writer drains the
//! session's outbound channel and encodes events in the format the client
//! used for its `join_room` frame.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use courier_proto::codec::{self, Frame, WireFormat};
use courier_proto::event::{ClientEvent, ErrorKind, ServerEvent};
use courier_proto::message::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::engine::{Engine, EngineConfig};
use crate::store::{Backend, InMemoryStore};

/// Result of starting a server: the bound address and the serving task.
pub type ServerHandle = (std::net::SocketAddr, tokio::task::JoinHandle<()>);

async fn ws_handler<B: Backend>(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine<B>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

/// Handles an upgraded WebSocket connection for a single session.
///
/// The connection lifecycle:
/// 1. Wait for a `join_room` frame; anything else closes the connection.
/// 2. Register the session, which queues `joined` and `synced`.
/// 3. Run the reader and writer until either side stops.
/// 4. Unregister the session and drop its views.
pub async fn handle_socket<B: Backend>(socket: WebSocket, engine: Arc<Engine<B>>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some((user, format)) = wait_for_join(&mut ws_receiver).await else {
        tracing::warn!("connection closed before join_room");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection = engine.connect(&user, tx).await;
    tracing::info!(user_id = %user, connection = %connection, ?format, "connection established");

    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match codec::encode_frame(&event, format) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(user_id = %writer_user, event = event.name(), error = %e, "failed to encode event");
                    continue;
                }
            };
            if ws_sender.send(frame_to_ws(frame)).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_user = user.clone();
    let reader_engine = Arc::clone(&engine);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let frame = match msg {
                Message::Binary(data) => Frame::Binary(data.to_vec()),
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            match codec::decode_frame::<ClientEvent>(&frame) {
                Ok(event) => reader_engine.handle(connection, &reader_user, event).await,
                Err(e) => {
                    tracing::warn!(user_id = %reader_user, error = %e, "failed to decode frame");
                    reader_engine.sessions().emit_to(
                        connection,
                        &ServerEvent::error(ErrorKind::Protocol, format!("undecodable frame: {e}")),
                    );
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    engine.disconnect(connection);
    tracing::info!(user_id = %user, connection = %connection, "connection closed");
}

/// Waits for the first event, which must be `join_room`.
///
/// Returns the joining user and the wire format of their frame.
async fn wait_for_join(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(UserId, WireFormat)> {
    while let Some(Ok(msg)) = receiver.next().await {
        let frame = match msg {
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        return match codec::decode_frame::<ClientEvent>(&frame) {
            Ok(ClientEvent::JoinRoom { user_id }) if user_id.as_str().is_empty() => {
                tracing::warn!("received join_room with empty user_id");
                None
            }
            Ok(ClientEvent::JoinRoom { user_id }) => Some((user_id, frame.format())),
            Ok(other) => {
                tracing::warn!(event = ?other, "expected join_room, got different event");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode join frame");
                None
            }
        };
    }
    None
}

fn frame_to_ws(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
    }
}

/// Starts a server backed by a fresh [`InMemoryStore`] and default engine
/// settings.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    let engine = Engine::start(Arc::new(InMemoryStore::default()), EngineConfig::default());
    start_server_with_engine(addr, engine).await
}

/// Starts a server around an existing engine.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_engine<B: Backend>(
    addr: &str,
    engine: Arc<Engine<B>>,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<B>))
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
