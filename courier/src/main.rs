//! `courier` line-mode client.
//!
//! Reads commands and messages from stdin and prints every server event as
//! one JSON line on stdout. Logs always go to a file so they never mix
//! with the event stream.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin courier -- --user alice
//! cargo run --bin courier -- --user bob --server ws://chat.example:9100/ws --json
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use courier_client::cache::UnreadCache;
use courier_client::command::{self, HELP, Input};
use courier_client::config::{CliArgs, ClientConfig};
use courier_client::net::{self, NetCommand, NetEvent};
use courier_client::sync::{ClientState, DEFAULT_SEEN_CAPACITY, SeenIds};
use courier_proto::codec;
use courier_proto::event::{ClientEvent, ServerEvent};
use courier_proto::message::{AttachmentUpload, Recipient};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

/// How often local typing indicators are checked for expiry.
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };
    let user = match config.user() {
        Ok(user) => user,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());
    tracing::info!(user_id = %user, server = %config.server_url, "courier client starting");

    let cache_path = config.cache_path_for(&user);
    let cache = UnreadCache::load(&cache_path, &user).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unread cache unusable, starting empty");
        UnreadCache::empty(&cache_path, &user)
    });
    let state = ClientState::new(user.clone(), cache)
        .with_seen(SeenIds::new(config.seen_ttl, DEFAULT_SEEN_CAPACITY))
        .with_typing_timeout(config.typing_timeout);
    let state = Arc::new(Mutex::new(state));

    let (cmd_tx, evt_rx) = net::spawn_net(
        config.connect_options(user),
        config.backoff(),
        Arc::clone(&state),
    );

    run(&state, &cmd_tx, evt_rx).await;

    let _ = cmd_tx.send(NetCommand::Shutdown).await;
    if let Err(e) = state.lock().unread_cache().save() {
        tracing::warn!(error = %e, "failed to save unread cache");
    }
    tracing::info!("courier client exiting");
}

/// Main loop: stdin lines in, JSON event lines out.
async fn run(
    state: &Mutex<ClientState>,
    cmd_tx: &mpsc::Sender<NetCommand>,
    mut evt_rx: mpsc::Receiver<NetEvent>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sweep = tokio::time::interval(TYPING_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read failed");
                        return;
                    }
                };
                let active = state.lock().active().cloned();
                match command::parse(&line, active.as_ref()) {
                    Ok(Input::Net(cmd)) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            return;
                        }
                    }
                    Ok(Input::Attach { path, caption, target }) => {
                        match attachment_send(&path, caption, target).await {
                            Ok(event) => {
                                if cmd_tx.send(NetCommand::Send(event)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => print_notice("error", &format!("cannot read {}: {e}", path.display())),
                        }
                    }
                    Ok(Input::Help) => eprintln!("{HELP}"),
                    Ok(Input::Quit) => return,
                    Ok(Input::Empty) => {}
                    Err(e) => print_notice("error", &e.to_string()),
                }
            }
            event = evt_rx.recv() => {
                let Some(event) = event else {
                    return;
                };
                print_net_event(state, &event);
            }
            _ = sweep.tick() => {
                for (user_id, conversation_id) in state.lock().expire_typing() {
                    print_event(&ServerEvent::NotTyping { user_id, conversation_id });
                }
            }
        }
    }
}

async fn attachment_send(
    path: &Path,
    caption: String,
    target: Recipient,
) -> std::io::Result<ClientEvent> {
    let data = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().into_owned());
    let upload_id = uuid::Uuid::now_v7().to_string();
    print_notice("upload_started", &upload_id);
    Ok(ClientEvent::SendMessage {
        receiver_id: target,
        content: caption,
        attachment: Some(AttachmentUpload {
            upload_id,
            mime_type: "application/octet-stream".to_string(),
            file_name,
            data,
        }),
    })
}

fn print_net_event(state: &Mutex<ClientState>, event: &NetEvent) {
    match event {
        NetEvent::Connected { user_id } => print_notice("connected", user_id.as_str()),
        NetEvent::Disconnected { reason, retry_in } => {
            print_notice("disconnected", &format!("{reason} (retry in {}ms)", retry_in.as_millis()));
        }
        NetEvent::Error(reason) => print_notice("error", reason),
        NetEvent::Server(server_event) => {
            print_event(server_event);
            if matches!(server_event, ServerEvent::Synced { .. } | ServerEvent::UnreadCounts(_))
                && let Err(e) = state.lock().unread_cache().save()
            {
                tracing::warn!(error = %e, "failed to save unread cache");
            }
        }
    }
}

fn print_event(event: &ServerEvent) {
    match codec::encode_json(event) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(event = event.name(), error = %e, "failed to render event"),
    }
}

/// Prints a client-side notice as `{"<kind>":"<detail>"}`.
fn print_notice(kind: &str, detail: &str) {
    println!("{}", serde_json::json!({ kind: detail }));
}

/// Initializes file logging. The returned guard must live until exit.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courier.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
