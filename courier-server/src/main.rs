//! Courier server: real-time delivery and synchronization over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin courier-server
//!
//! # Run on custom address with friends-only direct messages
//! cargo run --bin courier-server -- --bind 127.0.0.1:8080 --friends-only
//!
//! # Or via environment variable
//! COURIER_ADDR=127.0.0.1:8080 cargo run --bin courier-server
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use courier_server::config::{ServerCliArgs, ServerConfig};
use courier_server::engine::Engine;
use courier_server::server;
use courier_server::store::{FriendPolicy, InMemoryStore};
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _guard = init_logging(&config.log_level, config.log_file.as_deref());

    tracing::info!(addr = %config.bind_addr, friends_only = config.friends_only, "starting courier server");

    let policy = if config.friends_only {
        FriendPolicy::FriendsOnly
    } else {
        FriendPolicy::Open
    };
    let store = InMemoryStore::new(policy);
    for seed in &config.groups {
        store.upsert_group(seed.to_group());
        tracing::info!(group_id = %seed.id, members = seed.members.len() + 1, "seeded group");
    }

    let engine = Engine::start(Arc::new(store), config.engine.clone());

    match server::start_server_with_engine(&config.bind_addr, engine).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}

/// Initializes tracing to stdout, or to a non-blocking file writer when a
/// log file is configured. The returned guard must live until exit.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
