//! Courier client: connection, reconnect supervisor, and local sync state.

pub mod cache;
pub mod command;
pub mod config;
pub mod connection;
pub mod net;
pub mod sync;
