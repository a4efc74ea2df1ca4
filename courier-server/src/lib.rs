//! Courier server library.
//!
//! Exposes the delivery engine and its WebSocket transport for use in the
//! server binary, tests, and embedding. The engine keeps only ephemeral
//! state (sessions, views, typing, dedup fingerprints, cached counters);
//! everything durable lives behind the traits in [`store`].

pub mod config;
pub mod dedup;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod groups;
mod lanes;
pub mod notify;
pub mod presence;
pub mod reconcile;
pub mod server;
pub mod sessions;
pub mod store;
pub mod uploads;
pub mod views;
