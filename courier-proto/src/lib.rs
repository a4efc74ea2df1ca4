//! Shared protocol definitions for the Courier real-time event contract.

pub mod codec;
pub mod event;
pub mod group;
pub mod message;
pub mod presence;
pub mod unread;
