//! cloudterm relay
//!
//! Serves browser terminals: provisions machines through a cloud provider
//! and bridges a WebSocket to an SSH shell on them.

pub mod api;
pub mod bridge;
pub mod config;
pub mod protocol;
pub mod ssh;
pub mod state;
