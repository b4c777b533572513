// src/link/mod.rs
//
// Link supervision: connection lifecycle, liveness and reconnection for one
// physical device port.

mod errors;
mod supervisor;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use errors::LinkError;
pub use supervisor::LinkManager;

/// Lifecycle of the device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; needs a manual reconnect
    Abandoned,
    ShuttingDown,
}

/// Snapshot published by the supervisor after every transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub state: LinkState,
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    /// When the last message was classified (or the link last came up)
    pub last_seen_at: Option<DateTime<Utc>>,
    pub buffered_bytes: usize,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState {
            state: LinkState::Disconnected,
            is_connected: false,
            reconnect_attempts: 0,
            last_seen_at: None,
            buffered_bytes: 0,
        }
    }
}
