// src/link/errors.rs

use std::time::Duration;
use thiserror::Error;

use crate::io::serial::TransportError;

/// Failures surfaced by the link manager.
///
/// Only `RetryBudgetExhausted` means the manager has given up; everything
/// else is either recovered internally or reported and retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Device did not become ready within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Malformed telemetry payload: {0}")]
    Decode(String),

    #[error("Frame buffer exceeded {cap} bytes without a complete message, discarded {discarded} bytes")]
    ProtocolOverflow { cap: usize, discarded: usize },

    #[error("Gave up after {0} reconnect attempts")]
    RetryBudgetExhausted(u32),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Link manager has shut down")]
    ShutDown,
}
