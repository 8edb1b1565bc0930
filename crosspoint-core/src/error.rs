//! Engine-level error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crosspoint_protocol::ProtocolError;

/// Errors surfaced by the engines and the routing model.
///
/// Framing and bounds errors are *local*: they are answered on the wire
/// and logged, never fatal for the engine. Connectivity errors surface
/// as `Error` events and drive reconnection; shutdown errors fail the
/// current operation only.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad checksum, truncated frame, non-UTF-8 payload.
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    /// An index is outside the configured matrix.
    #[error("{what} index {index} out of range (max {max})")]
    Bounds {
        what: &'static str,
        index: u32,
        max: u32,
    },

    /// The destination lock is held by a different connection.
    #[error("destination {dest} is locked by another connection")]
    LockHeld { dest: u32 },

    /// TCP-level failure (connect refused, reset, ...).
    #[error("connection failed: {0}")]
    Connectivity(String),

    /// The connect attempt did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The operation was cancelled by a disconnect request.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine is stopping; the operation was not performed.
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Local errors keep the connection alive.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            EngineError::Framing(_) | EngineError::Bounds { .. } | EngineError::LockHeld { .. }
        )
    }
}
