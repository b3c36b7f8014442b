//! Domain-specific error types for the ledwall pipeline.
//!
//! Fallible operations return `Result<T, WallError>` or one of the narrower
//! errors below. Invalid input never panics; every failure is typed.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type shared by the server and the device.
#[derive(Debug, Error)]
pub enum WallError {
    // ── Identity / Protocol ──────────────────────────────────────
    /// A device identity string could not be parsed.
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    /// The peer did something the wire protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A state machine was asked for a transition it does not allow.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    /// A payload did not have the size the wall geometry requires.
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    // ── Configuration ────────────────────────────────────────────
    /// Startup configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Connection ───────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Pipeline ─────────────────────────────────────────────────
    /// Jitter buffer contract failure.
    #[error("jitter buffer: {0}")]
    Buffer(#[from] BufferError),

    /// Frame store wait ended without a frame.
    #[error("frame store: {0}")]
    Store(#[from] StoreError),
}

// ── BufferError ──────────────────────────────────────────────────

/// Contract failures of the [`JitterBuffer`](crate::jitter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// `pop` on an empty buffer.
    #[error("buffer underrun")]
    Underrun,

    /// `next`/`push` on a full buffer. Callers must never get here.
    #[error("buffer overrun")]
    Overrun,
}

// ── StoreError ───────────────────────────────────────────────────

/// Reasons a [`FrameStore`](crate::store::FrameStore) wait can end early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store was cancelled for shutdown.
    #[error("cancelled")]
    Cancelled,

    /// The requested sequence was discarded by a gate change.
    #[error("frame {0} discarded by gate change")]
    Closed(u64),
}
