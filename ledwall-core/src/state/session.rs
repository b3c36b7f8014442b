//! Server-side session lifecycle.
//!
//! Tracks whether a device session has identified itself and whether it
//! is part of the current fan-out cycle.

use std::time::Instant;

use crate::error::WallError;

// ── SessionPhase ─────────────────────────────────────────────────

/// Lifecycle of one device session.
///
/// ```text
///  Handshaking ──► Ready ◄──► Streaming
///       │            │           │
///       └────────────┴───────────┴──► Closed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Waiting for the identity header.
    #[default]
    Handshaking,

    /// Identified and registered; not part of a fan-out cycle.
    Ready {
        /// When the identity header arrived.
        since: Instant,
    },

    /// Pulling its slice of every frame from `start_seq` onwards.
    Streaming {
        slice: usize,
        start_seq: u64,
    },

    /// Socket closed. Terminal.
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::Streaming { slice, .. } => write!(f, "Streaming(slice {slice})"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionPhase {
    /// Identified and not closed: counts towards readiness.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Streaming { .. })
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Identity header received.
    ///
    /// Valid from: `Handshaking`.
    pub fn identify(&mut self) -> Result<(), WallError> {
        match self {
            Self::Handshaking => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(WallError::InvalidTransition {
                from: "non-handshaking session",
                event: "identify",
            }),
        }
    }

    /// Join a fan-out cycle.
    ///
    /// Valid from: `Ready`.
    pub fn start_streaming(&mut self, slice: usize, start_seq: u64) -> Result<(), WallError> {
        match self {
            Self::Ready { .. } => {
                *self = Self::Streaming { slice, start_seq };
                Ok(())
            }
            _ => Err(WallError::InvalidTransition {
                from: "non-ready session",
                event: "start_streaming",
            }),
        }
    }

    /// Leave the fan-out cycle, keeping the connection.
    ///
    /// Valid from: `Streaming`. A `Ready` session stays `Ready`.
    pub fn pause(&mut self) -> Result<(), WallError> {
        match self {
            Self::Streaming { .. } => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            Self::Ready { .. } => Ok(()),
            _ => Err(WallError::InvalidTransition {
                from: "unidentified or closed session",
                event: "pause",
            }),
        }
    }

    /// Force to `Closed` regardless of current state.
    pub fn close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────
