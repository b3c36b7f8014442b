//! Device controller state machine.
//!
//! Models the lifecycle of one slice controller, with validated
//! transitions that return `Result` instead of panicking.

use std::time::Instant;

use crate::error::WallError;

// ── DeviceState ──────────────────────────────────────────────────

/// The current phase of a slice controller.
///
/// ```text
///            address            CONN_ACTIVE         buffer full
///  Stopped ──────────► Ready ──────────────► Prefetch ──────────► Active
///     ▲                  ▲                       │                  │
///     │ address lost     └──── CONN_ERR / reset ─┴──────────────────┘
///     └──────────────────── (from any state)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// No network address. Initial state.
    #[default]
    Stopped,

    /// Address acquired; connecting or waiting to reconnect.
    Ready,

    /// Connected and filling the jitter buffer; clock disarmed.
    Prefetch,

    /// Clock armed, frames playing out.
    Active {
        /// When playout started.
        since: Instant,
    },
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl DeviceState {
    /// Upper-case name used in transition logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Ready => "READY",
            Self::Prefetch => "PREFETCH",
            Self::Active { .. } => "ACTIVE",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether a server connection is established (prefetching or playing).
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Prefetch | Self::Active { .. })
    }

    /// How long playout has been running. `None` outside `Active`.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// An address was acquired or changed. Any connection is dropped.
    ///
    /// Valid from: every state.
    pub fn acquire_address(&mut self) {
        *self = Self::Ready;
    }

    /// Transition to `Prefetch` once the identity header is on the wire.
    ///
    /// Valid from: `Ready`.
    pub fn begin_prefetch(&mut self) -> Result<(), WallError> {
        match self {
            Self::Ready => {
                *self = Self::Prefetch;
                Ok(())
            }
            other => Err(WallError::InvalidTransition {
                from: other.name(),
                event: "CONN_ACTIVE",
            }),
        }
    }

    /// Transition to `Active` once the buffer is full.
    ///
    /// Valid from: `Prefetch`.
    pub fn activate(&mut self) -> Result<(), WallError> {
        match self {
            Self::Prefetch => {
                *self = Self::Active {
                    since: Instant::now(),
                };
                Ok(())
            }
            other => Err(WallError::InvalidTransition {
                from: other.name(),
                event: "BUFFER_FULL",
            }),
        }
    }

    /// The connection failed or the controller was reset.
    ///
    /// Valid from: `Ready`, `Prefetch`, `Active`.
    pub fn lose_connection(&mut self) -> Result<(), WallError> {
        match self {
            Self::Ready | Self::Prefetch | Self::Active { .. } => {
                *self = Self::Ready;
                Ok(())
            }
            Self::Stopped => Err(WallError::InvalidTransition {
                from: "STOPPED",
                event: "CONN_ERR",
            }),
        }
    }

    /// The address was lost. Valid from every state.
    pub fn lose_address(&mut self) {
        *self = Self::Stopped;
    }
}

// ── Tests ────────────────────────────────────────────────────────
