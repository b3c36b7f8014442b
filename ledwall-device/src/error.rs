//! Device-side errors.

use std::time::Duration;

use thiserror::Error;

use ledwall_core::{BufferError, WallError};

/// Errors raised by the slice controller and its fetcher.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A shared pipeline error.
    #[error(transparent)]
    Wall(#[from] WallError),

    /// The TCP/IO layer reported an error. Includes peer close.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Connecting to the server took too long.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No frame arrived for too many consecutive clock ticks.
    #[error("sustained underrun: {drops} ticks without a frame")]
    FatalUnderrun { drops: u32 },

    /// The fetcher committed into a full jitter buffer.
    #[error("jitter buffer overrun")]
    Overrun,

    /// A frame did not match the configured slice size.
    #[error("frame of {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    /// The controller's event queue is gone.
    #[error("event queue closed")]
    EventsClosed,
}

impl DeviceError {
    /// Fatal errors force a controller reset; the rest are logged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalUnderrun { .. } | Self::Overrun | Self::Wall(WallError::Buffer(_))
        )
    }
}

impl From<BufferError> for DeviceError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::Overrun => Self::Overrun,
            other => Self::Wall(WallError::Buffer(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_errors_are_fatal() {
        assert!(DeviceError::from(BufferError::Overrun).is_fatal());
        assert!(DeviceError::from(BufferError::Underrun).is_fatal());
        assert!(DeviceError::FatalUnderrun { drops: 161 }.is_fatal());
    }

    #[test]
    fn io_errors_are_not_fatal() {
        let e: DeviceError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(!e.is_fatal());
        assert!(e.to_string().contains("connection"));
    }
}
