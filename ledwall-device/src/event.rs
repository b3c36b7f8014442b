//! Events consumed by the device controller.

use std::net::IpAddr;

/// Identifies one server connection, so events from a torn-down
/// connection can be told apart from the live one.
pub type ConnId = u64;

/// Everything the controller reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The address service acquired (or changed) the local address.
    AddressAcquired(IpAddr),
    /// The address service lost the local address.
    AddressLost,
    /// The identity header is on the wire.
    ConnActive { conn: ConnId },
    /// One frame was read into the jitter buffer.
    ReadComplete { conn: ConnId },
    /// The connection failed. Never raised for a local cancel.
    ConnErr { conn: ConnId, reason: String },
    /// The clock driver finished a scan and wants the next frame.
    NeedFrame,
    /// Prefetch poll timer fired.
    PrefetchTimer,
    /// Reconnect backoff elapsed.
    ConnectTimer,
}

impl DeviceEvent {
    /// Upper-case name used in transition logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddressAcquired(_) => "GOT_IP",
            Self::AddressLost => "LOST_IP",
            Self::ConnActive { .. } => "CONN_ACTIVE",
            Self::ReadComplete { .. } => "READ_COMPLETE",
            Self::ConnErr { .. } => "CONN_ERR",
            Self::NeedFrame => "NEED_FRAME",
            Self::PrefetchTimer => "PREFETCH_TIMER",
            Self::ConnectTimer => "CONNECT_TIMER",
        }
    }

    /// The connection this event belongs to, for connection events.
    pub fn conn(&self) -> Option<ConnId> {
        match self {
            Self::ConnActive { conn } | Self::ReadComplete { conn } | Self::ConnErr { conn, .. } => {
                Some(*conn)
            }
            _ => None,
        }
    }
}
