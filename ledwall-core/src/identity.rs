//! Device identity and the slice table.
//!
//! A device announces itself with its 6-byte MAC address, sent once as the
//! first bytes of the stream. The server maps that identity to the slice of
//! the wall the device drives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WallError;

/// Length of the identity header on the wire.
pub const IDENTITY_LEN: usize = 6;

// ── DeviceId ─────────────────────────────────────────────────────

/// A device identity, displayed as `24-0a-c4-c0-6b-f0`.
///
/// Parsing accepts `-` or `:` separators in either case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId([u8; IDENTITY_LEN]);

impl DeviceId {
    pub const fn new(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// The identity header as sent on the wire.
    pub const fn to_bytes(self) -> [u8; IDENTITY_LEN] {
        self.0
    }
}

impl From<[u8; IDENTITY_LEN]> for DeviceId {
    fn from(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceId {
    type Err = WallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WallError::InvalidDeviceId(s.to_string());
        let mut bytes = [0u8; IDENTITY_LEN];
        let mut parts = s.trim().split(['-', ':']);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = WallError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

// ── SliceTable ───────────────────────────────────────────────────

/// Ordered list of configured devices; an id's position is its slice index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceTable {
    slices: Vec<DeviceId>,
}

impl SliceTable {
    /// Build a table, rejecting duplicate identities.
    pub fn new(slices: Vec<DeviceId>) -> Result<Self, WallError> {
        for (i, id) in slices.iter().enumerate() {
            if slices[..i].contains(id) {
                return Err(WallError::Config(format!("device {id} listed twice")));
            }
        }
        Ok(Self { slices })
    }

    /// Slice index of `id`, or `None` if the device is not configured.
    pub fn slice_index(&self, id: &DeviceId) -> Option<usize> {
        self.slices.iter().position(|s| s == id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.slice_index(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceId> {
        self.slices.iter()
    }
}

// ── Tests ────────────────────────────────────────────────────────
