//! Slice controller configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ledwall_core::{DeviceId, WallError, WallGeometry};

use crate::fetcher::Endpoint;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Server connection.
    pub network: NetworkConfig,
    /// This slice.
    pub device: SliceConfig,
    /// Pixel clock.
    pub clock: ClockConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Frame server address (IP:port).
    pub server_addr: String,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Backoff before reconnecting after a connection error.
    pub reconnect_ms: u64,
    /// Local address to bind before connecting; empty lets the OS pick.
    pub local_addr: String,
}

/// The slice this controller drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    /// Identity sent to the server.
    pub id: DeviceId,
    /// Columns.
    pub width: usize,
    /// LEDs per column.
    pub slice_height: usize,
    /// Jitter buffer depth in frames.
    pub depth: usize,
    /// Consecutive missed ticks tolerated before a reset.
    pub max_drops: u32,
    /// How often PREFETCH checks whether the buffer is full.
    pub prefetch_poll_ms: u64,
}

/// Pixel clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Full scans per second; the edge rate is `width * fps`.
    pub fps: u32,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_addr: "10.10.10.1:5050".into(),
            connect_timeout_ms: 3_000,
            reconnect_ms: 5_000,
            local_addr: String::new(),
        }
    }
}

impl Default for SliceConfig {
    fn default() -> Self {
        let geometry = WallGeometry::default();
        Self {
            id: DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x6b, 0xf0]),
            width: geometry.width,
            slice_height: geometry.slice_height,
            depth: 16,
            max_drops: 160,
            prefetch_poll_ms: 500,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { fps: 16 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl DeviceConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Check the configuration and resolve it into controller settings.
    pub fn settings(&self) -> Result<DeviceSettings, WallError> {
        let slice = &self.device;
        if slice.width == 0 || slice.slice_height == 0 {
            return Err(WallError::Config("slice dimensions must be non-zero".into()));
        }
        if slice.depth == 0 {
            return Err(WallError::Config("jitter buffer depth must be non-zero".into()));
        }
        let server: SocketAddr = self.network.server_addr.parse().map_err(|e| {
            WallError::Config(format!("server_addr {:?}: {e}", self.network.server_addr))
        })?;
        let local = match self.network.local_addr.trim() {
            "" => None,
            addr => Some(addr.parse::<SocketAddr>().map_err(|e| {
                WallError::Config(format!("local_addr {addr:?}: {e}"))
            })?),
        };
        Ok(DeviceSettings {
            id: slice.id,
            width: slice.width,
            leds: slice.slice_height,
            depth: slice.depth,
            max_drops: slice.max_drops,
            prefetch_poll: Duration::from_millis(slice.prefetch_poll_ms.max(1)),
            reconnect: Duration::from_millis(self.network.reconnect_ms),
            fps: self.clock.fps.max(1),
            endpoint: Endpoint {
                server,
                local,
                connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            },
        })
    }
}

/// Validated controller settings.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub id: DeviceId,
    pub width: usize,
    pub leds: usize,
    pub depth: usize,
    pub max_drops: u32,
    pub prefetch_poll: Duration,
    pub reconnect: Duration,
    pub fps: u32,
    pub endpoint: Endpoint,
}

impl DeviceSettings {
    /// Bytes in one frame payload from the server.
    pub fn frame_len(&self) -> usize {
        self.width * self.leds * WallGeometry::BYTES_PER_PIXEL
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&DeviceConfig::default()).unwrap();
        assert!(text.contains("server_addr"));
        assert!(text.contains("24-0a-c4-c0-6b-f0"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&DeviceConfig::default()).unwrap();
        let parsed: DeviceConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.device.depth, 16);
        assert_eq!(parsed.network.server_addr, "10.10.10.1:5050");
        assert_eq!(parsed.clock.fps, 16);
    }

    #[test]
    fn default_settings() {
        let settings = DeviceConfig::default().settings().unwrap();
        assert_eq!(settings.frame_len(), 288 * 48 * 3);
        assert_eq!(settings.max_drops, 160);
        assert_eq!(settings.endpoint.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.reconnect, Duration::from_secs(5));
        assert!(settings.endpoint.local.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: DeviceConfig = toml::from_str(
            r#"
            [network]
            local_addr = "127.0.0.1:0"

            [device]
            id = "AA:BB:CC:DD:EE:FF"
            depth = 4
            "#,
        )
        .unwrap();
        let settings = cfg.settings().unwrap();
        assert_eq!(settings.id.to_string(), "aa-bb-cc-dd-ee-ff");
        assert_eq!(settings.depth, 4);
        assert_eq!(settings.width, 288);
        assert!(settings.endpoint.local.is_some());
    }

    #[test]
    fn bad_values_are_config_errors() {
        let mut cfg = DeviceConfig::default();
        cfg.network.server_addr = "not-an-address".into();
        assert!(matches!(cfg.settings(), Err(WallError::Config(_))));

        let mut cfg = DeviceConfig::default();
        cfg.device.depth = 0;
        assert!(matches!(cfg.settings(), Err(WallError::Config(_))));
    }
}
