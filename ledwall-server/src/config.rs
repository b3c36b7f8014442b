//! Configuration for the frame server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ledwall_core::{DEFAULT_MAX_FRAMES, DeviceId, Rgb, SliceTable, WallError, WallGeometry};

use crate::effect::EffectKind;
use crate::worker::default_worker_count;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Wall geometry and slice assignment.
    pub wall: WallConfig,
    /// IO worker pool.
    pub workers: WorkerConfig,
    /// Effect playlist.
    pub show: ShowConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the device listener binds to.
    pub listen_addr: String,
    /// Kernel send buffer per device socket, in bytes.
    pub send_buffer_bytes: u32,
    /// How long a new connection may take to send its identity.
    pub handshake_timeout_ms: u64,
}

/// Wall geometry and the device that drives each slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub width: usize,
    pub height: usize,
    pub slice_height: usize,
    /// Frames the server may hold before the renderer waits.
    pub max_frames: usize,
    /// Device ids in slice order, top band first.
    pub slices: Vec<DeviceId>,
}

/// IO worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker reactors; 0 picks one less than the number of cores.
    pub count: usize,
}

/// Effect playlist, played in order and looped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowConfig {
    pub effects: Vec<EffectConfig>,
}

/// One playlist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectConfig {
    pub name: EffectKind,
    /// Play time before moving to the next entry.
    pub seconds: u64,
    /// Colour for effects that take one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5050".into(),
            send_buffer_bytes: 1_024_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl Default for WallConfig {
    fn default() -> Self {
        let geometry = WallGeometry::default();
        Self {
            width: geometry.width,
            height: geometry.height,
            slice_height: geometry.slice_height,
            max_frames: DEFAULT_MAX_FRAMES,
            slices: vec![
                DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x6b, 0xf0]),
                DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x66, 0xb8]),
                DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x4b, 0x6c]),
            ],
        }
    }
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            effects: vec![
                EffectConfig {
                    name: EffectKind::Grid,
                    seconds: 10,
                    color: None,
                },
                EffectConfig {
                    name: EffectKind::Rainbow,
                    seconds: 30,
                    color: None,
                },
                EffectConfig {
                    name: EffectKind::Twist,
                    seconds: 30,
                    color: None,
                },
            ],
        }
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

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
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

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Validated wall geometry.
    pub fn geometry(&self) -> Result<WallGeometry, WallError> {
        WallGeometry::new(self.wall.width, self.wall.height, self.wall.slice_height)
    }

    /// Validated slice table. Needs at least one slice and no more than
    /// the geometry has bands.
    pub fn slice_table(&self) -> Result<SliceTable, WallError> {
        let geometry = self.geometry()?;
        if self.wall.slices.is_empty() {
            return Err(WallError::Config("no slices configured".into()));
        }
        if self.wall.slices.len() > geometry.slice_count() {
            return Err(WallError::Config(format!(
                "{} slices configured but the wall has {} bands",
                self.wall.slices.len(),
                geometry.slice_count()
            )));
        }
        SliceTable::new(self.wall.slices.clone())
    }

    pub fn max_frames(&self) -> usize {
        self.wall.max_frames.max(1)
    }

    /// Worker reactors to start.
    pub fn worker_count(&self) -> usize {
        match self.workers.count {
            0 => default_worker_count(),
            n => n,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.network.handshake_timeout_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────
