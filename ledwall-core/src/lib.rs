//! # ledwall-core
//!
//! Core library shared by the ledwall server and the slice controllers.
//!
//! This crate contains:
//! - **Frame types**: `Rgb`, `WallGeometry`, `Frame`, `Canvas`
//! - **Identity**: `DeviceId` (the 6-byte handshake header) and `SliceTable`
//! - **JitterBuffer**: split single-writer / single-reader frame ring guarded
//!   by an interrupt-safe critical section
//! - **FrameStore**: bounded, reference-counted multi-consumer frame backlog
//! - **State**: validated state machines for devices and server sessions
//! - **Error**: `WallError`, the typed `thiserror`-based error hierarchy

pub mod error;
pub mod frame;
pub mod identity;
pub mod jitter;
pub mod state;
pub mod store;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::{BufferError, StoreError, WallError};
pub use frame::{Canvas, Frame, Rgb, WallGeometry};
pub use identity::{DeviceId, IDENTITY_LEN, SliceTable};
pub use jitter::{FrameReader, FrameWriter, JitterBuffer};
pub use state::{DeviceState, SessionPhase};
pub use store::{DEFAULT_MAX_FRAMES, FrameStore};
