//! # ledwall-server — frame server for a sliced LED wall
//!
//! Renders effects into a bounded [`FrameStore`](ledwall_core::FrameStore)
//! and fans each frame out to the devices driving the wall, one
//! horizontal slice per device.
//!
//! ## Modules
//!
//! - [`server`]: Listener, accept loop and shutdown order.
//! - [`worker`]: Pool of single-threaded IO reactors.
//! - [`session`]: One device connection: handshake and slice delivery.
//! - [`director`]: Readiness gate and fan-out control.
//! - [`render`]: Effect playlist and the render thread.
//! - [`effect`]: Built-in effects.
//! - [`config`]: TOML configuration.

pub mod config;
pub mod director;
pub mod effect;
pub mod render;
pub mod server;
pub mod session;
pub mod worker;

pub use config::ServerConfig;
pub use director::{DirectorEvent, FrameDirector};
pub use render::{Renderer, Show};
pub use server::WallServer;
pub use session::{ClientSession, SessionCommand, SessionHandle, SessionKey};
pub use worker::WorkerPool;
