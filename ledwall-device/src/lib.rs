//! # ledwall-device — slice controller
//!
//! Runs on every device behind the wall. Connects to the frame server,
//! buffers a slice's worth of frames, and shifts them out column by
//! column on every edge of the external pixel clock.
//!
//! ## Modules
//!
//! - [`controller`]: The device state machine and its event loop.
//! - [`fetcher`]: Server connection filling the jitter buffer.
//! - [`playout`]: Frame advance, underrun counting and catch-up.
//! - [`clock`]: APA102 column encoding, the edge handler and clock sources.
//! - [`address`]: Network address service seam.
//! - [`event`]: Controller events.
//! - [`config`]: TOML configuration.
//! - [`error`]: `DeviceError`.

pub mod address;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod playout;

pub use config::{DeviceConfig, DeviceSettings};
pub use controller::{DeviceController, DeviceStatus};
pub use error::DeviceError;
pub use event::{ConnId, DeviceEvent};
