pub mod device;
pub mod session;

pub use device::DeviceState;
pub use session::SessionPhase;
