//! Transport layer module.

pub mod emulated;
pub mod endpoint;
pub mod mock;
pub mod nusb;
pub mod stream;
pub mod traits;

pub use emulated::{EmulatedDevice, EmulatorConfig, FaultPlan};
pub use endpoint::Endpoint;
pub use mock::MockTransport;
pub use nusb::{DeviceInfo, NusbTransport, scan_devices};
pub use stream::StreamTransport;
pub use traits::{Transport, TransportError};
