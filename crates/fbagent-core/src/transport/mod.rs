//! Transport layer module.

pub mod descriptors;
pub mod hub;
pub mod mock;
pub mod tcp;
pub mod traits;
pub mod usb;

pub use hub::{HubConfig, TransportHub};
pub use mock::MockTransport;
pub use tcp::TcpTransport;
pub use traits::{Transport, TransportError, TransportKind};
pub use usb::{FunctionFs, UsbFunctionDevice, UsbLink};
