//! USB HID connection management
//!
//! This crate keeps one logical connection to a USB HID device identified
//! by vendor and product id. It discovers the device, obtains access,
//! claims the HID interface and runs two worker threads over it: one
//! delivering inbound reports, one draining a FIFO of outbound buffers with
//! optional coalescing and per-item retry. Hot-plug events reconnect and
//! disconnect automatically.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use usbhid::test_utils::MockTransport;
//! use usbhid::{ConnectionController, ConnectionState, IoSettings, create_event_channel};
//!
//! let transport = Arc::new(MockTransport::with_device());
//! let (listener, _events) = create_event_channel(64);
//!
//! let controller = ConnectionController::new(
//!     transport,
//!     0x1234,
//!     0x0006,
//!     IoSettings::default(),
//!     Arc::new(listener),
//! )
//! .unwrap();
//!
//! assert_eq!(controller.open(), ConnectionState::Working);
//! controller.write(vec![1, 0, 1, 0], None).unwrap();
//! controller.close();
//! ```
//!
//! Real hardware goes through [`usb::RusbTransport`].

pub mod controller;
pub mod listener;
pub mod port;
pub mod read_worker;
pub mod settings;
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod usb;
pub mod worker;
pub mod write_worker;

pub use controller::ConnectionController;
pub use listener::{EventChannel, HidEvent, HidListener, NoopListener, create_event_channel};
pub use port::Port;
pub use read_worker::ReadWorker;
pub use settings::{IoSettings, SharedSettings};
pub use transport::{Connection, HotplugHandler, HotplugWatch, PermissionCallback, Transport};
pub use types::{
    ConnectionState, DeviceDescriptor, Direction, EndpointDescriptor, HotplugEvent,
    InterfaceDescriptor, TransferKind, USB_CLASS_HID, hex_bytes,
};
pub use worker::RunState;
pub use write_worker::{WriteItem, WriteWorker};
