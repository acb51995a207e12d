//! Data model shared by the transport, the workers and the controller

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB interface class code for Human Interface Devices
pub const USB_CLASS_HID: u8 = 0x03;

/// Connection lifecycle state of a [`crate::ConnectionController`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Uninitialized,
    PermissionRequesting,
    FailedInitialize,
    Working,
}

impl ConnectionState {
    /// States from which an open or attach runs discovery again
    pub fn can_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Uninitialized | ConnectionState::FailedInitialize
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::PermissionRequesting => "permission requesting",
            ConnectionState::FailedInitialize => "failed to initialize",
            ConnectionState::Working => "working",
        };
        f.write_str(name)
    }
}

/// A physical device found by enumeration
///
/// `bus_number` and `address` form the opaque handle the transport uses to
/// find the device again; they are stable until the device is unplugged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceDescriptor {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Whether `other` refers to the same physical device
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        self.bus_number == other.bus_number
            && self.address == other.address
            && self.matches(other.vendor_id, other.product_id)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} device {:03})",
            self.vendor_id, self.product_id, self.bus_number, self.address
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
}

impl EndpointDescriptor {
    /// Endpoints the port can stream over: bulk or interrupt in `direction`
    pub fn is_stream(&self, direction: Direction) -> bool {
        self.direction == direction
            && matches!(self.kind, TransferKind::Bulk | TransferKind::Interrupt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Hot-plug notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Attached(DeviceDescriptor),
    Detached(DeviceDescriptor),
}

/// Render a byte buffer as `[0x01, 0x00]` for log output
pub fn hex_bytes(data: &[u8]) -> String {
    let parts: Vec<String> = data.iter().map(|b| format!("{:#04x}", b)).collect();
    format!("[{}]", parts.join(", "))
}
