//! Transport abstraction
//!
//! The controller never talks to a USB host stack directly. Everything it
//! needs from one (enumeration, consent, interface claiming, timed
//! transfers and hot-plug notifications) goes through these traits, so the
//! same state machine drives libusb ([`crate::usb::RusbTransport`]) or a
//! scripted mock in tests.

use crate::types::{DeviceDescriptor, EndpointDescriptor, HotplugEvent, InterfaceDescriptor};
use common::Result;
use std::sync::Arc;
use std::time::Duration;

/// Receives the outcome of a permission request: `true` when granted
pub type PermissionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Receives hot-plug notifications, possibly on a transport-owned thread
pub type HotplugHandler = Arc<dyn Fn(HotplugEvent) + Send + Sync + 'static>;

/// USB host-stack capability
pub trait Transport: Send + Sync {
    /// List every device currently visible to the host
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a connection to `device`
    ///
    /// `Ok(None)` means the device exists but access requires consent;
    /// the caller should go through [`Transport::request_permission`].
    fn open_connection(&self, device: &DeviceDescriptor) -> Result<Option<Box<dyn Connection>>>;

    /// Ask for access to `device`
    ///
    /// Must return without waiting for the outcome; `on_result` is invoked
    /// exactly once, from any thread.
    fn request_permission(&self, device: &DeviceDescriptor, on_result: PermissionCallback);

    /// Start delivering attach/detach notifications to `handler`
    ///
    /// Notifications stop when the returned guard is dropped.
    fn watch_hotplug(&self, handler: HotplugHandler) -> Result<Box<dyn HotplugWatch>>;
}

/// An open connection to one device
///
/// Read-direction and write-direction transfers are issued concurrently
/// from different threads and must not interfere with each other.
pub trait Connection: Send + Sync {
    /// Interfaces of the active configuration
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>>;

    fn claim_interface(&self, interface: u8) -> Result<()>;

    fn release_interface(&self, interface: u8) -> Result<()>;

    /// Blocking IN transfer; returns the number of bytes placed in `buf`
    ///
    /// A timeout with nothing to read is reported as `Ok(0)`.
    fn read(&self, endpoint: &EndpointDescriptor, buf: &mut [u8], timeout: Duration)
    -> Result<usize>;

    /// Blocking OUT transfer; returns the number of bytes accepted
    fn write(&self, endpoint: &EndpointDescriptor, data: &[u8], timeout: Duration)
    -> Result<usize>;

    /// Close the connection. Called at most once, after interfaces are released.
    fn close(&self);
}

/// Registration guard for hot-plug notifications
pub trait HotplugWatch: Send {}
