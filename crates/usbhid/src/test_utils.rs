//! Test utilities for usbhid
//!
//! Provides a scripted in-memory transport and helpers shared by the unit
//! and integration tests.
//!
//! # Example
//!
//! ```
//! use usbhid::test_utils::{MockTransport, mock_device};
//! use usbhid::Transport;
//!
//! let transport = MockTransport::new();
//! transport.add_device(mock_device());
//! assert_eq!(transport.enumerate_devices().unwrap().len(), 1);
//! ```

use crate::listener::HidListener;
use crate::transport::{
    Connection, HotplugHandler, HotplugWatch, PermissionCallback, Transport,
};
use crate::types::{
    ConnectionState, DeviceDescriptor, Direction, EndpointDescriptor, HotplugEvent,
    InterfaceDescriptor, TransferKind, USB_CLASS_HID,
};
use common::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on how long a mock read blocks when nothing is queued
const MOCK_READ_BLOCK: Duration = Duration::from_millis(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The device the sample firmware enumerates as (0x1234:0x0006)
pub fn mock_device() -> DeviceDescriptor {
    mock_device_with(0x1234, 0x0006, 1, 4)
}

pub fn mock_device_with(
    vendor_id: u16,
    product_id: u16,
    bus_number: u8,
    address: u8,
) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        bus_number,
        address,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some("Test HID".to_string()),
    }
}

pub fn stream_endpoint(address: u8, direction: Direction, kind: TransferKind) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        direction,
        kind,
    }
}

/// HID interface with an interrupt IN (0x81) and interrupt OUT (0x01) endpoint
pub fn hid_interface(number: u8) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        class_code: USB_CLASS_HID,
        endpoints: vec![
            stream_endpoint(0x81, Direction::In, TransferKind::Interrupt),
            stream_endpoint(0x01, Direction::Out, TransferKind::Interrupt),
        ],
    }
}

/// Shared view into a [`MockConnection`] for scripting and assertions
#[derive(Debug, Default)]
pub struct ConnectionProbe {
    claimed: Mutex<Vec<u8>>,
    fail_claim: AtomicBool,
    release_count: AtomicUsize,
    close_count: AtomicUsize,
    accept_nothing: AtomicBool,
    write_failures: AtomicUsize,
    write_attempts: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<VecDeque<Option<Vec<u8>>>>,
    read_count: AtomicUsize,
    transfers_after_close: AtomicUsize,
}

impl ConnectionProbe {
    pub fn claimed(&self) -> Vec<u8> {
        lock(&self.claimed).clone()
    }

    pub fn fail_claim(&self) {
        self.fail_claim.store(true, Ordering::SeqCst);
    }

    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Make every write report zero bytes transferred
    pub fn accept_nothing(&self) {
        self.accept_nothing.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` write transfers
    pub fn fail_next_writes(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Buffers that reached the OUT endpoint, in transfer order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    /// Queue bytes for the next read
    pub fn push_inbound(&self, data: Vec<u8>) {
        lock(&self.inbound).push_back(Some(data));
    }

    /// Make the next read fail
    pub fn push_read_error(&self) {
        lock(&self.inbound).push_back(None);
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Reads and writes attempted after the connection was closed
    pub fn transfers_after_close(&self) -> usize {
        self.transfers_after_close.load(Ordering::SeqCst)
    }

    fn note_transfer(&self) {
        if self.close_count() > 0 {
            self.transfers_after_close.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// In-memory [`Connection`]
pub struct MockConnection {
    interfaces: Vec<InterfaceDescriptor>,
    probe: Arc<ConnectionProbe>,
}

impl MockConnection {
    /// Connection exposing a single HID interface
    pub fn new() -> Self {
        Self::with_interfaces(vec![hid_interface(0)])
    }

    pub fn with_interfaces(interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            interfaces,
            probe: Arc::new(ConnectionProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<ConnectionProbe> {
        Arc::clone(&self.probe)
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        Ok(self.interfaces.clone())
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        if self.probe.fail_claim.load(Ordering::SeqCst) {
            return Err(Error::Usb("resource busy".to_string()));
        }
        lock(&self.probe.claimed).push(interface);
        Ok(())
    }

    fn release_interface(&self, _interface: u8) -> Result<()> {
        self.probe.release_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(
        &self,
        _endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.probe.note_transfer();
        self.probe.read_count.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.probe.inbound).pop_front();
        match next {
            Some(Some(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(None) => Err(Error::Usb("scripted read failure".to_string())),
            None => {
                std::thread::sleep(timeout.min(MOCK_READ_BLOCK));
                Ok(0)
            }
        }
    }

    fn write(&self, _endpoint: &EndpointDescriptor, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.probe.note_transfer();
        self.probe.write_attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .probe
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Usb("scripted write failure".to_string()));
        }
        if self.probe.accept_nothing.load(Ordering::SeqCst) {
            return Ok(0);
        }
        lock(&self.probe.writes).push(data.to_vec());
        Ok(data.len())
    }

    fn close(&self) {
        self.probe.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// How the mock answers a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Grant,
    Deny,
    /// Keep the request pending until [`MockTransport::resolve_permission`]
    Hold,
}

struct MockState {
    devices: Mutex<Vec<DeviceDescriptor>>,
    interfaces: Mutex<Vec<InterfaceDescriptor>>,
    access_granted: AtomicBool,
    fail_open: AtomicBool,
    permission_outcome: Mutex<PermissionOutcome>,
    pending_permission: Mutex<Option<PermissionCallback>>,
    hotplug: Mutex<Option<HotplugHandler>>,
    probes: Mutex<Vec<Arc<ConnectionProbe>>>,
    enumerate_count: AtomicUsize,
    open_count: AtomicUsize,
    permission_requests: AtomicUsize,
    unwatch_count: AtomicUsize,
}

/// Scripted [`Transport`]
///
/// Cloning shares the underlying state, so a test can keep a handle while
/// the controller owns another.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Transport with no devices, access pre-granted
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                devices: Mutex::new(Vec::new()),
                interfaces: Mutex::new(vec![hid_interface(0)]),
                access_granted: AtomicBool::new(true),
                fail_open: AtomicBool::new(false),
                permission_outcome: Mutex::new(PermissionOutcome::Grant),
                pending_permission: Mutex::new(None),
                hotplug: Mutex::new(None),
                probes: Mutex::new(Vec::new()),
                enumerate_count: AtomicUsize::new(0),
                open_count: AtomicUsize::new(0),
                permission_requests: AtomicUsize::new(0),
                unwatch_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Transport with the sample device present and access pre-granted
    pub fn with_device() -> Self {
        let transport = Self::new();
        transport.add_device(mock_device());
        transport
    }

    pub fn add_device(&self, device: DeviceDescriptor) {
        lock(&self.state.devices).push(device);
    }

    pub fn remove_device(&self, device: &DeviceDescriptor) {
        lock(&self.state.devices).retain(|d| !d.same_device(device));
    }

    /// Interfaces reported by connections opened from now on
    pub fn set_interfaces(&self, interfaces: Vec<InterfaceDescriptor>) {
        *lock(&self.state.interfaces) = interfaces;
    }

    /// Whether opening succeeds without asking for permission first
    pub fn set_access_granted(&self, granted: bool) {
        self.state.access_granted.store(granted, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_permission_outcome(&self, outcome: PermissionOutcome) {
        *lock(&self.state.permission_outcome) = outcome;
    }

    /// Answer a request held by [`PermissionOutcome::Hold`]
    ///
    /// Returns false when no request is pending.
    pub fn resolve_permission(&self, granted: bool) -> bool {
        let callback = lock(&self.state.pending_permission).take();
        match callback {
            Some(callback) => {
                if granted {
                    self.set_access_granted(true);
                }
                callback(granted);
                true
            }
            None => false,
        }
    }

    pub fn has_pending_permission(&self) -> bool {
        lock(&self.state.pending_permission).is_some()
    }

    /// Add `device` and deliver an attach notification
    pub fn attach(&self, device: DeviceDescriptor) {
        self.add_device(device.clone());
        self.emit(HotplugEvent::Attached(device));
    }

    /// Remove `device` and deliver a detach notification
    pub fn detach(&self, device: DeviceDescriptor) {
        self.remove_device(&device);
        self.emit(HotplugEvent::Detached(device));
    }

    fn emit(&self, event: HotplugEvent) {
        let handler = lock(&self.state.hotplug).clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn is_watching_hotplug(&self) -> bool {
        lock(&self.state.hotplug).is_some()
    }

    pub fn unwatch_count(&self) -> usize {
        self.state.unwatch_count.load(Ordering::SeqCst)
    }

    pub fn enumerate_count(&self) -> usize {
        self.state.enumerate_count.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.state.open_count.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.state.permission_requests.load(Ordering::SeqCst)
    }

    /// Probes of every connection handed out, oldest first
    pub fn probes(&self) -> Vec<Arc<ConnectionProbe>> {
        lock(&self.state.probes).clone()
    }

    pub fn last_probe(&self) -> Option<Arc<ConnectionProbe>> {
        lock(&self.state.probes).last().cloned()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.state.enumerate_count.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.state.devices).clone())
    }

    fn open_connection(&self, device: &DeviceDescriptor) -> Result<Option<Box<dyn Connection>>> {
        self.state.open_count.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Usb("scripted open failure".to_string()));
        }
        if !lock(&self.state.devices).iter().any(|d| d.same_device(device)) {
            return Err(Error::NoDevice);
        }
        if !self.state.access_granted.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let connection = MockConnection::with_interfaces(lock(&self.state.interfaces).clone());
        lock(&self.state.probes).push(connection.probe());
        Ok(Some(Box::new(connection)))
    }

    fn request_permission(&self, _device: &DeviceDescriptor, on_result: PermissionCallback) {
        self.state.permission_requests.fetch_add(1, Ordering::SeqCst);
        let outcome = *lock(&self.state.permission_outcome);
        match outcome {
            PermissionOutcome::Hold => {
                *lock(&self.state.pending_permission) = Some(on_result);
            }
            PermissionOutcome::Grant | PermissionOutcome::Deny => {
                let granted = outcome == PermissionOutcome::Grant;
                if granted {
                    self.set_access_granted(true);
                }
                std::thread::spawn(move || on_result(granted));
            }
        }
    }

    fn watch_hotplug(&self, handler: HotplugHandler) -> Result<Box<dyn HotplugWatch>> {
        *lock(&self.state.hotplug) = Some(handler);
        Ok(Box::new(MockHotplugWatch {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockHotplugWatch {
    state: Arc<MockState>,
}

impl HotplugWatch for MockHotplugWatch {}

impl Drop for MockHotplugWatch {
    fn drop(&mut self) {
        *lock(&self.state.hotplug) = None;
        self.state.unwatch_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Listener that records every notification
#[derive(Debug, Default)]
pub struct RecordingListener {
    data: Mutex<Vec<Vec<u8>>>,
    errors: Mutex<Vec<String>>,
    states: Mutex<Vec<ConnectionState>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self) -> Vec<Vec<u8>> {
        lock(&self.data).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        lock(&self.states).clone()
    }
}

impl HidListener for RecordingListener {
    fn on_new_data(&self, data: Vec<u8>) {
        lock(&self.data).push(data);
    }

    fn on_run_error(&self, error: Error) {
        lock(&self.errors).push(error.to_string());
    }

    fn on_state_changed(&self, state: ConnectionState) {
        lock(&self.states).push(state);
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
