//! Device discovery and hot-plug over libusb

use super::connection::RusbConnection;
use super::map_rusb_error;
use crate::transport::{Connection, HotplugHandler, HotplugWatch, PermissionCallback, Transport};
use crate::types::{DeviceDescriptor, HotplugEvent};
use common::{Error, Result};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long one `handle_events()` call may block on the hot-plug thread
const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// [`Transport`] backed by a libusb context
#[derive(Clone)]
pub struct RusbTransport {
    context: Context,
}

impl RusbTransport {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }

    fn find_device(&self, device: &DeviceDescriptor) -> Result<Device<Context>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == device.bus_number && d.address() == device.address)
            .ok_or(Error::NoDevice)
    }
}

/// Describe `device`, reading its strings when it can be opened
fn describe(device: &Device<Context>) -> Result<DeviceDescriptor> {
    let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

    let (manufacturer, product) = match device.open() {
        Ok(handle) => (
            descriptor
                .manufacturer_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
            descriptor
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
        ),
        Err(_) => (None, None),
    };

    Ok(DeviceDescriptor {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        address: device.address(),
        manufacturer,
        product,
    })
}

/// Describe a device that may already be gone; no strings are read
fn describe_quick(device: &Device<Context>) -> Option<DeviceDescriptor> {
    let descriptor = device.device_descriptor().ok()?;
    Some(DeviceDescriptor {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        address: device.address(),
        manufacturer: None,
        product: None,
    })
}

impl Transport for RusbTransport {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;

        let mut found = Vec::new();
        for device in devices.iter() {
            match describe(&device) {
                Ok(descriptor) => found.push(descriptor),
                Err(e) => warn!(
                    "Failed to read descriptor of bus {:03} device {:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        debug!("Enumerated {} USB devices", found.len());
        Ok(found)
    }

    fn open_connection(&self, device: &DeviceDescriptor) -> Result<Option<Box<dyn Connection>>> {
        let usb_device = self.find_device(device)?;
        match usb_device.open() {
            Ok(handle) => Ok(Some(Box::new(RusbConnection::new(usb_device, handle)))),
            Err(rusb::Error::Access) => {
                debug!("No access to {}", device);
                Ok(None)
            }
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    /// libusb has no interactive grant, so the request re-probes access on a
    /// helper thread and reports what it finds.
    fn request_permission(&self, device: &DeviceDescriptor, on_result: PermissionCallback) {
        let transport = self.clone();
        let device = device.clone();

        answer_permission(
            |job| {
                std::thread::Builder::new()
                    .name("usbhid-permission".to_string())
                    .spawn(job)
                    .map(drop)
            },
            move || {
                let granted = match transport.find_device(&device) {
                    Ok(usb_device) => usb_device.open().is_ok(),
                    Err(_) => false,
                };
                if !granted {
                    info!(
                        "Access to {} denied; check udev rules or run with elevated privileges",
                        device
                    );
                }
                granted
            },
            on_result,
        );
    }

    fn watch_hotplug(&self, handler: HotplugHandler) -> Result<Box<dyn HotplugWatch>> {
        if !rusb::has_hotplug() {
            return Err(Error::HotplugUnsupported);
        }

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { handler }))
            .map_err(map_rusb_error)?;

        let running = Arc::new(AtomicBool::new(true));
        let context = self.context.clone();
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("usbhid-hotplug".to_string())
            .spawn(move || run_event_pump(&context, &flag))?;

        debug!("Hot-plug callbacks registered");
        Ok(Box::new(RusbHotplugWatch {
            registration: Some(registration),
            running,
            thread: Some(thread),
        }))
    }
}

fn run_event_pump(context: &Context, running: &AtomicBool) {
    debug!("Hot-plug event thread started");
    while running.load(Ordering::SeqCst) {
        match context.handle_events(Some(EVENT_POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_TIMEOUT);
            }
        }
    }
    debug!("Hot-plug event thread stopped");
}

struct HotplugForwarder {
    handler: HotplugHandler,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some(descriptor) = describe_quick(&device) {
            (self.handler)(HotplugEvent::Attached(descriptor));
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some(descriptor) = describe_quick(&device) {
            (self.handler)(HotplugEvent::Detached(descriptor));
        }
    }
}

/// Deregisters the callback and stops the event thread when dropped
struct RusbHotplugWatch {
    registration: Option<Registration<Context>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatch for RusbHotplugWatch {}

impl Drop for RusbHotplugWatch {
    fn drop(&mut self) {
        drop(self.registration.take());
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Hot-plug event thread panicked");
        }
        debug!("Hot-plug callbacks deregistered");
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Hand `check` to `spawn` and pass its answer to `on_result`
///
/// If `spawn` fails the request is answered with `false` on the calling
/// thread, so `on_result` always runs exactly once.
fn answer_permission<S, P>(spawn: S, check: P, on_result: PermissionCallback)
where
    S: FnOnce(Job) -> std::io::Result<()>,
    P: FnOnce() -> bool + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(on_result)));
    let job_slot = Arc::clone(&slot);

    let spawned = spawn(Box::new(move || {
        let granted = check();
        let callback = job_slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(callback) = callback {
            callback(granted);
        }
    }));

    if let Err(e) = spawned {
        warn!("Failed to spawn permission check thread: {}", e);
        let callback = slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(callback) = callback {
            callback(false);
        }
    }
}
