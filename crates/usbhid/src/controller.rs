//! Connection lifecycle
//!
//! [`ConnectionController`] finds the configured device, obtains access,
//! builds the [`Port`] and runs the read and write workers over it. It also
//! reacts to hot-plug events for as long as it is open.
//!
//! Two locks guard the controller. The transition lock is held for the
//! whole of every state transition, including the listener notification,
//! so transitions and their notifications never interleave. The core lock
//! protects the fields and is only held briefly; [`ConnectionController::write`]
//! needs nothing else, so listeners may write from their callbacks.
//!
//! Hot-plug and permission callbacks never touch controller state
//! directly. They post a [`ControllerEvent`] to a channel drained by the
//! `usbhid-events` thread, which lives from `open()` to `close()`.

use crate::listener::HidListener;
use crate::port::Port;
use crate::read_worker::ReadWorker;
use crate::settings::{IoSettings, SharedSettings};
use crate::transport::{Connection, HotplugWatch, Transport};
use crate::types::{ConnectionState, DeviceDescriptor, HotplugEvent};
use crate::write_worker::WriteWorker;
use async_channel::{Receiver, Sender, unbounded};
use common::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
enum ControllerEvent {
    Hotplug(HotplugEvent),
    Permission { generation: u64, granted: bool },
    Shutdown,
}

struct EventLoop {
    tx: Sender<ControllerEvent>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    fn shutdown(mut self) {
        let _ = self.tx.try_send(ControllerEvent::Shutdown);
        if let Some(handle) = self.thread.take() {
            // Closing from a callback on the event thread itself must not join.
            if handle.thread().id() != std::thread::current().id()
                && handle.join().is_err()
            {
                error!("Controller event thread panicked");
            }
        }
    }
}

struct Core {
    state: ConnectionState,
    device: Option<DeviceDescriptor>,
    port: Option<Arc<Port>>,
    /// A port whose workers outlived `stop_timeout`; it closes when they exit
    retired_port: Option<Weak<Port>>,
    reader: Option<ReadWorker>,
    writer: Option<Arc<WriteWorker>>,
    hotplug: Option<Box<dyn HotplugWatch>>,
    events: Option<EventLoop>,
    permission_generation: u64,
    permission_pending: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    vendor_id: u16,
    product_id: u16,
    settings: Arc<SharedSettings>,
    listener: Arc<dyn HidListener>,
    transition: Mutex<()>,
    core: Mutex<Core>,
}

/// Manages one logical connection to a USB HID device
pub struct ConnectionController {
    shared: Arc<Shared>,
}

impl ConnectionController {
    /// Create a controller for the device with the given vendor and product id
    pub fn new(
        transport: Arc<dyn Transport>,
        vendor_id: u16,
        product_id: u16,
        settings: IoSettings,
        listener: Arc<dyn HidListener>,
    ) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                vendor_id,
                product_id,
                settings: Arc::new(SharedSettings::new(settings)),
                listener,
                transition: Mutex::new(()),
                core: Mutex::new(Core {
                    state: ConnectionState::Uninitialized,
                    device: None,
                    port: None,
                    retired_port: None,
                    reader: None,
                    writer: None,
                    hotplug: None,
                    events: None,
                    permission_generation: 0,
                    permission_pending: false,
                }),
            }),
        })
    }

    /// Start watching for the device and try to connect to it
    ///
    /// Returns the state reached synchronously. From `PermissionRequesting`
    /// the outcome arrives later through `on_state_changed`. Calling this
    /// while `Working` or `PermissionRequesting` changes nothing.
    pub fn open(&self) -> ConnectionState {
        let _transition = self.shared.transition();

        if let Err(e) = self.shared.ensure_event_loop() {
            error!("Failed to start controller event loop: {}", e);
            self.shared.listener.on_run_error(e);
            self.shared.set_state(ConnectionState::FailedInitialize);
            return ConnectionState::FailedInitialize;
        }

        let current = self.shared.state();
        if !current.can_connect() {
            debug!("Already {}, not reconnecting", current);
            return current;
        }

        let next = self.shared.connect();
        self.shared.set_state(next);
        next
    }

    /// Disconnect and stop watching for the device
    ///
    /// Must not be called from a listener callback.
    pub fn close(&self) {
        let events = {
            let _transition = self.shared.transition();
            self.shared.disconnect();

            let (hotplug, events) = {
                let mut core = self.shared.core();
                core.permission_pending = false;
                core.permission_generation += 1;
                (core.hotplug.take(), core.events.take())
            };
            drop(hotplug);

            self.shared.set_state(ConnectionState::Uninitialized);
            events
        };

        if let Some(events) = events {
            events.shutdown();
        }
    }

    /// Queue `data` for the device
    ///
    /// `retry` overrides the configured default retry count for this buffer.
    pub fn write(&self, data: impl Into<Vec<u8>>, retry: Option<u32>) -> Result<()> {
        let writer = self.shared.core().writer.clone();
        match writer {
            Some(writer) => {
                writer.write_async(data.into(), retry);
                Ok(())
            }
            None => {
                warn!("Failed to write data to USB HID because the connection isn't open");
                Err(Error::NotOpen)
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The device currently selected, if any
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.shared.core().device.clone()
    }

    pub fn settings(&self) -> IoSettings {
        self.shared.settings.snapshot()
    }

    /// Change I/O settings; running workers pick them up on their next cycle
    pub fn update_settings<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut IoSettings),
    {
        self.shared.settings.update(f)
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn transition(&self) -> MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.core().state
    }

    /// Record `next` and notify the listener if it differs
    ///
    /// Callers hold the transition lock.
    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut core = self.core();
            std::mem::replace(&mut core.state, next)
        };
        if previous != next {
            info!("State changed: {} -> {}", previous, next);
            self.listener.on_state_changed(next);
        }
    }

    /// Register for hot-plug events and start the event thread once per open
    fn ensure_event_loop(self: &Arc<Self>) -> Result<()> {
        if self.core().events.is_some() {
            return Ok(());
        }

        let (tx, rx) = unbounded();
        let weak = Arc::downgrade(self);
        let thread = std::thread::Builder::new()
            .name("usbhid-events".to_string())
            .spawn(move || run_event_loop(weak, rx))?;

        let hotplug_tx = tx.clone();
        let watch = self.transport.watch_hotplug(Arc::new(move |event: HotplugEvent| {
            let _ = hotplug_tx.try_send(ControllerEvent::Hotplug(event));
        }));
        let hotplug = match watch {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!("Hot-plug notifications unavailable: {}", e);
                None
            }
        };

        let mut core = self.core();
        core.hotplug = hotplug;
        core.events = Some(EventLoop {
            tx,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Whether a port from an earlier connection is still waiting to close
    fn retired_port_alive(&self) -> bool {
        let mut core = self.core();
        let alive = core
            .retired_port
            .as_ref()
            .is_some_and(|port| port.strong_count() > 0);
        if !alive {
            core.retired_port = None;
        }
        alive
    }

    /// Discover the device and open it, asking for permission if needed
    fn connect(&self) -> ConnectionState {
        if self.retired_port_alive() {
            warn!("Previous port is still in use by its workers, not connecting");
            return ConnectionState::FailedInitialize;
        }

        let devices = match self.transport.enumerate_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return ConnectionState::FailedInitialize;
            }
        };

        let found: Vec<DeviceDescriptor> = devices
            .into_iter()
            .filter(|d| d.matches(self.vendor_id, self.product_id))
            .collect();

        let Some(device) = found.first().cloned() else {
            let missing = Error::DeviceNotFound {
                vendor_id: self.vendor_id,
                product_id: self.product_id,
            };
            debug!("{}", missing);
            return ConnectionState::FailedInitialize;
        };

        debug!("Found {} device(s)", found.len());
        for (i, candidate) in found.iter().enumerate() {
            debug!(
                "  {}: {} manufacturer={:?} product={:?}",
                i + 1,
                candidate,
                candidate.manufacturer,
                candidate.product
            );
        }
        if found.len() > 1 {
            info!("Multiple matching devices, using the first one");
        }

        info!("Connecting to {}", device);
        self.core().device = Some(device.clone());

        match self.transport.open_connection(&device) {
            Ok(Some(connection)) => self.init_port(device, connection),
            Ok(None) => self.request_permission(&device),
            Err(e) => {
                warn!("Failed to open {}: {}", device, e);
                ConnectionState::FailedInitialize
            }
        }
    }

    fn request_permission(&self, device: &DeviceDescriptor) -> ConnectionState {
        let (generation, tx) = {
            let mut core = self.core();
            let Some(events) = core.events.as_ref() else {
                warn!("Cannot request permission without an event loop");
                return ConnectionState::FailedInitialize;
            };
            let tx = events.tx.clone();
            core.permission_generation += 1;
            core.permission_pending = true;
            (core.permission_generation, tx)
        };

        info!("Requesting permission to access {}", device);
        self.transport.request_permission(
            device,
            Box::new(move |granted| {
                let _ = tx.try_send(ControllerEvent::Permission {
                    generation,
                    granted,
                });
            }),
        );
        ConnectionState::PermissionRequesting
    }

    /// Build the port on `connection` and start both workers
    fn init_port(
        &self,
        device: DeviceDescriptor,
        connection: Box<dyn Connection>,
    ) -> ConnectionState {
        let port = match Port::create(device, connection) {
            Ok(port) => Arc::new(port),
            Err(e) => {
                warn!("Couldn't initialize port: {}", e);
                return ConnectionState::FailedInitialize;
            }
        };

        let reader = ReadWorker::new(
            Arc::clone(&port),
            Arc::clone(&self.settings),
            Arc::clone(&self.listener),
        );
        let writer = Arc::new(WriteWorker::new(
            Arc::clone(&port),
            Arc::clone(&self.settings),
            Arc::clone(&self.listener),
        ));

        let started = reader.start().and_then(|()| writer.start());
        if let Err(e) = started {
            error!("Failed to start I/O workers: {}", e);
            reader.stop();
            writer.stop();
            let timeout = self.settings.snapshot().stop_timeout();
            if reader.wait_stopped(timeout) && writer.wait_stopped(timeout) {
                port.close();
            }
            self.listener.on_run_error(e);
            return ConnectionState::FailedInitialize;
        }

        let mut core = self.core();
        core.port = Some(port);
        core.reader = Some(reader);
        core.writer = Some(writer);
        ConnectionState::Working
    }

    /// Stop the workers, close the port and forget the device
    ///
    /// The port is closed only after both workers report stopped. If they do
    /// not stop in time the close happens when the last worker lets go of it.
    fn disconnect(&self) {
        let (reader, writer, port) = {
            let mut core = self.core();
            core.device = None;
            (core.reader.take(), core.writer.take(), core.port.take())
        };

        if reader.is_none() {
            debug!("No read worker to stop");
        }
        if writer.is_none() {
            debug!("No write worker to stop");
        }

        if let Some(reader) = &reader {
            reader.stop();
        }
        if let Some(writer) = &writer {
            writer.stop();
        }

        let timeout = self.settings.snapshot().stop_timeout();
        let reader_stopped = reader.as_ref().is_none_or(|r| r.wait_stopped(timeout));
        let writer_stopped = writer.as_ref().is_none_or(|w| w.wait_stopped(timeout));

        if let Some(port) = port {
            if reader_stopped && writer_stopped {
                port.close();
            } else {
                warn!(
                    "I/O workers did not stop within {:?}; port closes once they exit",
                    timeout
                );
                self.core().retired_port = Some(Arc::downgrade(&port));
            }
        }
    }

    fn handle_event(&self, event: ControllerEvent) {
        let _transition = self.transition();

        // Events queued before close() must not reconnect a closed controller.
        if self.core().events.is_none() {
            debug!("Controller closed, dropping {:?}", event);
            return;
        }

        match event {
            ControllerEvent::Hotplug(HotplugEvent::Attached(device)) => {
                self.on_attached(device)
            }
            ControllerEvent::Hotplug(HotplugEvent::Detached(device)) => {
                self.on_detached(device)
            }
            ControllerEvent::Permission {
                generation,
                granted,
            } => self.on_permission_result(generation, granted),
            ControllerEvent::Shutdown => {}
        }
    }

    fn on_attached(&self, device: DeviceDescriptor) {
        if !device.matches(self.vendor_id, self.product_id) {
            debug!("Ignoring attach of unrelated device {}", device);
            return;
        }

        let state = self.state();
        debug!("USB device attached: {} (state {})", device, state);
        if state.can_connect() {
            let next = self.connect();
            self.set_state(next);
        }
    }

    fn on_detached(&self, device: DeviceDescriptor) {
        let (state, ours) = {
            let core = self.core();
            let ours = core
                .device
                .as_ref()
                .is_some_and(|current| current.same_device(&device));
            (core.state, ours)
        };

        debug!("USB device detached: {} (state {})", device, state);
        if state == ConnectionState::Working && ours {
            self.disconnect();
            self.set_state(ConnectionState::Uninitialized);
        }
    }

    fn on_permission_result(&self, generation: u64, granted: bool) {
        let device = {
            let mut core = self.core();
            if !core.permission_pending
                || core.permission_generation != generation
                || core.state != ConnectionState::PermissionRequesting
            {
                debug!("Ignoring stale permission result (generation {})", generation);
                return;
            }
            core.permission_pending = false;
            core.device.clone()
        };

        if !granted {
            info!(
                "Couldn't obtain connecting permission to {}",
                device.as_ref().map(ToString::to_string).unwrap_or_default()
            );
            self.set_state(ConnectionState::FailedInitialize);
            return;
        }

        let Some(device) = device else {
            warn!("Permission granted but no device is selected");
            self.set_state(ConnectionState::FailedInitialize);
            return;
        };

        let next = match self.transport.open_connection(&device) {
            Ok(Some(connection)) => self.init_port(device, connection),
            Ok(None) => {
                warn!("Failed to connect {} after permission was granted", device);
                ConnectionState::FailedInitialize
            }
            Err(e) => {
                warn!("Failed to connect {}: {}", device, e);
                ConnectionState::FailedInitialize
            }
        };
        self.set_state(next);
    }
}

fn run_event_loop(shared: Weak<Shared>, rx: Receiver<ControllerEvent>) {
    debug!("Controller event loop started");

    while let Ok(event) = rx.recv_blocking() {
        if matches!(event, ControllerEvent::Shutdown) {
            break;
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_event(event);
    }

    debug!("Controller event loop stopped");
}
