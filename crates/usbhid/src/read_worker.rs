//! Inbound data loop
//!
//! Polls the port's IN endpoint on a dedicated thread and hands every
//! non-empty read to the listener on that thread.

use crate::listener::HidListener;
use crate::port::Port;
use crate::settings::SharedSettings;
use crate::worker::{RunState, RunStateCell, panic_message};
use common::{Error, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

const NAME: &str = "read";

pub struct ReadWorker {
    port: Arc<Port>,
    settings: Arc<SharedSettings>,
    listener: Arc<dyn HidListener>,
    state: Arc<RunStateCell>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReadWorker {
    pub fn new(
        port: Arc<Port>,
        settings: Arc<SharedSettings>,
        listener: Arc<dyn HidListener>,
    ) -> Self {
        Self {
            port,
            settings,
            listener,
            state: Arc::new(RunStateCell::new(NAME)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the read thread
    pub fn start(&self) -> Result<()> {
        self.state.start()?;

        let port = Arc::clone(&self.port);
        let settings = Arc::clone(&self.settings);
        let listener = Arc::clone(&self.listener);
        let state = Arc::clone(&self.state);

        let spawned = std::thread::Builder::new()
            .name("usbhid-read".to_string())
            .spawn(move || run(&port, &settings, listener.as_ref(), &state));

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.finish();
                Err(Error::Io(e))
            }
        }
    }

    /// Ask the loop to exit; returns immediately
    pub fn stop(&self) {
        self.state.request_stop();
    }

    pub fn run_state(&self) -> RunState {
        self.state.get()
    }

    /// Wait for the loop to exit and reap the thread; false on timeout
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        if !self.state.wait_stopped(timeout) {
            return false;
        }
        let handle = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        true
    }
}

fn run(port: &Port, settings: &SharedSettings, listener: &dyn HidListener, state: &RunStateCell) {
    debug!("Read worker started on {}", port.device());

    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut buffer = vec![0u8; settings.snapshot().read_buffer_size];

        while state.is_running() {
            let current = settings.snapshot();
            if buffer.len() != current.read_buffer_size {
                buffer = vec![0u8; current.read_buffer_size];
            }

            read_once(port, &mut buffer, current.read_timeout(), listener);

            if !state.is_running() {
                break;
            }
            state.idle(current.read_poll_interval());
        }
    }));

    if let Err(payload) = result {
        let message = panic_message(payload.as_ref());
        error!("Read worker terminated: {}", message);
        listener.on_run_error(Error::WorkerPanicked {
            worker: NAME,
            message,
        });
    }

    state.finish();
    debug!("Read worker exited");
}

fn read_once(port: &Port, buffer: &mut [u8], timeout: Duration, listener: &dyn HidListener) {
    match port.read(buffer, timeout) {
        Ok(0) => {}
        Ok(length) => listener.on_new_data(buffer[..length].to_vec()),
        Err(e) => {
            warn!("Occurred error when USB reading: {}", e);
            listener.on_run_error(e);
        }
    }
    buffer.fill(0);
}
