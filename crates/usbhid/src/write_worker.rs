//! Outbound data loop
//!
//! Callers enqueue buffers with [`WriteWorker::write_async`]; a dedicated
//! thread drains the queue in FIFO order and writes each buffer (or, with
//! coalescing, everything queued at once) to the port, retrying failed
//! transfers per item.

use crate::listener::HidListener;
use crate::port::Port;
use crate::settings::{IoSettings, SharedSettings};
use crate::types::hex_bytes;
use crate::worker::{RunState, RunStateCell, panic_message};
use common::{Error, Result};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

const NAME: &str = "write";

/// A queued outbound buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteItem {
    pub data: Vec<u8>,
    /// Retries for this item; `None` uses the configured default
    pub retry: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkResult {
    QueueIsEmpty,
    WroteData,
    CauseWriteError,
}

#[derive(Debug, Default)]
struct WriteQueue {
    items: Mutex<VecDeque<WriteItem>>,
}

impl WriteQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<WriteItem>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, item: WriteItem) {
        self.lock().push_back(item);
    }

    fn pop(&self) -> Option<WriteItem> {
        self.lock().pop_front()
    }

    /// Take everything queued as one item, preserving order
    ///
    /// The batch retries as often as the most patient item in it asked for.
    /// A batch with no bytes in it counts as an empty queue.
    fn drain_coalesced(&self) -> Option<WriteItem> {
        let mut items = self.lock();
        let mut data = Vec::new();
        let mut retry = None;
        for item in items.drain(..) {
            data.extend_from_slice(&item.data);
            retry = match (retry, item.retry) {
                (Some(a), Some(b)) => Some(u32::max(a, b)),
                (a, b) => a.or(b),
            };
        }
        if data.is_empty() {
            return None;
        }
        Some(WriteItem { data, retry })
    }
}

pub struct WriteWorker {
    port: Arc<Port>,
    settings: Arc<SharedSettings>,
    listener: Arc<dyn HidListener>,
    state: Arc<RunStateCell>,
    queue: Arc<WriteQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriteWorker {
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
            queue: Arc::new(WriteQueue::default()),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the write thread
    pub fn start(&self) -> Result<()> {
        self.state.start()?;

        let looper = WriteLoop {
            port: Arc::clone(&self.port),
            settings: Arc::clone(&self.settings),
            listener: Arc::clone(&self.listener),
            state: Arc::clone(&self.state),
            queue: Arc::clone(&self.queue),
        };

        let spawned = std::thread::Builder::new()
            .name("usbhid-write".to_string())
            .spawn(move || looper.run());

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

    /// Queue `data` for writing and return immediately
    pub fn write_async(&self, data: Vec<u8>, retry: Option<u32>) {
        self.queue.push(WriteItem { data, retry });
    }
}

struct WriteLoop {
    port: Arc<Port>,
    settings: Arc<SharedSettings>,
    listener: Arc<dyn HidListener>,
    state: Arc<RunStateCell>,
    queue: Arc<WriteQueue>,
}

impl WriteLoop {
    fn run(self) {
        debug!("Write worker started on {}", self.port.device());

        let result = catch_unwind(AssertUnwindSafe(|| {
            while self.state.is_running() {
                let work_result = self.work();

                if !self.state.is_running() {
                    break;
                }
                if work_result == WorkResult::QueueIsEmpty {
                    let idle = self.settings.snapshot().write_idle_interval();
                    self.state.idle(idle);
                }
            }
        }));

        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            error!("Write worker terminated: {}", message);
            self.listener.on_run_error(Error::WorkerPanicked {
                worker: NAME,
                message,
            });
        }

        self.state.finish();
        debug!("Write worker exited");
    }

    fn work(&self) -> WorkResult {
        let item = if self.settings.snapshot().write_coalescing {
            self.queue.drain_coalesced()
        } else {
            self.queue.pop()
        };

        let Some(item) = item else {
            return WorkResult::QueueIsEmpty;
        };

        let settings = self.settings.snapshot();
        let retry = item.retry.unwrap_or(settings.default_retry);
        match self.write_with_retry(&item.data, &settings, retry) {
            Ok(()) => WorkResult::WroteData,
            Err(e) if !self.state.is_running() => {
                warn!(
                    "Abandoned data on stop before it reached USB. data={} error=\"{}\"",
                    hex_bytes(&item.data),
                    e
                );
                self.listener.on_run_error(e);
                WorkResult::CauseWriteError
            }
            Err(e) => {
                warn!(
                    "Failed to write data to USB after {} retries. data={} error=\"{}\"",
                    retry,
                    hex_bytes(&item.data),
                    e
                );
                self.listener.on_run_error(e);
                WorkResult::CauseWriteError
            }
        }
    }

    /// Write `data`, retrying up to `retry` more times after a failure
    ///
    /// Retrying ends early once a stop is requested.
    fn write_with_retry(&self, data: &[u8], settings: &IoSettings, retry: u32) -> Result<()> {
        let mut remaining = retry;
        loop {
            match self.port.write(data, settings.write_timeout()) {
                Ok(()) => return Ok(()),
                Err(e) if remaining > 0 && self.state.is_running() => {
                    debug!(
                        "Retry send data after USB write error. data={}, retry={}, error=\"{}\"",
                        hex_bytes(data),
                        remaining,
                        e
                    );
                    remaining -= 1;
                    self.state.idle(settings.retry_backoff());
                }
                Err(e) => return Err(e),
            }
        }
    }
}
