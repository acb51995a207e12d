//! Runtime I/O settings
//!
//! Workers take a snapshot at the top of every work cycle, so changes made
//! through [`SharedSettings::update`] apply from the next cycle on.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    /// Timeout of one IN transfer
    pub read_timeout_ms: u64,
    /// Timeout of one OUT transfer
    pub write_timeout_ms: u64,
    /// Retries after a failed write when the item carries no override (0 = none)
    pub default_retry: u32,
    /// Pause between write retries (0 = retry immediately)
    pub retry_backoff_ms: u64,
    /// Concatenate everything queued into a single transfer
    pub write_coalescing: bool,
    /// Size of the reusable read buffer
    pub read_buffer_size: usize,
    /// Pause between reads
    pub read_poll_interval_ms: u64,
    /// Pause of the write loop when the queue is empty
    pub write_idle_interval_ms: u64,
    /// How long close/detach waits for the workers to stop before
    /// deferring the port close
    pub stop_timeout_ms: u64,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 30,
            write_timeout_ms: 10,
            default_retry: 0,
            retry_backoff_ms: 0,
            write_coalescing: false,
            read_buffer_size: 4096,
            read_poll_interval_ms: 10,
            write_idle_interval_ms: 1,
            stop_timeout_ms: 1000,
        }
    }
}

impl IoSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }

    pub fn write_idle_interval(&self) -> Duration {
        Duration::from_millis(self.write_idle_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be greater than 0".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(Error::Config("read_timeout_ms must be greater than 0".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(Error::Config("write_timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Settings cell shared between the controller and its workers
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<IoSettings>,
}

impl SharedSettings {
    pub fn new(settings: IoSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> IoSettings {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply `f` to the settings; rejected changes leave them untouched
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut IoSettings),
    {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = guard.clone();
        f(&mut next);
        next.validate()?;
        *guard = next;
        Ok(())
    }
}
