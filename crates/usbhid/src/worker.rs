//! Worker run state
//!
//! Each worker owns one [`RunStateCell`]. The cell is the only place the
//! run state changes, and every change goes through a named transition.
//! Its condition variable doubles as the cancellable idle wait and as the
//! stop-completion signal.

use common::{Error, Result};
use std::any::Any;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug)]
pub struct RunStateCell {
    name: &'static str,
    state: Mutex<RunState>,
    changed: Condvar,
}

impl RunStateCell {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(RunState::Stopped),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> RunState {
        *self.lock()
    }

    pub fn is_running(&self) -> bool {
        self.get() == RunState::Running
    }

    /// Stopped -> Running
    ///
    /// Starting a worker that is not stopped is a contract violation.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if *state != RunState::Stopped {
            return Err(Error::AlreadyRunning(self.name));
        }
        *state = RunState::Running;
        debug!("{} worker running", self.name);
        Ok(())
    }

    /// Running -> Stopping; returns false when the worker was not running
    pub fn request_stop(&self) -> bool {
        let mut state = self.lock();
        if *state != RunState::Running {
            return false;
        }
        *state = RunState::Stopping;
        self.changed.notify_all();
        debug!("{} worker stopping", self.name);
        true
    }

    /// Any -> Stopped
    pub fn finish(&self) {
        let mut state = self.lock();
        *state = RunState::Stopped;
        self.changed.notify_all();
        debug!("{} worker stopped", self.name);
    }

    /// Sleep for `duration` unless a stop is requested first
    pub fn idle(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let state = self.lock();
        let _ = self
            .changed
            .wait_timeout_while(state, duration, |s| *s == RunState::Running);
    }

    /// Wait until the worker reports Stopped; false on timeout
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| *s != RunState::Stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state == RunState::Stopped
    }
}

/// Best-effort text of a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_transitions() {
        let cell = RunStateCell::new("test");
        assert_eq!(cell.get(), RunState::Stopped);

        cell.start().unwrap();
        assert!(cell.is_running());

        assert!(cell.request_stop());
        assert_eq!(cell.get(), RunState::Stopping);

        cell.finish();
        assert_eq!(cell.get(), RunState::Stopped);
    }

    #[test]
    fn test_double_start_fails() {
        let cell = RunStateCell::new("test");
        cell.start().unwrap();
        assert!(matches!(cell.start(), Err(Error::AlreadyRunning("test"))));
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let cell = RunStateCell::new("test");
        assert!(!cell.request_stop());
        assert_eq!(cell.get(), RunState::Stopped);
    }

    #[test]
    fn test_idle_wakes_on_stop() {
        let cell = Arc::new(RunStateCell::new("test"));
        cell.start().unwrap();

        let stopper = Arc::clone(&cell);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.request_stop();
        });

        let started = Instant::now();
        cell.idle(Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_stopped() {
        let cell = Arc::new(RunStateCell::new("test"));
        cell.start().unwrap();
        assert!(!cell.wait_stopped(Duration::from_millis(10)));

        let finisher = Arc::clone(&cell);
        let handle = std::thread::spawn(move || finisher.finish());
        assert!(cell.wait_stopped(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
