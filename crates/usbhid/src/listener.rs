//! Notifications delivered to the caller
//!
//! Callbacks fire on the read worker, the write worker or the controller's
//! event thread. They must return quickly; anything slow belongs behind
//! [`create_event_channel`].

use crate::types::ConnectionState;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use common::Error;
use tracing::warn;

/// Caller-side listener
pub trait HidListener: Send + Sync {
    /// Bytes received from the device
    fn on_new_data(&self, _data: Vec<u8>) {}

    /// A transfer failed, retries were exhausted, or a worker died
    fn on_run_error(&self, _error: Error) {}

    /// The connection state changed
    fn on_state_changed(&self, _state: ConnectionState) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl HidListener for NoopListener {}

/// Listener notifications as values
#[derive(Debug)]
pub enum HidEvent {
    Data(Vec<u8>),
    RunError(Error),
    StateChanged(ConnectionState),
}

/// Listener that forwards notifications into a bounded channel
///
/// A full channel drops the event rather than stall a worker thread.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: Sender<HidEvent>,
}

impl EventChannel {
    fn forward(&self, event: HidEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl HidListener for EventChannel {
    fn on_new_data(&self, data: Vec<u8>) {
        self.forward(HidEvent::Data(data));
    }

    fn on_run_error(&self, error: Error) {
        self.forward(HidEvent::RunError(error));
    }

    fn on_state_changed(&self, state: ConnectionState) {
        self.forward(HidEvent::StateChanged(state));
    }
}

/// Create a listener and the receiving end of its event channel
pub fn create_event_channel(capacity: usize) -> (EventChannel, Receiver<HidEvent>) {
    let (tx, rx) = bounded(capacity);
    (EventChannel { tx }, rx)
}
