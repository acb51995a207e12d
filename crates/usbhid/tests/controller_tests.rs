//! Connection controller integration tests
//!
//! Drives the controller through the in-memory transport and observes it
//! the way an application would, through the event channel.
//!
//! Run with: `cargo test -p usbhid --test controller_tests`

use async_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;
use usbhid::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockTransport, PermissionOutcome, mock_device, mock_device_with,
    with_timeout,
};
use usbhid::{ConnectionController, ConnectionState, HidEvent, IoSettings, create_event_channel};

fn start(transport: &MockTransport) -> (ConnectionController, Receiver<HidEvent>) {
    let (listener, rx) = create_event_channel(256);
    let controller = ConnectionController::new(
        Arc::new(transport.clone()),
        0x1234,
        0x0006,
        IoSettings::default(),
        Arc::new(listener),
    )
    .unwrap();
    (controller, rx)
}

async fn next_state(rx: &Receiver<HidEvent>) -> ConnectionState {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        loop {
            if let HidEvent::StateChanged(state) = rx.recv().await.unwrap() {
                return state;
            }
        }
    })
    .await
    .unwrap()
}

async fn next_data(rx: &Receiver<HidEvent>) -> Vec<u8> {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        loop {
            if let HidEvent::Data(data) = rx.recv().await.unwrap() {
                return data;
            }
        }
    })
    .await
    .unwrap()
}

async fn next_error(rx: &Receiver<HidEvent>) -> String {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        loop {
            if let HidEvent::RunError(error) = rx.recv().await.unwrap() {
                return error.to_string();
            }
        }
    })
    .await
    .unwrap()
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

fn state_events(rx: &Receiver<HidEvent>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let HidEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_write_reaches_device_and_reply_is_delivered() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::Working);
        assert_eq!(next_state(&rx).await, ConnectionState::Working);

        let probe = transport.last_probe().unwrap();
        assert_eq!(probe.claimed(), vec![0]);

        controller.write(vec![1, 0, 1, 0], None).unwrap();
        wait_for(|| !probe.writes().is_empty()).await;
        assert_eq!(probe.writes(), vec![vec![1, 0, 1, 0]]);

        probe.push_inbound(vec![0]);
        assert_eq!(next_data(&rx).await, vec![0]);

        controller.close();
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_no_matching_device_fails_without_opening() {
        let transport = MockTransport::new();
        transport.add_device(mock_device_with(0xdead, 0xbeef, 1, 2));
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::FailedInitialize);
        assert_eq!(next_state(&rx).await, ConnectionState::FailedInitialize);
        assert_eq!(transport.open_count(), 0);
        assert!(transport.probes().is_empty());

        controller.close();
    }

    #[tokio::test]
    async fn test_missing_endpoints_close_the_connection() {
        let transport = MockTransport::with_device();
        transport.set_interfaces(Vec::new());
        let (controller, _rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::FailedInitialize);
        let probe = transport.last_probe().unwrap();
        assert_eq!(probe.close_count(), 1);
        assert!(controller.write(vec![1], None).is_err());

        controller.close();
    }

    #[tokio::test]
    async fn test_retry_open_after_failure() {
        let transport = MockTransport::new();
        let (controller, _rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::FailedInitialize);
        transport.add_device(mock_device());
        assert_eq!(controller.open(), ConnectionState::Working);

        controller.close();
    }

    #[tokio::test]
    async fn test_close_releases_port_once() {
        let transport = MockTransport::with_device();
        let (controller, _rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::Working);
        let probe = transport.last_probe().unwrap();

        controller.close();
        controller.close();

        assert_eq!(probe.release_count(), 1);
        assert_eq!(probe.close_count(), 1);
        assert_eq!(controller.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_close_stops_busy_workers_before_closing_port() {
        let transport = MockTransport::with_device();
        let (controller, _rx) = start(&transport);
        controller
            .update_settings(|s| s.retry_backoff_ms = 1)
            .unwrap();

        assert_eq!(controller.open(), ConnectionState::Working);
        let probe = transport.last_probe().unwrap();
        probe.fail_next_writes(usize::MAX);
        controller.write(vec![1, 0, 1, 0], Some(u32::MAX)).unwrap();
        for _ in 0..64 {
            probe.push_inbound(vec![0xaa; 8]);
        }
        wait_for(|| probe.write_attempts() > 2 && probe.read_count() > 2).await;

        controller.close();

        assert_eq!(probe.close_count(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(probe.transfers_after_close(), 0);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let transport = MockTransport::with_device();
        let (controller, _rx) = start(&transport);

        controller.open();
        controller.close();

        assert!(matches!(
            controller.write(vec![1], None),
            Err(common::Error::NotOpen)
        ));
    }
}

mod permission {
    use super::*;

    #[tokio::test]
    async fn test_denied_permission_fails_initialize() {
        let transport = MockTransport::with_device();
        transport.set_access_granted(false);
        transport.set_permission_outcome(PermissionOutcome::Deny);
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::PermissionRequesting);
        assert_eq!(next_state(&rx).await, ConnectionState::PermissionRequesting);
        assert_eq!(next_state(&rx).await, ConnectionState::FailedInitialize);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state_events(&rx).is_empty());
        assert!(transport.probes().is_empty());

        controller.close();
    }

    #[tokio::test]
    async fn test_granted_permission_reaches_working() {
        let transport = MockTransport::with_device();
        transport.set_access_granted(false);
        transport.set_permission_outcome(PermissionOutcome::Grant);
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::PermissionRequesting);
        assert_eq!(next_state(&rx).await, ConnectionState::PermissionRequesting);
        assert_eq!(next_state(&rx).await, ConnectionState::Working);

        controller.write(vec![1, 1, 1, 1], None).unwrap();
        let probe = transport.last_probe().unwrap();
        wait_for(|| probe.writes().len() == 1).await;

        controller.close();
    }

    #[tokio::test]
    async fn test_open_while_requesting_does_not_ask_again() {
        let transport = MockTransport::with_device();
        transport.set_access_granted(false);
        transport.set_permission_outcome(PermissionOutcome::Hold);
        let (controller, _rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::PermissionRequesting);
        assert_eq!(controller.open(), ConnectionState::PermissionRequesting);
        assert_eq!(transport.permission_requests(), 1);
        assert_eq!(transport.enumerate_count(), 1);

        controller.close();
    }

    #[tokio::test]
    async fn test_result_after_close_is_ignored() {
        let transport = MockTransport::with_device();
        transport.set_access_granted(false);
        transport.set_permission_outcome(PermissionOutcome::Hold);
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::PermissionRequesting);
        controller.close();
        assert!(transport.resolve_permission(true));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.state(), ConnectionState::Uninitialized);
        assert_eq!(
            state_events(&rx),
            vec![
                ConnectionState::PermissionRequesting,
                ConnectionState::Uninitialized
            ]
        );
        assert!(transport.probes().is_empty());
    }
}

mod hotplug {
    use super::*;

    #[tokio::test]
    async fn test_detach_disconnects_and_attach_reconnects() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::Working);
        assert_eq!(next_state(&rx).await, ConnectionState::Working);
        let first = transport.last_probe().unwrap();

        transport.detach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);
        assert_eq!(first.release_count(), 1);
        assert_eq!(first.close_count(), 1);
        assert!(controller.write(vec![1], None).is_err());

        transport.attach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Working);
        assert_eq!(transport.enumerate_count(), 2);
        assert_eq!(transport.probes().len(), 2);

        controller.close();
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);
        assert_eq!(first.close_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_stops_busy_workers_before_closing_port() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);
        controller
            .update_settings(|s| s.retry_backoff_ms = 1)
            .unwrap();

        assert_eq!(controller.open(), ConnectionState::Working);
        assert_eq!(next_state(&rx).await, ConnectionState::Working);
        let probe = transport.last_probe().unwrap();
        probe.fail_next_writes(usize::MAX);
        controller.write(vec![9], Some(u32::MAX)).unwrap();
        for _ in 0..64 {
            probe.push_inbound(vec![0x55; 8]);
        }
        wait_for(|| probe.write_attempts() > 2 && probe.read_count() > 2).await;

        transport.detach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);

        assert_eq!(probe.close_count(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(probe.transfers_after_close(), 0);

        controller.close();
    }

    #[tokio::test]
    async fn test_attach_while_working_is_ignored() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::Working);
        assert_eq!(next_state(&rx).await, ConnectionState::Working);

        transport.attach(mock_device_with(0x1234, 0x0006, 1, 9));
        transport.detach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);

        assert_eq!(transport.enumerate_count(), 1);

        controller.close();
    }

    #[tokio::test]
    async fn test_unrelated_attach_is_ignored() {
        let transport = MockTransport::new();
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::FailedInitialize);
        assert_eq!(next_state(&rx).await, ConnectionState::FailedInitialize);

        transport.attach(mock_device_with(0xdead, 0xbeef, 2, 3));
        transport.attach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Working);

        assert_eq!(transport.enumerate_count(), 2);

        controller.close();
    }

    #[tokio::test]
    async fn test_unrelated_detach_keeps_connection() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::Working);
        assert_eq!(next_state(&rx).await, ConnectionState::Working);

        transport.detach(mock_device_with(0x1234, 0x0006, 3, 7));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(controller.state(), ConnectionState::Working);
        assert!(state_events(&rx).is_empty());
        controller.write(vec![1], None).unwrap();

        controller.close();
    }

    #[tokio::test]
    async fn test_one_notification_per_transition() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);

        controller.open();
        assert_eq!(next_state(&rx).await, ConnectionState::Working);
        transport.detach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);
        transport.attach(mock_device());
        assert_eq!(next_state(&rx).await, ConnectionState::Working);
        controller.close();
        assert_eq!(next_state(&rx).await, ConnectionState::Uninitialized);

        assert!(state_events(&rx).is_empty());
    }
}

mod writes {
    use super::*;

    #[tokio::test]
    async fn test_default_retry_from_settings() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);
        controller
            .update_settings(|s| s.default_retry = 2)
            .unwrap();

        assert_eq!(controller.open(), ConnectionState::Working);
        let probe = transport.last_probe().unwrap();
        probe.fail_next_writes(2);

        controller.write(vec![4], None).unwrap();
        wait_for(|| probe.writes().len() == 1).await;

        assert_eq!(probe.write_attempts(), 3);
        controller.close();
        assert!(
            std::iter::from_fn(|| rx.try_recv().ok())
                .all(|event| !matches!(event, HidEvent::RunError(_)))
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_reported() {
        let transport = MockTransport::with_device();
        let (controller, rx) = start(&transport);

        assert_eq!(controller.open(), ConnectionState::Working);
        let probe = transport.last_probe().unwrap();
        probe.fail_next_writes(2);

        controller.write(vec![4], Some(1)).unwrap();
        assert!(next_error(&rx).await.contains("scripted write failure"));
        assert_eq!(probe.write_attempts(), 2);

        controller.write(vec![5], None).unwrap();
        wait_for(|| probe.writes() == vec![vec![5]]).await;

        controller.close();
    }

    #[tokio::test]
    async fn test_invalid_settings_update_rejected() {
        let transport = MockTransport::with_device();
        let (controller, _rx) = start(&transport);

        assert!(controller.update_settings(|s| s.read_buffer_size = 0).is_err());
        assert_eq!(controller.settings().read_buffer_size, 4096);
    }
}
