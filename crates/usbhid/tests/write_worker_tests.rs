//! Write queue ordering properties
//!
//! Run with: `cargo test -p usbhid --test write_worker_tests`

use proptest::prelude::*;
use std::sync::Arc;
use usbhid::test_utils::{DEFAULT_TEST_TIMEOUT, MockConnection, mock_device, wait_until};
use usbhid::{IoSettings, NoopListener, Port, SharedSettings, WriteWorker};

fn run_batch(items: &[Vec<u8>], coalescing: bool) -> Vec<Vec<u8>> {
    let connection = MockConnection::new();
    let probe = connection.probe();
    let port = Arc::new(Port::create(mock_device(), Box::new(connection)).unwrap());
    let settings = IoSettings {
        write_coalescing: coalescing,
        ..IoSettings::default()
    };
    let worker = WriteWorker::new(
        port,
        Arc::new(SharedSettings::new(settings)),
        Arc::new(NoopListener),
    );

    for item in items {
        worker.write_async(item.clone(), None);
    }
    worker.start().unwrap();

    let expected: usize = items.iter().map(Vec::len).sum();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        probe.writes().iter().map(Vec::len).sum::<usize>() == expected
    }));
    worker.stop();
    assert!(worker.wait_stopped(DEFAULT_TEST_TIMEOUT));

    probe.writes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_items_written_in_fifo_order(
        items in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..8), 1..16)
    ) {
        let written = run_batch(&items, false);
        prop_assert_eq!(written, items);
    }

    #[test]
    fn prop_coalescing_preserves_byte_order(
        items in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..8), 1..16)
    ) {
        let written = run_batch(&items, true);
        prop_assert_eq!(written.len(), 1);
        prop_assert_eq!(written.concat(), items.concat());
    }
}
