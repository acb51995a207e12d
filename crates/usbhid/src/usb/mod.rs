//! libusb transport
//!
//! [`RusbTransport`] implements [`crate::Transport`] on top of `rusb`. Hot-plug
//! callbacks are driven by a dedicated `usbhid-hotplug` thread that runs
//! `handle_events()` for as long as the watch guard lives.

mod connection;
mod transport;

pub use connection::RusbConnection;
pub use transport::RusbTransport;

use common::Error;

/// Map rusb errors to the crate error type
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::Timeout => Error::Timeout,
        rusb::Error::NoDevice => Error::NoDevice,
        rusb::Error::Access => Error::PermissionDenied(err.to_string()),
        _ => Error::Usb(err.to_string()),
    }
}

fn map_direction(direction: rusb::Direction) -> crate::types::Direction {
    match direction {
        rusb::Direction::In => crate::types::Direction::In,
        rusb::Direction::Out => crate::types::Direction::Out,
    }
}

fn map_transfer_kind(kind: rusb::TransferType) -> crate::types::TransferKind {
    match kind {
        rusb::TransferType::Control => crate::types::TransferKind::Control,
        rusb::TransferType::Isochronous => crate::types::TransferKind::Isochronous,
        rusb::TransferType::Bulk => crate::types::TransferKind::Bulk,
        rusb::TransferType::Interrupt => crate::types::TransferKind::Interrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, TransferKind};

    #[test]
    fn test_map_rusb_error() {
        assert!(matches!(map_rusb_error(rusb::Error::Timeout), Error::Timeout));
        assert!(matches!(map_rusb_error(rusb::Error::NoDevice), Error::NoDevice));
        assert!(matches!(
            map_rusb_error(rusb::Error::Access),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(map_rusb_error(rusb::Error::Pipe), Error::Usb(_)));
    }

    #[test]
    fn test_map_endpoint_attributes() {
        assert_eq!(map_direction(rusb::Direction::In), Direction::In);
        assert_eq!(
            map_transfer_kind(rusb::TransferType::Interrupt),
            TransferKind::Interrupt
        );
        assert_eq!(map_transfer_kind(rusb::TransferType::Bulk), TransferKind::Bulk);
    }
}
