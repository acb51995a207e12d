//! HID port
//!
//! Binds a claimed HID interface to one IN and one OUT endpoint and offers
//! timed, blocking reads and writes over them.

use crate::transport::Connection;
use crate::types::{DeviceDescriptor, Direction, EndpointDescriptor, USB_CLASS_HID};
use common::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub struct Port {
    device: DeviceDescriptor,
    connection: Box<dyn Connection>,
    interface: u8,
    read_endpoint: EndpointDescriptor,
    write_endpoint: EndpointDescriptor,
    closed: AtomicBool,
}

impl Port {
    /// Find a HID interface with an IN and an OUT stream endpoint and claim it
    ///
    /// Interfaces are scanned in order; the first one that offers both
    /// endpoints wins. On failure the connection is closed.
    pub fn create(device: DeviceDescriptor, connection: Box<dyn Connection>) -> Result<Self> {
        let interfaces = match connection.interfaces() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };

        for interface in interfaces.iter().filter(|i| i.class_code == USB_CLASS_HID) {
            let read_endpoint = interface
                .endpoints
                .iter()
                .find(|e| e.is_stream(Direction::In));
            let write_endpoint = interface
                .endpoints
                .iter()
                .find(|e| e.is_stream(Direction::Out));

            let (Some(read_endpoint), Some(write_endpoint)) = (read_endpoint, write_endpoint)
            else {
                debug!(
                    "Interface {} on {} lacks an IN/OUT endpoint pair",
                    interface.number, device
                );
                continue;
            };

            if let Err(e) = connection.claim_interface(interface.number) {
                warn!(
                    "Failed to connect to USB device. Interface {} could not be claimed: {}",
                    interface.number, e
                );
                connection.close();
                return Err(Error::ClaimInterface {
                    interface: interface.number,
                    message: e.to_string(),
                });
            }

            debug!(
                "Claimed interface {} on {} (read {:#04x}, write {:#04x})",
                interface.number, device, read_endpoint.address, write_endpoint.address
            );

            return Ok(Self {
                device,
                connection,
                interface: interface.number,
                read_endpoint: *read_endpoint,
                write_endpoint: *write_endpoint,
                closed: AtomicBool::new(false),
            });
        }

        connection.close();
        Err(Error::NoHidEndpoints(device.to_string()))
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Read into `buf`; `Ok(0)` means nothing arrived within `timeout`
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.connection.read(&self.read_endpoint, buf, timeout)
    }

    /// Write `data`; a transfer that moves no bytes is a failure
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let length = self.connection.write(&self.write_endpoint, data, timeout)?;
        if length == 0 {
            return Err(Error::WriteFailed { status: length });
        }
        Ok(())
    }

    /// Release the interface and close the connection
    ///
    /// Only the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.connection.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }
        self.connection.close();
        debug!("Closed port on {}", self.device);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("device", &self.device)
            .field("interface", &self.interface)
            .field("read_endpoint", &self.read_endpoint.address)
            .field("write_endpoint", &self.write_endpoint.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        MockConnection, hid_interface, mock_device, stream_endpoint,
    };
    use crate::types::{InterfaceDescriptor, TransferKind};

    #[test]
    fn test_create_claims_first_hid_interface_with_pair() {
        let interfaces = vec![
            InterfaceDescriptor {
                number: 0,
                class_code: 0x08,
                endpoints: vec![
                    stream_endpoint(0x81, Direction::In, TransferKind::Bulk),
                    stream_endpoint(0x01, Direction::Out, TransferKind::Bulk),
                ],
            },
            InterfaceDescriptor {
                number: 1,
                class_code: USB_CLASS_HID,
                endpoints: vec![stream_endpoint(0x82, Direction::In, TransferKind::Interrupt)],
            },
            hid_interface(2),
        ];
        let connection = MockConnection::with_interfaces(interfaces);
        let probe = connection.probe();

        let port = Port::create(mock_device(), Box::new(connection)).unwrap();

        assert_eq!(port.interface(), 2);
        assert_eq!(probe.claimed(), vec![2]);
    }

    #[test]
    fn test_create_fails_without_endpoint_pair() {
        let interfaces = vec![InterfaceDescriptor {
            number: 0,
            class_code: USB_CLASS_HID,
            endpoints: vec![
                stream_endpoint(0x81, Direction::In, TransferKind::Interrupt),
                stream_endpoint(0x02, Direction::Out, TransferKind::Isochronous),
            ],
        }];
        let connection = MockConnection::with_interfaces(interfaces);
        let probe = connection.probe();

        let result = Port::create(mock_device(), Box::new(connection));

        assert!(matches!(result, Err(Error::NoHidEndpoints(_))));
        assert!(probe.claimed().is_empty());
        assert_eq!(probe.close_count(), 1);
    }

    #[test]
    fn test_create_closes_connection_when_claim_fails() {
        let connection = MockConnection::new();
        let probe = connection.probe();
        probe.fail_claim();

        let result = Port::create(mock_device(), Box::new(connection));

        assert!(matches!(result, Err(Error::ClaimInterface { interface: 0, .. })));
        assert_eq!(probe.close_count(), 1);
    }

    #[test]
    fn test_zero_length_write_is_an_error() {
        let connection = MockConnection::new();
        let probe = connection.probe();
        probe.accept_nothing();
        let port = Port::create(mock_device(), Box::new(connection)).unwrap();

        let result = port.write(&[1, 2, 3], Duration::from_millis(10));

        assert!(matches!(result, Err(Error::WriteFailed { status: 0 })));
    }

    #[test]
    fn test_close_is_idempotent_and_drop_does_not_close_again() {
        let connection = MockConnection::new();
        let probe = connection.probe();
        let port = Port::create(mock_device(), Box::new(connection)).unwrap();

        port.close();
        port.close();
        assert!(port.is_closed());
        drop(port);

        assert_eq!(probe.release_count(), 1);
        assert_eq!(probe.close_count(), 1);
    }
}
