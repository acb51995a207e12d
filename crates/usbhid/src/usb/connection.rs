//! Open device handle

use super::{map_direction, map_rusb_error, map_transfer_kind};
use crate::transport::Connection;
use crate::types::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferKind};
use common::{Error, Result};
use rusb::{Context, Device, DeviceHandle};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// [`Connection`] over an open libusb handle
///
/// Kernel drivers detached while claiming are reattached on close.
pub struct RusbConnection {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    detached: Mutex<Vec<u8>>,
}

impl RusbConnection {
    pub fn new(device: Device<Context>, handle: DeviceHandle<Context>) -> Self {
        Self {
            device,
            handle,
            detached: Mutex::new(Vec::new()),
        }
    }

    fn detached(&self) -> MutexGuard<'_, Vec<u8>> {
        self.detached.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Connection for RusbConnection {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            // Alternate settings share the interface number; the default one is listed first.
            let Some(descriptor) = interface.descriptors().next() else {
                continue;
            };
            let endpoints = descriptor
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    direction: map_direction(ep.direction()),
                    kind: map_transfer_kind(ep.transfer_type()),
                })
                .collect();

            interfaces.push(InterfaceDescriptor {
                number: interface.number(),
                class_code: descriptor.class_code(),
                endpoints,
            });
        }
        Ok(interfaces)
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached().push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        self.handle
            .claim_interface(interface)
            .map_err(|e| Error::ClaimInterface {
                interface,
                message: e.to_string(),
            })
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.handle
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn read(
        &self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if endpoint.direction != Direction::In {
            return Err(Error::Usb(format!(
                "endpoint {:#04x} is not an IN endpoint",
                endpoint.address
            )));
        }

        let result = match endpoint.kind {
            TransferKind::Bulk => self.handle.read_bulk(endpoint.address, buf, timeout),
            TransferKind::Interrupt => self.handle.read_interrupt(endpoint.address, buf, timeout),
            other => {
                return Err(Error::Usb(format!("unsupported IN transfer type {:?}", other)));
            }
        };

        match result {
            Ok(length) => Ok(length),
            // Nothing arrived within the poll window
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn write(&self, endpoint: &EndpointDescriptor, data: &[u8], timeout: Duration) -> Result<usize> {
        if endpoint.direction != Direction::Out {
            return Err(Error::Usb(format!(
                "endpoint {:#04x} is not an OUT endpoint",
                endpoint.address
            )));
        }

        let result = match endpoint.kind {
            TransferKind::Bulk => self.handle.write_bulk(endpoint.address, data, timeout),
            TransferKind::Interrupt => self.handle.write_interrupt(endpoint.address, data, timeout),
            other => {
                return Err(Error::Usb(format!("unsupported OUT transfer type {:?}", other)));
            }
        };
        result.map_err(map_rusb_error)
    }

    fn close(&self) {
        for interface in self.detached().drain(..) {
            match self.handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }
        debug!(
            "Closed device (bus {:03} device {:03})",
            self.device.bus_number(),
            self.device.address()
        );
    }
}
