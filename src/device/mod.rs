//! The [`Device`] module provides the low-level USB transport to a ZTEX
//! board.  Prefer [`crate::Ztex`] for most use cases.
//!
//! It is unlikely you need to use this interface directly unless you are
//! adding a new transport, or mocking the device for tests.

#[cfg(test)]
pub(crate) mod mock;
pub mod usb;

use serde::{Deserialize, Serialize};
use std::thread::sleep;
use std::time::Duration;
pub use usb::UsbDevice;

use crate::capability::CapabilityTable;
use crate::constants::*;
use crate::Error;

/// The core Device trait, which allows Device to be mocked out for testing
///
/// All transfers are blocking.  A handle must not be used from more than
/// one call site at a time, as many ZTEX operations rely on request/response
/// pairing.
pub trait Device: std::fmt::Debug {
    /// Returns the [`DeviceInfo`] read when the device was opened
    fn info(&self) -> &DeviceInfo;

    /// Sends a vendor request (device to host) and reads the response
    ///
    /// # Arguments
    /// * `request` - The request code
    /// * `value` - The 2 byte request value
    /// * `index` - The 2 byte request index
    /// * `buffer` - A buffer which will be filled in with the read data
    /// * `timeout` - Transfer timeout
    ///
    /// # Returns
    /// * `Ok(usize)` - On success, with the number of bytes read
    /// * `Err(Error)` - On failure
    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error>;

    /// Sends a vendor command (host to device) with an optional data phase
    ///
    /// # Returns
    /// * `Ok(usize)` - On success, with the number of bytes written
    /// * `Err(Error)` - On failure
    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error>;

    /// Writes data to a bulk endpoint, returning the number of bytes written
    fn write_bulk(&mut self, endpoint: u8, buffer: &[u8], timeout: Duration)
        -> Result<usize, Error>;

    /// Reads data from a bulk endpoint, returning the number of bytes read
    fn read_bulk(
        &mut self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error>;

    fn claim_interface(&mut self, iface: u8) -> Result<(), Error>;

    fn release_interface(&mut self, iface: u8) -> Result<(), Error>;

    /// Returns true if this handle has claimed `iface`
    fn is_claimed(&self, iface: u8) -> bool;

    /// Blocks for `dur`.  Settle times between protocol steps go through
    /// here so that tests can observe them.
    fn delay(&mut self, dur: Duration) {
        sleep(dur);
    }
}

/// DeviceInfo contains information read from the ZTEX device when it was
/// opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// USB bus number
    pub bus_number: u8,
    /// USB device address
    pub address: u8,
    /// Manufacturer [`String`] from the USB device
    pub manufacturer: Option<String>,
    /// Product [`String`] from the USB device
    pub product: Option<String>,
    /// Serial number [`String`] from the USB device
    pub serial_number: Option<String>,
    /// ZTEX descriptor, None if the device runs no ZTEX firmware (e.g. an
    /// unprogrammed EZ-USB waiting for a RAM upload)
    pub descriptor: Option<ZtexDescriptor>,
}

impl DeviceInfo {
    /// Interface capabilities, empty if there is no ZTEX descriptor
    pub fn capabilities(&self) -> CapabilityTable {
        self.descriptor
            .as_ref()
            .map(|d| CapabilityTable::from_bytes(&d.capabilities))
            .unwrap_or_default()
    }

    /// Prints DeviceInfo to stdout in a human-readable format
    pub fn print(&self) {
        println!(
            "  - device: {:04x}:{:04x} bus/address: {:03}-{:03}",
            self.vendor_id, self.product_id, self.bus_number, self.address
        );
        if let Some(product) = &self.product {
            println!("  - product: {product}");
        }
        if let Some(serial) = &self.serial_number {
            println!("  - serial number: {serial}");
        }
        match &self.descriptor {
            Some(d) => {
                println!("  - product ID: {}", product_id_string(&d.product_id));
                println!("  - firmware version: {}", d.fw_version);
                println!("  - interface version: {}", d.interface_version);
                println!("  - capabilities:");
                let caps = self.capabilities().info("      ");
                if caps.is_empty() {
                    println!("      no capabilities");
                } else {
                    println!("{caps}");
                }
            }
            None => println!("  - no ZTEX descriptor"),
        }
    }
}

/// The 40 byte ZTEX descriptor, read with vendor request 0x22 and also
/// embedded in ZTEX firmware images
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZtexDescriptor {
    pub product_id: [u8; 4],
    pub fw_version: u8,
    pub interface_version: u8,
    pub capabilities: [u8; CAPABILITY_BYTES],
    pub module_reserved: [u8; 12],
    pub serial: String,
}

impl ZtexDescriptor {
    /// Parses a raw descriptor
    ///
    /// # Errors
    /// * `InvalidFirmware` if size, version or signature do not match
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ZTEX_DESCRIPTOR_SIZE || buf[0] as usize != ZTEX_DESCRIPTOR_SIZE {
            return Err(Error::invalid_firmware(format!(
                "Invalid ZTEX descriptor size: {}",
                buf.first().copied().unwrap_or(0)
            )));
        }
        if buf[1] != ZTEX_DESCRIPTOR_VERSION {
            return Err(Error::invalid_firmware(format!(
                "Invalid ZTEX descriptor version: {}",
                buf[1]
            )));
        }
        if &buf[2..6] != ZTEX_DESCRIPTOR_SIGNATURE {
            return Err(Error::invalid_firmware("Invalid ZTEX descriptor signature"));
        }

        let mut product_id = [0u8; 4];
        product_id.copy_from_slice(&buf[6..10]);
        let mut capabilities = [0u8; CAPABILITY_BYTES];
        capabilities.copy_from_slice(&buf[12..18]);
        let mut module_reserved = [0u8; 12];
        module_reserved.copy_from_slice(&buf[18..30]);
        let serial = String::from_utf8_lossy(&buf[30..40])
            .trim_end_matches(char::from(0))
            .to_string();

        Ok(Self {
            product_id,
            fw_version: buf[10],
            interface_version: buf[11],
            capabilities,
            module_reserved,
            serial,
        })
    }

    /// Compares product IDs.  A zero byte on either side matches anything.
    pub fn compatible(&self, other: &[u8; 4]) -> bool {
        product_ids_compatible(&self.product_id, other)
    }
}

/// Compares two 4 byte product IDs, treating a zero byte on either side as a
/// wildcard
pub fn product_ids_compatible(a: &[u8; 4], b: &[u8; 4]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| *x == 0 || *y == 0 || x == y)
}

/// Formats a product ID as "a.b.c.d"
pub fn product_id_string(id: &[u8; 4]) -> String {
    format!("{}.{}.{}.{}", id[0], id[1], id[2], id[3])
}
