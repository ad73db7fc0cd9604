use crate::constants::*;
use crate::error::DeviceAccess::*;
use crate::Error::{self, *};
use crate::{Device, DeviceInfo, ZtexDescriptor};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rusb::Device as RusbDevice;
use rusb::DeviceHandle as RusbDeviceHandle;
use rusb::{constants, Context, UsbContext};
use std::collections::BTreeSet;
use std::time::Duration;

/// Vendor request, device as recipient, with IN direction
const REQUEST_TYPE_IN: u8 = constants::LIBUSB_REQUEST_TYPE_VENDOR
    | constants::LIBUSB_RECIPIENT_DEVICE
    | constants::LIBUSB_ENDPOINT_IN;

/// Vendor command, device as recipient, with OUT direction
const REQUEST_TYPE_OUT: u8 = constants::LIBUSB_REQUEST_TYPE_VENDOR
    | constants::LIBUSB_RECIPIENT_DEVICE
    | constants::LIBUSB_ENDPOINT_OUT;

/// UsbDevice is a ZTEX board attached via [`rusb`].
///
/// Instead of using [`UsbDevice::new`] it is recommended to use
/// [`crate::ZtexBuilder::build`], which creates both the [`crate::Ztex`]
/// facade and the UsbDevice.
#[derive(Debug)]
pub struct UsbDevice {
    handle: RusbDeviceHandle<Context>,
    info: DeviceInfo,
    claimed: BTreeSet<u8>,
}

/// Selects which device [`UsbDevice::new`] opens
#[derive(Debug, Default)]
pub struct UsbDeviceConfig {
    /// The [`rusb::Context`] to use for this device.  May be None to use
    /// a new context.
    pub context: Option<Context>,

    /// Vendor and product ID to match.  If omitted, any ZTEX product ID
    /// (0x221a:0x0100..=0x01ff) is matched.
    pub ids: Option<(u16, u16)>,

    /// Bus number and address to match.  If omitted, the first matching
    /// device is used.
    pub bus_address: Option<(u8, u8)>,

    /// USB serial number string to match
    pub serial_number: Option<String>,

    /// Open the device even if it provides no ZTEX descriptor, e.g. to
    /// upload firmware into the RAM of an unprogrammed EZ-USB
    pub allow_no_descriptor: bool,
}

impl UsbDevice {
    /// Opens a ZTEX device according to `config`, reading its strings and
    /// ZTEX descriptor
    ///
    /// # Returns
    /// * `Ok(UsbDevice)` - Opened device
    /// * `Err(Error)` - If no device matched, or the descriptor could not be
    ///   read
    pub fn new(config: Option<UsbDeviceConfig>) -> Result<Self, Error> {
        trace!("Device::new");
        let config = config.unwrap_or_default();
        trace!("DeviceConfig {config:?}");

        let context = match &config.context {
            Some(ctx) => ctx.clone(),
            None => Context::new()?,
        };

        let (device, handle) = Self::find_device(&context, &config)?;
        let mut usb = Self {
            handle,
            info: DeviceInfo::default(),
            claimed: BTreeSet::new(),
        };
        usb.info = usb.read_info(&device, config.allow_no_descriptor)?;
        debug!(
            "Opened device {:04x}:{:04x} at {:03}-{:03}",
            usb.info.vendor_id, usb.info.product_id, usb.info.bus_number, usb.info.address
        );
        Ok(usb)
    }

    fn matches_ids(vid: u16, pid: u16, ids: Option<(u16, u16)>) -> bool {
        match ids {
            Some((v, p)) => vid == v && pid == p,
            None => vid == ZTEX_VID && (ZTEX_PID_MIN..=ZTEX_PID_MAX).contains(&pid),
        }
    }

    /// Enumerate the bus, find the appropriate device and open it
    fn find_device(
        context: &Context,
        config: &UsbDeviceConfig,
    ) -> Result<(RusbDevice<Context>, RusbDeviceHandle<Context>), Error> {
        trace!("Device::find_device context {context:?}");

        for device in context.devices()?.iter() {
            let device_desc = device.device_descriptor()?;
            let (vid, pid) = (device_desc.vendor_id(), device_desc.product_id());
            trace!("Found USB device {vid:04x}:{pid:04x}");

            if let Some((bus, address)) = config.bus_address {
                if device.bus_number() != bus || device.address() != address {
                    continue;
                }
            }
            if !Self::matches_ids(vid, pid, config.ids) {
                continue;
            }

            debug!("Found candidate device {vid:04x}:{pid:04x}");
            let handle = device.open()?;

            if let Some(wanted) = &config.serial_number {
                match handle.read_serial_number_string_ascii(&device_desc) {
                    Ok(serial) if &serial == wanted => (),
                    Ok(serial) => {
                        debug!("Device serial number {serial} didn't match requested {wanted}");
                        continue;
                    }
                    Err(e) => {
                        info!("Couldn't read device serial number: {}", e);
                        continue;
                    }
                }
            }
            return Ok((device, handle));
        }

        let err = match (config.bus_address, config.ids) {
            (Some((bus, address)), _) => NotAtAddress { bus, address },
            (None, Some((vid, pid))) => NotFound { vid, pid },
            (None, None) => NotFound {
                vid: ZTEX_VID,
                pid: ZTEX_PID_MIN,
            },
        };
        info!("No suitable ZTEX device found");
        Err(DeviceAccess { kind: err })
    }

    /// Read the USB strings and the ZTEX descriptor
    fn read_info(
        &mut self,
        device: &RusbDevice<Context>,
        allow_no_descriptor: bool,
    ) -> Result<DeviceInfo, Error> {
        trace!("Device::read_info");
        let device_desc = device.device_descriptor()?;
        let mut info = DeviceInfo {
            vendor_id: device_desc.vendor_id(),
            product_id: device_desc.product_id(),
            bus_number: device.bus_number(),
            address: device.address(),
            manufacturer: self
                .handle
                .read_manufacturer_string_ascii(&device_desc)
                .ok(),
            product: self.handle.read_product_string_ascii(&device_desc).ok(),
            serial_number: self
                .handle
                .read_serial_number_string_ascii(&device_desc)
                .ok(),
            descriptor: None,
        };

        let mut buf = [0u8; ZTEX_DESCRIPTOR_SIZE];
        let result = self
            .read_control(VR_ZTEX_DESCRIPTOR, 0, 0, &mut buf, DEFAULT_CONTROL_TIMEOUT)
            .and_then(|_| ZtexDescriptor::parse(&buf));
        match result {
            Ok(descriptor) => info.descriptor = Some(descriptor),
            Err(e) if allow_no_descriptor => {
                debug!("No ZTEX descriptor: {e}");
            }
            Err(e) => {
                warn!("Failed to read ZTEX descriptor: {e}");
                return Err(DeviceAccess {
                    kind: NoDescriptor {
                        vid: info.vendor_id,
                        pid: info.product_id,
                        message: e.to_string(),
                    },
                });
            }
        }

        Ok(info)
    }
}

/// Public Device functions
impl Device for UsbDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        trace!(
            "Device::read_control request 0x{request:02x} value 0x{value:04x} index 0x{index:04x} buffer.len() {}",
            buffer.len()
        );
        self.handle
            .read_control(REQUEST_TYPE_IN, request, value, index, buffer, timeout)
            .map_err(|e| e.into())
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        trace!(
            "Device::write_control request 0x{request:02x} value 0x{value:04x} index 0x{index:04x} buffer.len() {}",
            buffer.len()
        );
        self.handle
            .write_control(REQUEST_TYPE_OUT, request, value, index, buffer, timeout)
            .map_err(|e| e.into())
    }

    fn write_bulk(
        &mut self,
        endpoint: u8,
        buffer: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        trace!(
            "Device::write_bulk endpoint 0x{endpoint:02x} buffer.len() {}",
            buffer.len()
        );
        self.handle
            .write_bulk(endpoint, buffer, timeout)
            .map_err(|e| e.into())
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        trace!(
            "Device::read_bulk endpoint 0x{endpoint:02x} buffer.len() {}",
            buffer.len()
        );
        self.handle
            .read_bulk(endpoint, buffer, timeout)
            .map_err(|e| e.into())
    }

    fn claim_interface(&mut self, iface: u8) -> Result<(), Error> {
        trace!("Device::claim_interface {iface}");
        self.handle.claim_interface(iface)?;
        self.claimed.insert(iface);
        Ok(())
    }

    fn release_interface(&mut self, iface: u8) -> Result<(), Error> {
        trace!("Device::release_interface {iface}");
        self.claimed.remove(&iface);
        self.handle.release_interface(iface)?;
        Ok(())
    }

    fn is_claimed(&self, iface: u8) -> bool {
        self.claimed.contains(&iface)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        trace!("Device::drop");
        // Release interfaces - ignoring errors since we're in drop
        let claimed: Vec<u8> = self.claimed.iter().copied().collect();
        for iface in claimed {
            let _ = self.release_interface(iface);
        }
        trace!("Exited drop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_ids() {
        assert!(UsbDevice::matches_ids(0x221a, 0x0100, None));
        assert!(UsbDevice::matches_ids(0x221a, 0x01ff, None));
        assert!(!UsbDevice::matches_ids(0x221a, 0x0200, None));
        assert!(!UsbDevice::matches_ids(0x04b4, 0x8613, None));
        assert!(UsbDevice::matches_ids(0x04b4, 0x8613, Some((0x04b4, 0x8613))));
    }

    #[test]
    fn test_device_not_found() {
        let config = UsbDeviceConfig {
            bus_address: Some((255, 255)),
            ..Default::default()
        };
        let result = UsbDevice::new(Some(config));
        // Fails either because there is no USB at all, or no device at 255-255
        assert!(result.is_err());
    }
}
