use super::{Ztex, ZtexConfig};
use crate::device::usb::{UsbDevice, UsbDeviceConfig};
use crate::Error;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rusb::{Context, UsbContext};
use std::time::Duration;

/// A builder pattern for opening a ZTEX board over USB and creating the
/// [`Ztex`] facade with custom configuration.
///
/// Allows selecting the device (IDs, bus/address, serial) and setting the
/// session timeouts and flags before opening it.
///
/// # Examples
///
/// ## A simple example
///
/// ```no_run
/// use ztex::ZtexBuilder;
///
/// // Opens the first ZTEX device found
/// let ztex = ZtexBuilder::new()
///     .build()
///     .unwrap();
/// ```
///
/// ## A more complex example
///
/// ```no_run
/// use ztex::ZtexBuilder;
/// use std::time::Duration;
///
/// let ztex = ZtexBuilder::new()
///     .bus_address(1, 12)
///     .control_timeout(Duration::from_millis(2000))
///     .extra_checks(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct ZtexBuilder {
    usb_context: Option<Context>,
    ids: Option<(u16, u16)>,
    bus_address: Option<(u8, u8)>,
    serial_number: Option<String>,
    allow_no_descriptor: bool,
    config: ZtexConfig,
}

impl ZtexBuilder {
    /// Creates a new [`ZtexBuilder`] with default values.
    ///
    /// The session settings start as [`ZtexConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the device and creates the facade using the configured
    /// parameters.
    ///
    /// # Returns
    /// * `Ok(Ztex<UsbDevice>)` - the opened device
    /// * `Err(Error)` - if no matching device was found or it could not be
    ///   opened
    ///
    /// # Notes:
    /// Uses default values for any parameters that weren't set
    pub fn build(&mut self) -> Result<Ztex<UsbDevice>, Error> {
        if self.usb_context.is_none() {
            let mut context = Context::new()?;
            context.set_log_level(rusb::LogLevel::Info);
            self.usb_context = Some(context);
        }

        let device_config = UsbDeviceConfig {
            context: self.usb_context.take(),
            ids: self.ids,
            bus_address: self.bus_address,
            serial_number: self.serial_number.clone(),
            allow_no_descriptor: self.allow_no_descriptor,
        };
        trace!("Creating USB device {device_config:?}");
        let device = UsbDevice::new(Some(device_config))?;
        Ztex::new(device, self.config.clone())
    }

    /// Sets a custom USB context for device communication.
    ///
    /// This allows setting the USB debug log level via
    /// `context.set_log_level()` using `rusb::LogLevel`.
    ///
    /// # Note:
    /// If not set, a new [`rusb::Context`] is created with LogLevel::Info
    pub fn context(&mut self, context: Context) -> &mut Self {
        self.usb_context = Some(context);
        self
    }

    /// Matches an explicit vendor and product ID instead of the ZTEX range,
    /// e.g. 0x04b4:0x8613 for an unprogrammed FX2
    pub fn ids(&mut self, vid: u16, pid: u16) -> &mut Self {
        self.ids = Some((vid, pid));
        self
    }

    pub fn bus_address(&mut self, bus: u8, address: u8) -> &mut Self {
        self.bus_address = Some((bus, address));
        self
    }

    /// Matches the USB serial number string
    pub fn serial(&mut self, serial: &str) -> &mut Self {
        self.serial_number = Some(serial.to_string());
        self
    }

    /// Opens devices without a ZTEX descriptor, to upload firmware to RAM
    pub fn allow_no_descriptor(&mut self, allow: bool) -> &mut Self {
        self.allow_no_descriptor = allow;
        self
    }

    /// Timeout of ordinary vendor requests and commands
    pub fn control_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.control_timeout = duration;
        self
    }

    pub fn flash_write_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.flash_write_timeout = duration;
        self
    }

    pub fn flash_erase_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.flash_erase_timeout = duration;
        self
    }

    pub fn bulk_timeout(&mut self, duration: Duration) -> &mut Self {
        self.config.bulk_timeout = duration;
        self
    }

    pub fn temp_sensor_interval(&mut self, duration: Duration) -> &mut Self {
        self.config.temp_sensor_interval = duration;
        self
    }

    /// Suppresses the outdated default interface warning
    pub fn disable_warnings(&mut self, disable: bool) -> &mut Self {
        self.config.disable_warnings = disable;
        self
    }

    /// Warns about byte count and INIT_B mismatches after FPGA configuration
    pub fn extra_checks(&mut self, enable: bool) -> &mut Self {
        self.config.extra_checks = enable;
        self
    }

    /// The session settings the facade will be created with
    pub fn config(&self) -> &ZtexConfig {
        &self.config
    }
}
