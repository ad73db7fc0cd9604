//! [`Ztex`] is the main interface to a ZTEX board.  Its use is preferred over
//! direct use of [`Device`].
//!
//! The facade owns the transport and every per-session cache (capability
//! table, Flash geometry, debug cursors, default interface info).  Feature
//! modules such as [`Flash`] or [`Fpga`] are short-lived views that borrow
//! the facade, check the capability they need and then issue vendor
//! requests through the dispatcher.
use crate::capability::{Capability, CapabilityTable};
use crate::constants::*;
use crate::device::{product_id_string, product_ids_compatible};
use crate::{Device, DeviceInfo, Error, ZtexDescriptor};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::Duration;

pub mod bitstream;
pub mod bootsector;
pub mod builder;
pub mod config_data;
pub mod debug;
pub mod default;
mod dispatch;
pub mod eeprom;
pub mod firmware;
pub mod flash;
pub mod fpga;
pub mod mac_eeprom;
pub mod sensor;
pub mod xmega;

pub use bitstream::BitSwap;
pub use builder::ZtexBuilder;
pub use config_data::ConfigData;
pub use debug::{Debug2Header, Debug2Log, DebugLog};
pub use default::DefaultInterface;
pub use eeprom::{Eeprom, EepromState};
pub use flash::{Flash, FlashKind, FlashState};
pub use fpga::{Fpga, FpgaState, HsOutcome, MultiFpgaInfo};
pub use mac_eeprom::MacEeprom;
pub use sensor::Usb3Errors;
pub use xmega::{Xmega, XmegaMemory, XmegaState};

/// Settings of a [`Ztex`] session
#[derive(Debug, Clone, PartialEq)]
pub struct ZtexConfig {
    /// Timeout of ordinary vendor requests and commands
    pub control_timeout: Duration,
    /// Timeout of Flash sector writes
    pub flash_write_timeout: Duration,
    /// Timeout of the first sub-transfers of a large Flash sector write
    pub flash_erase_timeout: Duration,
    /// Timeout of high speed bitstream bulk transfers
    pub bulk_timeout: Duration,
    /// Suppresses the outdated default interface warning
    pub disable_warnings: bool,
    /// Warn about byte count and INIT_B mismatches after a successful FPGA
    /// configuration
    pub extra_checks: bool,
    /// Minimum age of a cached temperature sensor reading before it is
    /// refreshed.  Values below 40ms are raised to 40ms.
    pub temp_sensor_interval: Duration,
}

impl Default for ZtexConfig {
    fn default() -> Self {
        Self {
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            flash_write_timeout: DEFAULT_FLASH_WRITE_TIMEOUT,
            flash_erase_timeout: DEFAULT_FLASH_ERASE_TIMEOUT,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
            disable_warnings: false,
            extra_checks: false,
            temp_sensor_interval: TEMP_SENSOR_DEFAULT_INTERVAL,
        }
    }
}

/// The [`Ztex`] struct is the capability-checked command facade over one
/// device session.
///
/// Use [`ZtexBuilder`] to open a USB device, or [`Ztex::new`] with any
/// [`Device`] implementation.
#[derive(Debug)]
pub struct Ztex<D: Device> {
    device: D,
    config: ZtexConfig,
    capabilities: CapabilityTable,
    config_data: Option<ConfigData>,
    pub(crate) flash_states: [Option<FlashState>; 2],
    pub(crate) debug_state: debug::DebugState,
    pub(crate) debug2_log_idx: u32,
    pub(crate) default_info: Option<default::DefaultInfo>,
    pub(crate) default_warned: bool,
    pub(crate) xmega_state: Option<XmegaState>,
    pub(crate) multi_fpga: Option<fpga::MultiFpgaInfo>,
    pub(crate) temp_sensor: Option<sensor::TempReading>,
}

impl<D: Device> Ztex<D> {
    /// Creates the facade over an opened device.
    ///
    /// The capability table is taken from the device's ZTEX descriptor.  If
    /// the firmware supports the MAC EEPROM, the configuration record is
    /// read and attached when its signature is valid.
    ///
    /// # Args:
    /// * device - the opened transport
    /// * config - session settings
    ///
    /// # Errors
    /// Only transport errors while reading the configuration record are
    /// logged, never returned.  This function currently always succeeds,
    /// but keeps the `Result` so that attach-time checks can be added.
    pub fn new(device: D, config: ZtexConfig) -> Result<Self, Error> {
        trace!("Ztex::new config {config:?}");
        let capabilities = device.info().capabilities();
        let mut ztex = Self {
            device,
            config,
            capabilities,
            config_data: None,
            flash_states: [None, None],
            debug_state: debug::DebugState::default(),
            debug2_log_idx: 0,
            default_info: None,
            default_warned: false,
            xmega_state: None,
            multi_fpga: None,
            temp_sensor: None,
        };

        if ztex.valid() && ztex.supports(Capability::MacEeprom) {
            match ztex.mac_eeprom().read_config_data() {
                Ok(Some(cd)) => {
                    debug!("Attached configuration record: {}", cd.name());
                    ztex.config_data = Some(cd);
                }
                Ok(None) => debug!("No configuration record in MAC EEPROM"),
                Err(e) => warn!("Unable to read configuration record: {e}"),
            }
        }

        Ok(ztex)
    }

    /// The underlying transport
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Consumes the facade, returning the transport
    pub fn into_device(self) -> D {
        self.device
    }

    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn descriptor(&self) -> Option<&ZtexDescriptor> {
        self.device.info().descriptor.as_ref()
    }

    pub fn config(&self) -> &ZtexConfig {
        &self.config
    }

    /// Sets the timeout of ordinary vendor requests and commands
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.control_timeout = timeout;
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Returns true if the firmware speaks interface version 1
    pub fn valid(&self) -> bool {
        self.descriptor()
            .map(|d| d.interface_version == INTERFACE_VERSION)
            .unwrap_or(false)
    }

    /// Checks the interface version
    ///
    /// # Errors
    /// * `InvalidFirmware` - if there is no ZTEX descriptor, or it reports
    ///   another interface version
    pub fn check_valid(&self) -> Result<(), Error> {
        match self.descriptor() {
            None => Err(Error::invalid_firmware("No ZTEX descriptor")),
            Some(d) if d.interface_version != INTERFACE_VERSION => {
                Err(Error::invalid_firmware(format!(
                    "Wrong interface: {}, expected: {INTERFACE_VERSION}",
                    d.interface_version
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// Returns true if the firmware is valid and announces `capability`
    pub fn supports(&self, capability: Capability) -> bool {
        self.valid() && self.capabilities.supports(capability)
    }

    /// Checks the interface version and then the capability bit at
    /// (`byte`, `bit`)
    ///
    /// # Errors
    /// * `InvalidFirmware` - see [`Ztex::check_valid`]
    /// * `Capability` - the bit is unset
    pub fn check_capability_bit(&self, byte: usize, bit: usize) -> Result<(), Error> {
        self.check_valid()?;
        if self.capabilities.is_set(byte, bit) {
            return Ok(());
        }
        let message = Capability::ALL
            .iter()
            .find(|c| c.position() == (byte, bit))
            .map(|c| c.description().to_string())
            .unwrap_or_else(|| format!("Capability {byte}.{bit}"));
        debug!("Capability check failed: {message}");
        Err(Error::capability(message))
    }

    /// Checks the interface version and then `capability`
    pub fn check_capability(&self, capability: Capability) -> Result<(), Error> {
        let (byte, bit) = capability.position();
        self.check_capability_bit(byte, bit)
    }

    /// Returns true if the device runs FX3 firmware
    pub fn is_fx3(&self) -> bool {
        self.capabilities.supports(Capability::Fx3)
    }

    /// Compares the device's product ID with `product_id`, treating zero
    /// bytes as wildcards
    pub fn compatible(&self, product_id: &[u8; 4]) -> bool {
        self.descriptor()
            .map(|d| product_ids_compatible(&d.product_id, product_id))
            .unwrap_or(false)
    }

    /// # Errors
    /// * `IncompatibleFirmware` - if [`Ztex::compatible`] is false
    pub fn check_compatible(&self, product_id: &[u8; 4]) -> Result<(), Error> {
        if self.compatible(product_id) {
            return Ok(());
        }
        let current = self
            .descriptor()
            .map(|d| product_id_string(&d.product_id))
            .unwrap_or_else(|| "none".to_string());
        Err(Error::IncompatibleFirmware {
            message: format!(
                "Incompatible productId's: Current firmware: {current}  Img File: {}",
                product_id_string(product_id)
            ),
        })
    }

    /// The attached configuration record, if any
    pub fn config_data(&self) -> Option<&ConfigData> {
        self.config_data.as_ref()
    }

    /// Attaches a configuration record.  While attached, MAC EEPROM writes
    /// below offset 80 are refused.
    pub fn attach_config(&mut self, config_data: ConfigData) {
        self.config_data = Some(config_data);
    }

    /// Detaches the configuration record, returning it
    pub fn detach_config(&mut self) -> Option<ConfigData> {
        self.config_data.take()
    }

    pub(crate) fn config_data_mut(&mut self) -> Option<&mut ConfigData> {
        self.config_data.as_mut()
    }

    /// Lists the supported capabilities, see [`CapabilityTable::info`]
    pub fn capability_info(&self, prefix: &str) -> String {
        self.capabilities.info(prefix)
    }

    /// EEPROM module
    pub fn eeprom(&mut self) -> Eeprom<'_, D> {
        Eeprom::new(self)
    }

    /// Primary Flash module
    pub fn flash(&mut self) -> Flash<'_, D> {
        Flash::new(self, FlashKind::Primary)
    }

    /// 2nd Flash module
    pub fn flash2(&mut self) -> Flash<'_, D> {
        Flash::new(self, FlashKind::Secondary)
    }

    /// MAC EEPROM module
    pub fn mac_eeprom(&mut self) -> MacEeprom<'_, D> {
        MacEeprom::new(self)
    }

    /// FPGA configuration module
    pub fn fpga(&mut self) -> Fpga<'_, D> {
        Fpga::new(self)
    }

    /// XMEGA NVM module
    pub fn xmega(&mut self) -> Xmega<'_, D> {
        Xmega::new(self)
    }

    /// Ring buffer debug log (debug helper 1)
    pub fn debug_log(&mut self) -> DebugLog<'_, D> {
        DebugLog::new(self)
    }

    /// Indexed debug log (debug helper 2)
    pub fn debug2_log(&mut self) -> Debug2Log<'_, D> {
        Debug2Log::new(self)
    }

    /// Default firmware interface
    pub fn default_interface(&mut self) -> DefaultInterface<'_, D> {
        DefaultInterface::new(self)
    }
}

impl<D: Device> std::fmt::Display for Ztex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        write!(
            f,
            "bus={:03}  device={:03}  ID={:04x}:{:04x}",
            info.bus_number, info.address, info.vendor_id, info.product_id
        )?;
        if let Some(d) = self.descriptor() {
            write!(
                f,
                "  productID={}  fwVer={}  ifVer={}",
                product_id_string(&d.product_id),
                d.fw_version,
                d.interface_version
            )?;
        }
        if let Some(cd) = &self.config_data {
            write!(f, "  board={}", cd.name())?;
        }
        Ok(())
    }
}

/// Renders a byte count the way ZTEX tools do, e.g. 1234567890 becomes
/// "1G153M384K722"
pub fn to_human_str(i: i64) -> String {
    if i == 0 {
        return "0".to_string();
    }
    let mut n = i.unsigned_abs();
    let mut parts = vec![];
    for unit in ["", "K", "M"] {
        if n & 1023 != 0 {
            parts.push(format!("{}{unit}", n & 1023));
        }
        n >>= 10;
    }
    if n != 0 {
        parts.push(format!("{n}G"));
    }
    parts.reverse();
    let s = parts.concat();
    if i < 0 {
        format!("-{s}")
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    fn ztex(caps: &[Capability]) -> Ztex<MockDevice> {
        Ztex::new(MockDevice::new(caps), ZtexConfig::default()).unwrap()
    }

    #[test]
    fn test_to_human_str() {
        assert_eq!(to_human_str(1234567890), "1G153M384K722");
        assert_eq!(to_human_str(0), "0");
        assert_eq!(to_human_str(4096), "4K");
        assert_eq!(to_human_str(-1025), "-1K1");
    }

    #[test]
    fn test_check_capability_names_feature() {
        let z = ztex(&[Capability::Fpga]);
        assert!(z.check_capability(Capability::Fpga).is_ok());
        assert_eq!(
            z.check_capability(Capability::HsFpga),
            Err(Error::capability("High speed FPGA configuration"))
        );
        assert_eq!(
            z.check_capability_bit(4, 2),
            Err(Error::capability("Capability 4.2"))
        );
    }

    #[test]
    fn test_check_valid_wrong_interface() {
        let mut device = MockDevice::new(&[Capability::Fpga]);
        let mut info = device.info().clone();
        if let Some(d) = info.descriptor.as_mut() {
            d.interface_version = 2;
        }
        device = MockDevice::with_info(info);
        let z = Ztex::new(device, ZtexConfig::default()).unwrap();
        assert_eq!(
            z.check_capability(Capability::Fpga),
            Err(Error::invalid_firmware("Wrong interface: 2, expected: 1"))
        );
    }

    #[test]
    fn test_compatibility() {
        let z = ztex(&[]);
        assert!(z.compatible(&[10, 30, 12, 0]));
        assert!(z.check_compatible(&[10, 31, 0, 0]).is_err());
    }

    #[test]
    fn test_config_record_attached_at_creation() {
        let mut device = MockDevice::new(&[Capability::MacEeprom]);
        let mut record = vec![0u8; 128];
        record[0..3].copy_from_slice(b"CD0");
        record[3] = 3;
        record[4] = 2;
        record[5] = 18;
        device.on_request_reply(VR_MAC_EEPROM_READ, record);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        assert_eq!(z.config_data().map(|c| c.board_number), Some(18));
        assert!(z.detach_config().is_some());
        assert!(z.config_data().is_none());
    }
}
