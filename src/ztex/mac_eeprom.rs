//! The MAC EEPROM, which holds the MAC address and the board's
//! configuration record
use super::{ConfigData, Ztex};
use crate::capability::Capability;
use crate::constants::*;
use crate::ztex::config_data::CONFIG_DATA_SIZE;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// MAC EEPROM access, see [`Ztex::mac_eeprom`]
#[derive(Debug)]
pub struct MacEeprom<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

impl<'a, D: Device> MacEeprom<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    /// Writes `data` at `addr` (VC 0x3C)
    ///
    /// # Errors
    /// * `Capability` - MAC EEPROM not supported, or `addr` is below 80
    ///   while a configuration record is attached.  Nothing is sent in this
    ///   case.  Use [`Ztex::detach_config`] to lift the protection.
    pub fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        trace!("MacEeprom::write addr {addr} len {}", data.len());
        self.ztex.check_capability(Capability::MacEeprom)?;
        if self.ztex.config_data().is_some() && addr < CONFIG_PROTECTED_SIZE {
            warn!("Refusing to overwrite configuration data at MAC EEPROM address {addr}");
            return Err(Error::capability(
                "Overwriting configuration data in MAC EEPROM",
            ));
        }
        self.write_unguarded(addr, data)
    }

    pub(crate) fn write_unguarded(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        self.ztex.check_capability(Capability::MacEeprom)?;
        self.ztex
            .vendor_command(VC_MAC_EEPROM_WRITE, "MAC EEPROM Write", addr, 0, data)?;
        self.ztex.delay(EEPROM_SETTLE);
        Ok(())
    }

    /// Reads `buf.len()` bytes from `addr` (VR 0x3B)
    pub fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error> {
        trace!("MacEeprom::read addr {addr} len {}", buf.len());
        self.ztex.check_capability(Capability::MacEeprom)?;
        self.ztex
            .vendor_request_exact(VR_MAC_EEPROM_READ, "MAC EEPROM Read", addr, 0, buf)?;
        self.ztex.delay(EEPROM_SETTLE);
        Ok(())
    }

    /// Returns true if the MAC EEPROM is ready (VR 0x3D)
    pub fn state(&mut self) -> Result<bool, Error> {
        self.ztex.check_capability(Capability::MacEeprom)?;
        let mut buf = [0u8; 1];
        self.ztex
            .vendor_request_exact(VR_MAC_EEPROM_STATE, "MAC EEPROM State", 0, 0, &mut buf)?;
        Ok(buf[0] == 0)
    }

    /// Reads the 6 byte MAC address
    pub fn mac_address(&mut self) -> Result<[u8; 6], Error> {
        let mut mac = [0u8; 6];
        self.read(MAC_ADDRESS_OFFSET, &mut mac)?;
        Ok(mac)
    }

    /// Reads the configuration record from offset 0.  Returns None if the
    /// signature does not match.
    pub fn read_config_data(&mut self) -> Result<Option<ConfigData>, Error> {
        let mut buf = [0u8; CONFIG_DATA_SIZE];
        self.read(0, &mut buf)?;
        Ok(ConfigData::parse(&buf))
    }
}
