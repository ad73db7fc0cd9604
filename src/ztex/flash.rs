//! Sector access to the Flash memory and the 2nd Flash memory.
//!
//! Both stores speak the same protocol with different request codes.  The
//! geometry is queried once and cached in the [`Ztex`] facade.
//!
//! Sectors larger than the 2048 byte transfer limit are split into 2048
//! byte sub-transfers, tagged first/middle/last in the index field.
//! Smaller sectors are batched, as many as fit into 2048 bytes, and carry
//! the upper half of the sector number in the index field instead.
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::Duration;

pub const FLASH_EC_NO_ERROR: u8 = 0;
pub const FLASH_EC_CMD_ERROR: u8 = 1;
pub const FLASH_EC_TIMEOUT: u8 = 2;
pub const FLASH_EC_BUSY: u8 = 3;
pub const FLASH_EC_PENDING: u8 = 4;
pub const FLASH_EC_READ_ERROR: u8 = 5;
pub const FLASH_EC_WRITE_ERROR: u8 = 6;
pub const FLASH_EC_NOTSUPPORTED: u8 = 7;
pub const FLASH_EC_RUNTIME: u8 = 8;

/// Number of sub-transfers of a large sector which get the erase timeout
const ERASE_SUB_TRANSFERS: usize = 3;

/// Converts a Flash error code into a message
pub fn flash_error_string(ec: u8) -> String {
    match ec {
        FLASH_EC_NO_ERROR => "USB error".to_string(),
        FLASH_EC_CMD_ERROR => "Command error".to_string(),
        FLASH_EC_TIMEOUT => "Timeout error".to_string(),
        FLASH_EC_BUSY => "Busy".to_string(),
        FLASH_EC_PENDING => "Another operation is pending".to_string(),
        FLASH_EC_READ_ERROR => "Read error".to_string(),
        FLASH_EC_WRITE_ERROR => "Write error".to_string(),
        FLASH_EC_NOTSUPPORTED => "Not supported".to_string(),
        FLASH_EC_RUNTIME => "Firmware runtime error".to_string(),
        n => format!("Error {n}"),
    }
}

/// Selects the Flash instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashKind {
    Primary,
    Secondary,
}

impl FlashKind {
    pub(crate) fn index(self) -> usize {
        match self {
            FlashKind::Primary => 0,
            FlashKind::Secondary => 1,
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            FlashKind::Primary => Capability::Flash,
            FlashKind::Secondary => Capability::Flash2,
        }
    }

    /// Prefix of error messages
    pub fn name(self) -> &'static str {
        match self {
            FlashKind::Primary => "Flash",
            FlashKind::Secondary => "Flash 2",
        }
    }

    fn state_request(self) -> u8 {
        match self {
            FlashKind::Primary => VR_FLASH_STATE,
            FlashKind::Secondary => VR_FLASH2_STATE,
        }
    }

    fn read_request(self) -> u8 {
        match self {
            FlashKind::Primary => VR_FLASH_READ,
            FlashKind::Secondary => VR_FLASH2_READ,
        }
    }

    fn write_command(self) -> u8 {
        match self {
            FlashKind::Primary => VC_FLASH_WRITE,
            FlashKind::Secondary => VC_FLASH2_WRITE,
        }
    }

    fn info_request(self) -> u8 {
        match self {
            FlashKind::Primary => VR_FLASH_INFO,
            FlashKind::Secondary => VR_FLASH2_INFO,
        }
    }

    fn not_installed(self) -> &'static str {
        match self {
            FlashKind::Primary => "No Flash memory installed or",
            FlashKind::Secondary => "No 2nd Flash installed or",
        }
    }
}

/// Flash status and geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashState {
    pub enabled: bool,
    /// Sector size in bytes, 0 if not enabled
    pub sector_size: u32,
    /// Number of sectors, 0 if not enabled
    pub sectors: u32,
    /// Last error code, see [`flash_error_string`]
    pub ec: u8,
}

impl FlashState {
    /// Decodes the 8 byte state response
    pub fn decode(buf: &[u8; 8]) -> Result<Self, Error> {
        let enabled = buf[0] == 1;
        let mut sector_size = 0;
        let mut sectors = 0;
        if enabled {
            let raw = u16::from_le_bytes([buf[1], buf[2]]) as u32;
            sector_size = if raw & 0x8000 != 0 {
                1u32.checked_shl(raw & 0x7fff).ok_or_else(|| {
                    Error::invalid_firmware(format!("Invalid Flash sector size: 0x{raw:04x}"))
                })?
            } else {
                raw
            };
            sectors = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
        }
        Ok(Self {
            enabled,
            sector_size,
            sectors,
            ec: buf[7],
        })
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.sector_size as u64 * self.sectors as u64
    }
}

/// Flash access, see [`Ztex::flash`] and [`Ztex::flash2`]
#[derive(Debug)]
pub struct Flash<'a, D: Device> {
    pub(crate) ztex: &'a mut Ztex<D>,
    kind: FlashKind,
}

impl<'a, D: Device> Flash<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>, kind: FlashKind) -> Self {
        Self { ztex, kind }
    }

    pub fn kind(&self) -> FlashKind {
        self.kind
    }

    fn query_state(&mut self) -> Result<FlashState, Error> {
        let mut buf = [0u8; 8];
        let what = format!("{} State", self.kind.name());
        self.ztex
            .vendor_request_exact(self.kind.state_request(), &what, 0, 0, &mut buf)?;
        FlashState::decode(&buf)
    }

    /// Queries the Flash state and refreshes the cached geometry.  While
    /// the device reports busy, e.g. during initialization after a reset,
    /// the query is repeated every 200ms.
    ///
    /// # Errors
    /// * `Busy` - still busy after 20 queries
    pub fn state(&mut self) -> Result<FlashState, Error> {
        trace!("Flash::state {}", self.kind.name());
        self.ztex.check_capability(self.kind.capability())?;

        for attempt in 1..=FLASH_BUSY_TRIES {
            let state = self.query_state()?;
            if state.ec != FLASH_EC_BUSY {
                debug!(
                    "{} state: enabled {} sector size {} sectors {}",
                    self.kind.name(),
                    state.enabled,
                    state.sector_size,
                    state.sectors
                );
                self.ztex.flash_states[self.kind.index()] = Some(state);
                return Ok(state);
            }
            if attempt < FLASH_BUSY_TRIES {
                self.ztex.delay(FLASH_BUSY_POLL_INTERVAL);
            }
        }
        Err(Error::Busy {
            what: self.kind.name().to_string(),
            tries: FLASH_BUSY_TRIES,
        })
    }

    /// Returns the cached state, querying it on first use
    pub fn cached_state(&mut self) -> Result<FlashState, Error> {
        match self.ztex.flash_states[self.kind.index()] {
            Some(state) => Ok(state),
            None => self.state(),
        }
    }

    /// Queries the current error code.  Never served from cache.
    pub fn ec(&mut self) -> Result<u8, Error> {
        self.ztex.check_capability(self.kind.capability())?;
        let state = self.query_state()?;
        if let Some(cached) = self.ztex.flash_states[self.kind.index()].as_mut() {
            cached.ec = state.ec;
        }
        Ok(state.ec)
    }

    /// Returns the message of the current error code.  If the code itself
    /// cannot be read, the message says so.
    pub fn error_string(&mut self) -> String {
        match self.ec() {
            Ok(ec) => flash_error_string(ec),
            Err(e) => format!("Unknown error (Error receiving errorcode: {e})"),
        }
    }

    pub fn enabled(&mut self) -> Result<bool, Error> {
        Ok(self.cached_state()?.enabled)
    }

    pub fn sector_size(&mut self) -> Result<u32, Error> {
        Ok(self.cached_state()?.sector_size)
    }

    pub fn sectors(&mut self) -> Result<u32, Error> {
        Ok(self.cached_state()?.sectors)
    }

    /// Size in bytes
    pub fn size(&mut self) -> Result<u64, Error> {
        Ok(self.cached_state()?.size())
    }

    /// Raw SPI or SD card diagnostic state (VR 0x43 or 0x47)
    pub fn storage_state(&mut self) -> Result<Vec<u8>, Error> {
        self.ztex.check_capability(self.kind.capability())?;
        let mut buf = [0u8; 23];
        let what = format!("{} Info", self.kind.name());
        let len = self
            .ztex
            .vendor_request(self.kind.info_request(), &what, 0, 0, &mut buf)?;
        Ok(buf[..len].to_vec())
    }

    /// Checks capability and presence, returning the sector size
    pub(crate) fn installed_sector_size(&mut self) -> Result<usize, Error> {
        self.ztex.check_capability(self.kind.capability())?;
        let state = self.cached_state()?;
        if !state.enabled {
            return Err(Error::capability(self.kind.not_installed()));
        }
        Ok(state.sector_size as usize)
    }

    fn prepare(&mut self, num: u32, len: usize) -> Result<usize, Error> {
        let ss = self.installed_sector_size()?;
        let needed = ss * num as usize;
        if len < needed {
            return Err(Error::out_of_range(format!(
                "Buffer is to small: {len} < {needed}"
            )));
        }
        Ok(ss)
    }

    fn large_sector_value(sector: u32) -> Result<u16, Error> {
        u16::try_from(sector).map_err(|_| {
            Error::out_of_range(format!("Sector {sector} not addressable with large sectors"))
        })
    }

    /// Replaces a transport error with the device's error code text
    fn wrap(&mut self, op: &str, err: Error) -> Error {
        if !err.is_transport() {
            return err;
        }
        debug!("{} {op} failed: {err}", self.kind.name());
        let text = self.error_string();
        Error::usb(format!("{} {op}: {text}", self.kind.name()))
    }

    /// Reads `num` sectors starting at `sector` into `buf`
    ///
    /// # Errors
    /// * `Capability` - Flash not supported or not installed
    /// * `OutOfRange` - `buf` is smaller than `num` sectors
    /// * `Usb` - transfer failed, with the device's error code text, e.g.
    ///   "Flash Read: Read error"
    pub fn read_sectors(&mut self, sector: u32, num: u32, buf: &mut [u8]) -> Result<(), Error> {
        trace!("Flash::read_sectors {} sector {sector} num {num}", self.kind.name());
        if num == 0 {
            return Ok(());
        }
        let ss = self.prepare(num, buf.len())?;
        match self.read_inner(sector, num, ss, buf) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.wrap("Read", e)),
        }
    }

    fn read_inner(&mut self, sector: u32, num: u32, ss: usize, buf: &mut [u8]) -> Result<(), Error> {
        let code = self.kind.read_request();
        let what = format!("{} Read", self.kind.name());

        if ss > FLASH_TRANSFER_MAX {
            let iz = (ss - 1) / FLASH_TRANSFER_MAX;
            for sn in 0..num as usize {
                let value = Self::large_sector_value(sector + sn as u32)?;
                let base = sn * ss;
                for i in 0..iz {
                    let index = if i == 0 { FLASH_INDEX_FIRST } else { FLASH_INDEX_MIDDLE };
                    let off = base + i * FLASH_TRANSFER_MAX;
                    self.ztex.vendor_request_exact(
                        code,
                        &what,
                        value,
                        index,
                        &mut buf[off..off + FLASH_TRANSFER_MAX],
                    )?;
                }
                let off = base + iz * FLASH_TRANSFER_MAX;
                self.ztex.vendor_request_exact(
                    code,
                    &what,
                    value,
                    FLASH_INDEX_LAST,
                    &mut buf[off..base + ss],
                )?;
            }
        } else {
            let per_transfer = (FLASH_TRANSFER_MAX / ss).max(1) as u32;
            let mut sector = sector;
            let mut remaining = num;
            let mut bp = 0;
            while remaining > 0 {
                let n = remaining.min(per_transfer);
                let len = ss * n as usize;
                self.ztex.vendor_request_exact(
                    code,
                    &what,
                    sector as u16,
                    (sector >> 16) as u16,
                    &mut buf[bp..bp + len],
                )?;
                bp += len;
                sector += n;
                remaining -= n;
            }
        }
        Ok(())
    }

    /// Reads one sector
    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read_sectors(sector, 1, buf)
    }

    /// Writes `num` sectors starting at `sector` from `buf`.  Callers are
    /// responsible for read-back verification.
    ///
    /// The first sub-transfers of a large sector may erase and get the
    /// longer erase timeout.  The session timeout is never modified.
    ///
    /// # Errors
    /// As [`Flash::read_sectors`], with "Write" in the message
    pub fn write_sectors(&mut self, sector: u32, num: u32, buf: &[u8]) -> Result<(), Error> {
        trace!("Flash::write_sectors {} sector {sector} num {num}", self.kind.name());
        if num == 0 {
            return Ok(());
        }
        let ss = self.prepare(num, buf.len())?;
        match self.write_inner(sector, num, ss, buf) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.wrap("Write", e)),
        }
    }

    fn write_inner(&mut self, sector: u32, num: u32, ss: usize, buf: &[u8]) -> Result<(), Error> {
        let code = self.kind.write_command();
        let what = format!("{} Write", self.kind.name());
        let write_timeout = self.ztex.config().flash_write_timeout;
        let erase_timeout = self.ztex.config().flash_erase_timeout;
        let timeout = |i: usize| -> Duration {
            if i < ERASE_SUB_TRANSFERS {
                erase_timeout
            } else {
                write_timeout
            }
        };

        if ss > FLASH_TRANSFER_MAX {
            let iz = (ss - 1) / FLASH_TRANSFER_MAX;
            for sn in 0..num as usize {
                let value = Self::large_sector_value(sector + sn as u32)?;
                let base = sn * ss;
                for i in 0..iz {
                    let index = if i == 0 { FLASH_INDEX_FIRST } else { FLASH_INDEX_MIDDLE };
                    let off = base + i * FLASH_TRANSFER_MAX;
                    self.ztex.vendor_command_timeout(
                        code,
                        &what,
                        value,
                        index,
                        &buf[off..off + FLASH_TRANSFER_MAX],
                        timeout(i),
                    )?;
                }
                let off = base + iz * FLASH_TRANSFER_MAX;
                self.ztex.vendor_command_timeout(
                    code,
                    &what,
                    value,
                    FLASH_INDEX_LAST,
                    &buf[off..base + ss],
                    timeout(iz),
                )?;
            }
        } else {
            let per_transfer = (FLASH_TRANSFER_MAX / ss).max(1) as u32;
            let mut sector = sector;
            let mut remaining = num;
            let mut bp = 0;
            while remaining > 0 {
                let n = remaining.min(per_transfer);
                let len = ss * n as usize;
                self.ztex.vendor_command_timeout(
                    code,
                    &what,
                    sector as u16,
                    (sector >> 16) as u16,
                    &buf[bp..bp + len],
                    write_timeout,
                )?;
                bp += len;
                sector += n;
                remaining -= n;
            }
        }
        Ok(())
    }

    /// Writes one sector
    pub fn write_sector(&mut self, sector: u32, buf: &[u8]) -> Result<(), Error> {
        self.write_sectors(sector, 1, buf)
    }
}
