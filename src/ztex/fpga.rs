//! FPGA configuration.
//!
//! The FPGA moves from unconfigured to configured by uploading a bitstream,
//! either in 2048 byte control transfers (low speed) or over a bulk
//! endpoint (high speed).  After each upload the firmware reports the DONE
//! state together with the number of bytes and checksum it received.
//! Failed uploads are retried from a fresh reset.
use super::bitstream::{read_bitstream, BitSwap, Bitstream};
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

const FLASH_RESULT_STRINGS: [&str; 5] = [
    "Configuration successful",
    "FPGA already configured",
    "Flash error",
    "No bitstream found",
    "Configuration error",
];

/// FPGA state as reported by VR 0x30
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpgaState {
    pub configured: bool,
    /// 8 bit sum of the bytes received since the last reset
    pub checksum: u8,
    /// Bytes received since the last reset
    pub bytes: u32,
    /// INIT_B history, 222 after a clean configuration
    pub init_b: u8,
    /// Result of the configuration from Flash at power-up
    pub flash_result: i8,
    /// Whether the firmware reverses bits of bitstreams loaded from Flash
    pub flash_bit_swap: bool,
}

impl FpgaState {
    pub fn decode(buf: &[u8; 9]) -> Self {
        Self {
            configured: buf[0] == 0,
            checksum: buf[1],
            bytes: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            init_b: buf[6],
            flash_result: buf[7] as i8,
            flash_bit_swap: buf[8] != 0,
        }
    }

    /// Text of [`FpgaState::flash_result`], if it is a known code
    pub fn flash_result_str(&self) -> Option<&'static str> {
        usize::try_from(self.flash_result)
            .ok()
            .and_then(|i| FLASH_RESULT_STRINGS.get(i).copied())
    }
}

impl fmt::Display for FpgaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={};  checksum={}; INIT_B_HIST={}; flash_configuration_result={}",
            self.bytes, self.checksum, self.init_b, self.flash_result
        )?;
        if let Some(s) = self.flash_result_str() {
            write!(f, " ({s})")?;
        }
        Ok(())
    }
}

/// Multi-FPGA board layout as reported by VR 0x50
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiFpgaInfo {
    pub count: u16,
    pub selected: u8,
    pub parallel_config: bool,
}

impl Default for MultiFpgaInfo {
    fn default() -> Self {
        Self {
            count: 1,
            selected: 0,
            parallel_config: false,
        }
    }
}

/// Result of a high speed configuration attempt, see
/// [`Fpga::try_upload_hs`]
#[derive(Debug, PartialEq)]
pub enum HsOutcome {
    /// Configured, with the upload time
    Configured(Duration),
    /// The firmware has no high speed configuration
    CapabilityUnsupported,
    /// USB transfer or interface claim failed
    TransportFailed(Error),
    /// The FPGA did not configure
    UploadFailed(Error),
}

/// FPGA access, see [`Ztex::fpga`]
#[derive(Debug)]
pub struct Fpga<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

impl<'a, D: Device> Fpga<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    /// Queries the FPGA state
    pub fn state(&mut self) -> Result<FpgaState, Error> {
        self.ztex.check_capability(Capability::Fpga)?;
        let mut buf = [0u8; 9];
        self.ztex
            .vendor_request_exact(VR_FPGA_STATE, "Get FPGA State", 0, 0, &mut buf)?;
        let state = FpgaState::decode(&buf);
        trace!("FPGA state: {state}");
        Ok(state)
    }

    pub fn configured(&mut self) -> Result<bool, Error> {
        Ok(self.state()?.configured)
    }

    /// "FPGA configured" or "FPGA unconfigured"
    pub fn configuration_str(&mut self) -> Result<&'static str, Error> {
        Ok(if self.configured()? {
            "FPGA configured"
        } else {
            "FPGA unconfigured"
        })
    }

    /// Resets the FPGA into the unconfigured state (VC 0x31)
    pub fn reset(&mut self) -> Result<(), Error> {
        trace!("Fpga::reset");
        self.ztex.check_capability(Capability::Fpga)?;
        self.ztex
            .vendor_command(VC_FPGA_RESET, "Reset FPGA", 0, 0, &[])
    }

    fn extra_checks(&self, state: &FpgaState, sent: usize) {
        if !self.ztex.config().extra_checks {
            return;
        }
        if state.bytes != 0 && state.bytes as usize != sent {
            warn!(
                "Possible FPGA configuration data loss: {} bytes got lost",
                sent as i64 - state.bytes as i64
            );
        }
        if state.init_b != INIT_B_CLEAN {
            warn!("Possible Bitstream CRC error: INIT_B_HIST={}", state.init_b);
        }
    }

    /// Configures the FPGA in low speed mode, returning the upload time.
    ///
    /// The whole bitstream is read from `reader` first.  Up to 10 attempts
    /// are made, each starting with an FPGA reset.
    ///
    /// # Errors
    /// * `AlreadyConfigured` - the FPGA is configured and `force` is false
    /// * `BitstreamRead` - reading failed or the size is invalid
    /// * `BitstreamUpload` - the last attempt failed, with byte count and
    ///   checksum figures
    pub fn upload_ls<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        force: bool,
        swap: BitSwap,
    ) -> Result<Duration, Error> {
        trace!("Fpga::upload_ls force {force} swap {swap:?}");
        self.ztex.check_capability(Capability::Fpga)?;
        if !force && self.configured()? {
            return Err(Error::AlreadyConfigured);
        }
        let data = read_bitstream(reader)?;
        let bitstream = Bitstream::low_speed(&data, swap)?;
        debug!(
            "Low speed configuration: {} bytes in {} transfers",
            bitstream.size(),
            bitstream.chunks().len()
        );

        let mut attempt = 1;
        let elapsed = loop {
            self.reset()?;
            let start = Instant::now();
            match self.send_ls(&bitstream) {
                Ok(()) => break start.elapsed(),
                Err(e @ Error::BitstreamUpload { .. }) if attempt < FPGA_LS_TRIES => {
                    warn!("{e}: Retrying it ...");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        self.ztex.delay(FPGA_LS_SETTLE);
        info!("FPGA configured in {} ms", elapsed.as_millis());
        Ok(elapsed)
    }

    fn send_ls(&mut self, bitstream: &Bitstream) -> Result<(), Error> {
        for chunk in bitstream.chunks() {
            self.ztex
                .vendor_command(VC_FPGA_SEND, "Send FPGA Data", 0, 0, chunk)?;
        }
        let state = self.state()?;
        let sent = bitstream.size();
        if !state.configured {
            return Err(Error::bitstream_upload(format!(
                "FPGA configuration failed: DONE pin does not go high (size={} ,  {} bytes got lost;  checksum={} , should be {};  INIT_B_HIST={})",
                state.bytes,
                sent as i64 - state.bytes as i64,
                state.checksum,
                bitstream.checksum(),
                state.init_b
            )));
        }
        self.extra_checks(&state, sent);
        Ok(())
    }

    /// Configures the FPGA in high speed mode, returning the upload time.
    ///
    /// Endpoint and interface are queried with VR 0x33.  The interface is
    /// claimed for the upload unless this handle already holds it.  Up to 3
    /// attempts are made.
    ///
    /// # Errors
    /// As [`Fpga::upload_ls`], plus `Capability` if high speed
    /// configuration is not supported and `Usb` if a bulk transfer fails
    pub fn upload_hs<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        force: bool,
        swap: BitSwap,
    ) -> Result<Duration, Error> {
        trace!("Fpga::upload_hs force {force} swap {swap:?}");
        self.ztex.check_capability(Capability::HsFpga)?;
        let mut settings = [0u8; 2];
        self.ztex.vendor_request_exact(
            VR_FPGA_HS_INFO,
            "Get HS FPGA Settings",
            0,
            0,
            &mut settings,
        )?;
        let (endpoint, iface) = (settings[0], settings[1]);

        if !force && self.configured()? {
            return Err(Error::AlreadyConfigured);
        }
        let data = read_bitstream(reader)?;
        let bitstream = Bitstream::high_speed(&data, swap)?;
        debug!(
            "High speed configuration: {} bytes to endpoint {endpoint} interface {iface}",
            bitstream.size()
        );

        let claim = !self.ztex.device().is_claimed(iface);
        if claim {
            self.ztex.device_mut().claim_interface(iface)?;
        }
        let result = self.hs_attempts(&bitstream, endpoint);
        if claim {
            if let Err(e) = self.ztex.device_mut().release_interface(iface) {
                warn!("Failed to release interface {iface}: {e}");
            }
        }
        let elapsed = result?;

        self.ztex.delay(FPGA_HS_SETTLE);
        info!("FPGA configured in {} ms", elapsed.as_millis());
        Ok(elapsed)
    }

    fn hs_attempts(&mut self, bitstream: &Bitstream, endpoint: u8) -> Result<Duration, Error> {
        let mut attempt = 1;
        loop {
            self.ztex.vendor_command(
                VC_FPGA_HS_START,
                "Start HS FPGA Configuration",
                0,
                0,
                &[],
            )?;
            let start = Instant::now();
            match self.send_hs(bitstream, endpoint) {
                Ok(()) => return Ok(start.elapsed()),
                Err(e @ Error::BitstreamUpload { .. }) if attempt < FPGA_HS_TRIES => {
                    if attempt > 1 || self.ztex.config().extra_checks {
                        warn!("{e}: Retrying it ...");
                    } else {
                        debug!("{e}: Retrying it ...");
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_hs(&mut self, bitstream: &Bitstream, endpoint: u8) -> Result<(), Error> {
        let timeout = self.ztex.config().bulk_timeout;
        for chunk in bitstream.chunks() {
            let written = match self.ztex.device_mut().write_bulk(endpoint, chunk, timeout) {
                Ok(n) => n,
                Err(e) => {
                    debug!("Bulk write failed, retrying once: {e}");
                    self.ztex
                        .device_mut()
                        .write_bulk(endpoint, chunk, timeout)
                        .map_err(|e| e.context("Error sending Bitstream"))?
                }
            };
            if written != chunk.len() {
                return Err(Error::usb(format!(
                    "Error sending Bitstream: Sent {written} of {} bytes",
                    chunk.len()
                )));
            }
        }

        let tail = (bitstream.size() % FPGA_HS_TRANSACTION_SIZE) as u64;
        self.ztex.delay(Duration::from_millis(tail / 1000 + 10));
        self.ztex.vendor_command(
            VC_FPGA_HS_FINISH,
            "Finish HS FPGA Configuration",
            0,
            0,
            &[],
        )?;

        let state = self.state()?;
        let sent = bitstream.size();
        if !state.configured {
            let lost = if state.bytes == 0 {
                String::new()
            } else {
                format!("; {} bytes got lost", sent as i64 - state.bytes as i64)
            };
            return Err(Error::bitstream_upload(format!(
                "FPGA configuration failed: DONE pin does not go high, possible USB transfer errors (INIT_B_HIST={}{lost})",
                state.init_b
            )));
        }
        self.extra_checks(&state, sent);
        Ok(())
    }

    /// Attempts a high speed configuration and classifies the result.
    /// Errors that no low speed fallback could fix, e.g. `AlreadyConfigured`
    /// or `BitstreamRead`, are returned as `Err`.
    pub fn try_upload_hs<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        force: bool,
        swap: BitSwap,
    ) -> Result<HsOutcome, Error> {
        match self.upload_hs(reader, force, swap) {
            Ok(elapsed) => Ok(HsOutcome::Configured(elapsed)),
            Err(Error::Capability { .. }) => Ok(HsOutcome::CapabilityUnsupported),
            Err(e @ (Error::Usb(_) | Error::DeviceAccess { .. })) => {
                Ok(HsOutcome::TransportFailed(e))
            }
            Err(e @ Error::BitstreamUpload { .. }) => Ok(HsOutcome::UploadFailed(e)),
            Err(e) => Err(e),
        }
    }

    /// Configures the FPGA in high speed mode if possible, else in low speed
    /// mode.  The stream is rewound before falling back, so it must be
    /// seekable.
    ///
    /// # Errors
    /// As [`Fpga::upload_ls`].  A failed rewind is a `BitstreamRead` error.
    pub fn upload_auto<R: Read + Seek + ?Sized>(
        &mut self,
        reader: &mut R,
        force: bool,
        swap: BitSwap,
    ) -> Result<Duration, Error> {
        let start = reader.stream_position()?;
        match self.try_upload_hs(reader, force, swap)? {
            HsOutcome::Configured(elapsed) => return Ok(elapsed),
            HsOutcome::CapabilityUnsupported => {
                debug!("No high speed FPGA configuration, using low speed mode")
            }
            HsOutcome::TransportFailed(e) | HsOutcome::UploadFailed(e) => {
                warn!("High speed FPGA configuration failed: {e}: Trying low speed mode")
            }
        }
        reader.seek(SeekFrom::Start(start))?;
        self.upload_ls(reader, force, swap)
    }

    /// Multi-FPGA layout, queried once.  Boards without the capability
    /// report one FPGA.
    pub fn multi_fpga_info(&mut self) -> Result<MultiFpgaInfo, Error> {
        if let Some(info) = self.ztex.multi_fpga {
            return Ok(info);
        }
        let info = if self.ztex.supports(Capability::MultiFpga) {
            let mut buf = [0u8; 3];
            self.ztex.vendor_request_exact(
                VR_MULTI_FPGA_INFO,
                "Get Multi FPGA Info",
                0,
                0,
                &mut buf,
            )?;
            MultiFpgaInfo {
                count: buf[0] as u16 + 1,
                selected: buf[1],
                parallel_config: buf[2] == 1,
            }
        } else {
            MultiFpgaInfo::default()
        };
        self.ztex.multi_fpga = Some(info);
        Ok(info)
    }

    pub fn number_of_fpgas(&mut self) -> Result<u16, Error> {
        Ok(self.multi_fpga_info()?.count)
    }

    pub fn selected_fpga(&mut self) -> Result<u8, Error> {
        Ok(self.multi_fpga_info()?.selected)
    }

    pub fn parallel_config_supported(&mut self) -> Result<bool, Error> {
        Ok(self.multi_fpga_info()?.parallel_config)
    }

    /// Selects the FPGA addressed by subsequent FPGA operations (VC 0x51)
    ///
    /// # Errors
    /// * `OutOfRange` - `num` is not below [`Fpga::number_of_fpgas`]
    pub fn select(&mut self, num: u8) -> Result<(), Error> {
        let info = self.multi_fpga_info()?;
        if num as u16 >= info.count {
            return Err(Error::out_of_range("selectFPGA: Invalid FPGA number"));
        }
        if info.count != 1 {
            self.ztex
                .vendor_command(VC_MULTI_FPGA_SELECT, "Select FPGA", num as u16, 0, &[])?;
        }
        self.ztex.multi_fpga = Some(MultiFpgaInfo {
            selected: num,
            ..info
        });
        Ok(())
    }
}
