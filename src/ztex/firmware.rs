//! Firmware uploads to RAM and to non-volatile memory.
//!
//! FX2 boards boot from the EEPROM, FX3 boards from Flash.  The
//! `nv_` functions pick the right store for the connected device.
use super::{to_human_str, Ztex};
use crate::capability::Capability;
use crate::constants::*;
use crate::image::{eeprom, fx3, uncompress_addr, FirmwareImage};
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::{Duration, Instant};

/// Keeps `FirmwareUpload` errors, turns anything else into one
fn upload_error(e: Error) -> Error {
    match e {
        Error::FirmwareUpload { .. } => e,
        other => Error::firmware_upload(other.to_string()),
    }
}

impl<D: Device> Ztex<D> {
    /// Checks interface version and product ID of the descriptor embedded
    /// in `image` against the running firmware.  Skipped if `force` is set,
    /// the device has no valid ZTEX firmware or the image has no
    /// descriptor.
    pub fn check_image_compatible(&self, image: &FirmwareImage, force: bool) -> Result<(), Error> {
        if force || !self.valid() {
            return Ok(());
        }
        let Some(descriptor) = image.descriptor() else {
            return Ok(());
        };
        if descriptor.interface_version != INTERFACE_VERSION {
            return Err(Error::IncompatibleFirmware {
                message: format!(
                    "Wrong interface version: Expected {INTERFACE_VERSION}, got {}",
                    descriptor.interface_version
                ),
            });
        }
        self.check_compatible(&descriptor.product_id)
    }

    /// Uploads firmware to the boot memory, EEPROM or Flash depending on
    /// the device.  The device must be reset to start it.
    pub fn nv_upload_firmware(
        &mut self,
        image: &FirmwareImage,
        force: bool,
    ) -> Result<Duration, Error> {
        if self.is_fx3() {
            self.flash_upload_firmware(image, force)
        } else {
            self.eeprom_upload_firmware(image, force)
        }
    }

    /// Disables the firmware in the boot memory
    pub fn nv_disable_firmware(&mut self) -> Result<(), Error> {
        if self.is_fx3() {
            self.flash_disable_firmware()
        } else {
            self.eeprom_disable_firmware()
        }
    }

    /// Writes an FX2 firmware image to the EEPROM as C2 boot image.
    ///
    /// Pages are written from the last to the first, so the header which
    /// makes the image valid is written last.  Each page is verified
    /// through the EEPROM state and by reading it back, with up to 3
    /// attempts.
    ///
    /// # Errors
    /// * `IncompatibleFirmware` - unless `force` is set
    /// * `FirmwareUpload` - the image does not fit or a page failed
    pub fn eeprom_upload_firmware(
        &mut self,
        image: &FirmwareImage,
        force: bool,
    ) -> Result<Duration, Error> {
        trace!("Ztex::eeprom_upload_firmware force {force}");
        self.check_capability(Capability::Eeprom)?;
        self.check_image_compatible(image, force)?;

        let (vid, pid) = image
            .usb_ids()
            .unwrap_or((self.info().vendor_id, self.info().product_id));
        let encoded = eeprom::encode(image, vid, pid)?;
        debug!("EEPROM boot image: {} bytes", encoded.len());

        let start = Instant::now();
        for (addr, page) in eeprom::pages(&encoded).rev() {
            self.eeprom_write_page(addr, page)?;
        }
        let elapsed = start.elapsed();
        info!("Firmware written to EEPROM in {} ms", elapsed.as_millis());
        Ok(elapsed)
    }

    fn eeprom_write_page(&mut self, addr: u16, page: &[u8]) -> Result<(), Error> {
        let mut attempt = 1;
        loop {
            match self.eeprom_try_page(addr, page) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PAGE_WRITE_TRIES => {
                    warn!("{e}: Retrying it ...");
                    attempt += 1;
                }
                Err(e) => return Err(upload_error(e)),
            }
        }
    }

    fn eeprom_try_page(&mut self, addr: u16, page: &[u8]) -> Result<(), Error> {
        self.eeprom().write(addr, page)?;
        let state = self.eeprom().state()?;
        if state.bytes as usize != page.len() {
            return Err(Error::firmware_upload(format!(
                "Error writing data to EEPROM: Wrote {} bytes instead of {} bytes",
                state.bytes,
                page.len()
            )));
        }
        if state.checksum != eeprom::checksum(page) {
            return Err(Error::firmware_upload(
                "Error writing data to EEPROM: Checksum error",
            ));
        }
        let mut readback = vec![0u8; page.len()];
        self.eeprom().read(addr, &mut readback)?;
        if readback != page {
            return Err(Error::firmware_upload(
                "Error writing data to EEPROM: Verification failed",
            ));
        }
        Ok(())
    }

    /// Disables the EEPROM firmware by writing 0 to address 0
    pub fn eeprom_disable_firmware(&mut self) -> Result<(), Error> {
        trace!("Ztex::eeprom_disable_firmware");
        self.check_capability(Capability::Eeprom)?;
        let mut attempt = 1;
        loop {
            let result = self.eeprom().write(0, &[0]).and_then(|()| {
                let mut buf = [0xffu8; 1];
                self.eeprom().read(0, &mut buf)?;
                if buf[0] != 0 {
                    return Err(Error::firmware_upload(
                        "Error disabling EEPROM firmware: Verification failed",
                    ));
                }
                Ok(())
            });
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PAGE_WRITE_TRIES => {
                    warn!("{e}: Retrying it ...");
                    attempt += 1;
                }
                Err(e) => return Err(upload_error(e)),
            }
        }
    }

    /// Writes an FX3 firmware image to Flash, starting at sector 0.
    ///
    /// The size is checked against the firmware area of the configuration
    /// record before anything is written.  Every sector is read back.
    ///
    /// # Errors
    /// * `IncompatibleFirmware` - not an FX3 image, or incompatible unless
    ///   `force` is set
    /// * `FirmwareUpload` - the image does not fit or writing failed
    pub fn flash_upload_firmware(
        &mut self,
        image: &FirmwareImage,
        force: bool,
    ) -> Result<Duration, Error> {
        trace!("Ztex::flash_upload_firmware force {force}");
        self.check_capability(Capability::Flash)?;
        self.check_capability(Capability::Fx3)?;
        if !image.is_fx3() {
            return Err(Error::IncompatibleFirmware {
                message: "FX3 firmware required".to_string(),
            });
        }
        let ss = self.flash().installed_sector_size()?;
        self.check_image_compatible(image, force)?;

        let mut encoded = fx3::encode(image)?;
        let last = encoded.len() - 1;
        if let Some(cd) = self.config_data() {
            if last as u64 > cd.bitstream_start() as u64 {
                return Err(Error::firmware_upload(format!(
                    "Firmware to large for the reserved area: {} Bytes > {} Bytes",
                    to_human_str(last as i64),
                    to_human_str(cd.bitstream_start() as i64)
                )));
            }
        }

        let sectors = encoded.len().div_ceil(ss);
        encoded.resize(sectors * ss, 0);
        let start = Instant::now();
        let mut readback = vec![0u8; ss];
        for (k, sector) in encoded.chunks(ss).enumerate() {
            debug!("Writing sector {} of {sectors}", k + 1);
            self.flash()
                .write_sector(k as u32, sector)
                .map_err(upload_error)?;
            self.flash()
                .read_sector(k as u32, &mut readback)
                .map_err(upload_error)?;
            if readback != sector {
                return Err(Error::firmware_upload(format!(
                    "Error writing firmware to Flash: Verification of sector {k} failed"
                )));
            }
        }
        let elapsed = start.elapsed();
        info!("Firmware written to Flash in {} ms", elapsed.as_millis());
        Ok(elapsed)
    }

    /// Disables the Flash firmware by clearing the image signature.  Does
    /// nothing, with a warning, if the configuration record reserves no
    /// firmware area.
    pub fn flash_disable_firmware(&mut self) -> Result<(), Error> {
        trace!("Ztex::flash_disable_firmware");
        self.check_capability(Capability::Flash)?;
        self.check_capability(Capability::Fx3)?;
        let ss = self.flash().installed_sector_size()?;

        if self.config_data().is_some_and(|cd| cd.bitstream_start() == 0) {
            warn!("No space reserved for firmware: firmware is not disabled");
            return Ok(());
        }

        let mut sector = vec![0u8; ss];
        self.flash().read_sector(0, &mut sector).map_err(upload_error)?;
        sector[0] = 0;
        sector[1] = 0;
        self.flash().write_sector(0, &sector).map_err(upload_error)
    }

    /// Uploads firmware into the microcontroller's RAM and starts it.
    ///
    /// FX2: the CPU is held in reset through CPUCS while the image is
    /// written.  FX3: the image is loaded through the boot loader, which
    /// then jumps to the start vector.  The device re-enumerates
    /// afterwards, so this handle should be dropped.
    pub fn upload_ram(&mut self, image: &FirmwareImage) -> Result<Duration, Error> {
        trace!("Ztex::upload_ram fx3 {}", image.is_fx3());
        let start = Instant::now();
        if image.is_fx3() {
            for run in image.runs() {
                let base = uncompress_addr(run.address);
                for (i, chunk) in run.data.chunks(ANCHOR_LOAD_MAX).enumerate() {
                    let addr = base + (i * ANCHOR_LOAD_MAX) as u32;
                    self.vendor_command(
                        VC_ANCHOR_LOAD,
                        "Anchor Load",
                        addr as u16,
                        (addr >> 16) as u16,
                        chunk,
                    )?;
                }
            }
            let entry = image.start_vector();
            debug!("Starting firmware at 0x{entry:08x}");
            // the boot loader may leave before acknowledging
            if let Err(e) = self.vendor_command(
                VC_ANCHOR_LOAD,
                "Start Firmware",
                entry as u16,
                (entry >> 16) as u16,
                &[],
            ) {
                debug!("{e}");
            }
            self.delay(FX3_RAM_START_DELAY);
        } else {
            self.vendor_command(VC_ANCHOR_LOAD, "Reset CPU", FX2_CPUCS, 0, &[1])?;
            for run in image.runs() {
                for (i, chunk) in run.data.chunks(ANCHOR_LOAD_MAX).enumerate() {
                    let addr = run.address + i * ANCHOR_LOAD_MAX;
                    self.vendor_command(VC_ANCHOR_LOAD, "Anchor Load", addr as u16, 0, chunk)?;
                }
            }
            self.vendor_command(VC_ANCHOR_LOAD, "Start CPU", FX2_CPUCS, 0, &[0])?;
        }
        let elapsed = start.elapsed();
        info!("Firmware uploaded to RAM in {} ms", elapsed.as_millis());
        Ok(elapsed)
    }
}
