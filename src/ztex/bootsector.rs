//! Bitstreams stored in Flash, which the firmware loads into the FPGA at
//! power-up.
//!
//! If the configuration record reserves a bitstream area, the bitstream is
//! written there and its size recorded in the record.  Otherwise sector 0
//! holds a boot sector and the bitstream starts at sector 1:
//!
//! | Bytes | Content |
//! |---|---|
//! | 0..8 | "ZTEXBS", 1, 1 |
//! | 8..10 | number of bitstream sectors, 0 if there is none |
//! | 10..12 | bytes used in the last sector |
//! | 12.. | reserved, preserved across uploads |
use super::bitstream::{detect_bitstream_start, read_bitstream, swap_bits, BitSwap};
use super::{to_human_str, Ztex};
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::io::Read;
use std::time::{Duration, Instant};

const BOOT_SIGNATURE: &[u8; 6] = b"ZTEXBS";
const BOOT_SECTOR_HEADER: usize = 12;

fn boot_sector_valid(sector: &[u8]) -> bool {
    sector.len() >= BOOT_SECTOR_HEADER
        && &sector[..6] == BOOT_SIGNATURE
        && sector[6] == 1
        && sector[7] == 1
}

/// Bitstream area reserved by the configuration record: start, reserved
/// size and used size in bytes
struct ReservedArea {
    start: u32,
    max: u32,
    used: u32,
}

impl<D: Device> Ztex<D> {
    fn reserved_area(&self) -> Option<ReservedArea> {
        self.config_data()
            .filter(|cd| cd.max_bitstream_size() > 0)
            .map(|cd| ReservedArea {
                start: cd.bitstream_start(),
                max: cd.max_bitstream_size(),
                used: cd.bitstream_size(),
            })
    }

    /// Writes a bitstream to Flash, returning the write time.
    ///
    /// The bit order is matched to what the firmware expects when loading
    /// from Flash, as reported in [`super::FpgaState::flash_bit_swap`].
    /// On FX2 boards the file header in front of the raw bitstream is
    /// dropped.
    ///
    /// Without a reserved area the boot sector is written before the
    /// bitstream.  Its reserved bytes are kept if the signature was valid
    /// and cleared otherwise.
    ///
    /// # Errors
    /// * `Capability` - no FPGA or Flash support, or no Flash installed
    /// * `BitstreamRead` - reading failed, the bitstream is empty or does
    ///   not fit the reserved area
    /// * `Usb` - Flash access failed
    pub fn flash_upload_bitstream<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        swap: BitSwap,
    ) -> Result<Duration, Error> {
        trace!("Ztex::flash_upload_bitstream swap {swap:?}");
        self.check_capability(Capability::Fpga)?;
        self.check_capability(Capability::Flash)?;
        let ss = self.flash().installed_sector_size()?;
        let fpga_state = self.fpga().state()?;

        let mut data = read_bitstream(reader)?;
        if data.is_empty() {
            return Err(Error::bitstream_read("Empty bitstream"));
        }
        let buffer_size = (FLASH_TRANSFER_MAX / ss).max(1) * ss;
        if !self.is_fx3() && data.len() >= buffer_size {
            let header = detect_bitstream_start(&data[..buffer_size]);
            if header > 0 {
                debug!("Dropping {header} byte bitstream header");
                data.drain(..header);
            }
        }
        let head = &data[..data.len().min(buffer_size)];
        if fpga_state.flash_bit_swap != swap.resolve(head) {
            swap_bits(&mut data);
        }

        let len = data.len();
        let sectors = len.div_ceil(ss);
        data.resize(sectors * ss, 0);
        let start = Instant::now();

        match self.reserved_area() {
            Some(area) => {
                if data.len() as u64 > area.max as u64 {
                    return Err(Error::bitstream_read(format!(
                        "Bitstream too large for the reserved area: {} Bytes > {} Bytes",
                        to_human_str(data.len() as i64),
                        to_human_str(area.max as i64)
                    )));
                }
                let first = area.start.div_ceil(ss as u32);
                self.write_bitstream_sectors(first, &data, ss, buffer_size)?;
                self.set_config_bitstream_size(data.len() as u32)?;
            }
            None => {
                let count = u16::try_from(sectors).map_err(|_| {
                    Error::bitstream_read(format!("Bitstream too large: {sectors} sectors"))
                })?;
                let mut boot = vec![0u8; ss];
                self.flash().read_sector(0, &mut boot)?;
                let keep = &boot[..6] == BOOT_SIGNATURE;
                boot[..6].copy_from_slice(BOOT_SIGNATURE);
                boot[6] = 1;
                boot[7] = 1;
                boot[8..10].copy_from_slice(&count.to_le_bytes());
                let last = ((len - 1) % ss + 1) as u16;
                boot[10..12].copy_from_slice(&last.to_le_bytes());
                if !keep {
                    boot[BOOT_SECTOR_HEADER..].fill(0);
                }
                info!("Writing boot sector");
                self.flash().write_sector(0, &boot)?;
                self.write_bitstream_sectors(1, &data, ss, buffer_size)?;
            }
        }

        let elapsed = start.elapsed();
        info!(
            "Wrote {} byte bitstream to Flash in {} ms",
            len,
            elapsed.as_millis()
        );
        Ok(elapsed)
    }

    fn write_bitstream_sectors(
        &mut self,
        first: u32,
        data: &[u8],
        ss: usize,
        buffer_size: usize,
    ) -> Result<(), Error> {
        let total = data.len() / ss;
        for (i, chunk) in data.chunks(buffer_size).enumerate() {
            let sector = first + (i * buffer_size / ss) as u32;
            let num = (chunk.len() / ss) as u32;
            debug!(
                "Writing sector {} of {total}",
                i * buffer_size / ss + num as usize
            );
            self.flash().write_sectors(sector, num, chunk)?;
        }
        Ok(())
    }

    /// Marks the Flash as holding no bitstream.  Without a reserved area
    /// only a valid boot sector is modified; otherwise nothing is written.
    pub fn flash_reset_bitstream(&mut self) -> Result<(), Error> {
        trace!("Ztex::flash_reset_bitstream");
        let ss = self.flash().installed_sector_size()?;
        if self.reserved_area().is_some() {
            return self.set_config_bitstream_size(0);
        }

        let mut boot = vec![0u8; ss];
        self.flash().read_sector(0, &mut boot)?;
        if !boot_sector_valid(&boot) {
            debug!("No boot sector, nothing to reset");
            return Ok(());
        }
        boot[8] = 0;
        boot[9] = 0;
        self.flash().write_sector(0, &boot)
    }

    /// Returns the first Flash sector behind the bitstream area.  Without a
    /// reserved area this is 0 if there is no valid boot sector, else the
    /// sector following the bitstream.
    pub fn flash_first_free_sector(&mut self) -> Result<u32, Error> {
        let ss = self.flash().installed_sector_size()? as u32;
        if let Some(area) = self.reserved_area() {
            return Ok(area.start.div_ceil(ss) + area.max.max(area.used).div_ceil(ss));
        }

        let mut boot = vec![0u8; ss as usize];
        self.flash().read_sector(0, &mut boot)?;
        if !boot_sector_valid(&boot) {
            return Ok(0);
        }
        Ok(u16::from_le_bytes([boot[8], boot[9]]) as u32 + 1)
    }

    /// Flash size and bitstream usage, e.g. "Size: 16M Bytes;  Bitstream
    /// (used): 2M320K Bytes".  Empty if the Flash is unavailable.
    pub fn flash_info(&mut self) -> String {
        let mut s = String::new();
        let size = match self.flash().size() {
            Ok(size) if size > 0 => size,
            _ => return s,
        };
        s.push_str(&format!("Size: {} Bytes", to_human_str(size as i64)));
        match self.reserved_area() {
            Some(area) => s.push_str(&format!(
                ";  Bitstream (start / used / reserved): {} / {} / {} Bytes",
                to_human_str(area.start as i64),
                to_human_str(area.used as i64),
                to_human_str(area.max as i64)
            )),
            None => {
                let used = self.flash_first_free_sector().and_then(|first| {
                    Ok(first as i64 * self.flash().sector_size()? as i64)
                });
                if let Ok(used) = used {
                    s.push_str(&format!(
                        ";  Bitstream (used): {} Bytes",
                        to_human_str(used)
                    ));
                }
            }
        }
        s
    }

    /// 2nd Flash size, e.g. "Size: 4G Bytes".  Empty if unavailable.
    pub fn flash2_info(&mut self) -> String {
        match self.flash2().size() {
            Ok(size) if size > 0 => format!("Size: {} Bytes", to_human_str(size as i64)),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Transfer};
    use crate::ztex::bitstream::tests::sample;
    use crate::ztex::config_data::tests::record;
    use crate::ztex::flash::tests::emulate_flash;
    use crate::ztex::flash::FlashKind;
    use crate::ztex::fpga::tests::emulate_fpga;
    use crate::ztex::ZtexConfig;
    use std::io::Cursor;

    const SYNC: [u8; 4] = [0xaa, 0x99, 0x55, 0x66];

    fn flash_device(caps: &[Capability]) -> MockDevice {
        let mut device = MockDevice::new(caps);
        emulate_fpga(&mut device, 0);
        device
    }

    #[test]
    fn test_mismatched_signature() {
        let mut device = flash_device(&[Capability::Fpga, Capability::Flash]);
        emulate_flash(&mut device, FlashKind::Primary, 512, 64);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        assert_eq!(z.flash_first_free_sector(), Ok(0));
        z.flash_reset_bitstream().unwrap();
        assert_eq!(z.device().count(VC_FLASH_WRITE), 0);
    }

    #[test]
    fn test_boot_sector_upload() {
        let mut device = flash_device(&[Capability::Fpga, Capability::Flash]);
        let mem = emulate_flash(&mut device, FlashKind::Primary, 512, 64);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        let data = sample(3000, SYNC);
        z.flash_upload_bitstream(&mut Cursor::new(data.clone()), BitSwap::Auto)
            .unwrap();

        // the 8 byte file header is dropped
        let raw = &data[8..];
        {
            let mem = mem.borrow();
            assert_eq!(&mem[..8], b"ZTEXBS\x01\x01");
            assert_eq!(&mem[8..10], &6u16.to_le_bytes());
            assert_eq!(&mem[10..12], &((raw.len() - 5 * 512) as u16).to_le_bytes());
            assert!(mem[12..512].iter().all(|b| *b == 0));
            assert_eq!(&mem[512..512 + raw.len()], raw);
        }
        // boot sector first
        match z.device().commands(VC_FLASH_WRITE)[0] {
            Transfer::Out { value, .. } => assert_eq!(*value, 0),
            _ => unreachable!(),
        }
        assert_eq!(z.flash_first_free_sector(), Ok(7));
        assert_eq!(
            z.flash_info(),
            "Size: 32K Bytes;  Bitstream (used): 3K512 Bytes"
        );

        z.flash_reset_bitstream().unwrap();
        assert_eq!(z.flash_first_free_sector(), Ok(1));
    }

    #[test]
    fn test_valid_boot_sector_keeps_reserved_bytes() {
        let mut device = flash_device(&[Capability::Fpga, Capability::Flash]);
        let mem = emulate_flash(&mut device, FlashKind::Primary, 512, 64);
        mem.borrow_mut()[..12].copy_from_slice(b"ZTEXBS\x01\x01\x00\x00\x00\x00");
        mem.borrow_mut()[100] = 0x5a;
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        z.flash_upload_bitstream(&mut Cursor::new(sample(700, SYNC)), BitSwap::Off)
            .unwrap();
        assert_eq!(mem.borrow()[100], 0x5a);
        assert_eq!(z.flash_first_free_sector(), Ok(3));
    }

    #[test]
    fn test_bit_order_follows_firmware() {
        let mut device = MockDevice::new(&[Capability::Fpga, Capability::Flash]);
        let emu = emulate_fpga(&mut device, 0);
        emu.borrow_mut().flash_bit_swap = true;
        let mem = emulate_flash(&mut device, FlashKind::Primary, 512, 64);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        let data = sample(1000, SYNC);
        z.flash_upload_bitstream(&mut Cursor::new(data.clone()), BitSwap::Auto)
            .unwrap();
        assert_eq!(mem.borrow()[512], data[0].reverse_bits());
    }

    #[test]
    fn test_reserved_area_upload() {
        let mut device = flash_device(&[
            Capability::Fpga,
            Capability::Flash,
            Capability::MacEeprom,
        ]);
        let mem = emulate_flash(&mut device, FlashKind::Primary, 512, 256);
        // firmware area of 4 KiB, 64 KiB reserved for the bitstream
        device.on_request_reply(VR_MAC_EEPROM_READ, record(1, 16, 0));
        device.accept_command(VC_MAC_EEPROM_WRITE);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        let data = sample(3000, SYNC);
        z.flash_upload_bitstream(&mut Cursor::new(data.clone()), BitSwap::Off)
            .unwrap();
        assert_eq!(&mem.borrow()[4096..4096 + 2992], &data[8..]);

        let writes = z.device().commands(VC_MAC_EEPROM_WRITE);
        assert_eq!(writes.len(), 1);
        match writes[0] {
            Transfer::Out { value, data, .. } => {
                assert_eq!(*value, 26);
                assert_eq!(data, &vec![1, 0]);
            }
            _ => unreachable!(),
        }
        assert_eq!(z.config_data().unwrap().bitstream_size(), 4096);
        assert_eq!(z.flash_first_free_sector(), Ok(8 + 128));
        assert_eq!(
            z.flash_info(),
            "Size: 128K Bytes;  Bitstream (start / used / reserved): 4K / 4K / 64K Bytes"
        );

        z.flash_reset_bitstream().unwrap();
        assert_eq!(z.config_data().unwrap().bitstream_size(), 0);
        // no boot sector is involved
        assert!(z
            .device()
            .commands(VC_FLASH_WRITE)
            .iter()
            .all(|t| !matches!(t, Transfer::Out { value: 0, .. })));
    }

    #[test]
    fn test_reserved_area_too_small() {
        let mut device = flash_device(&[
            Capability::Fpga,
            Capability::Flash,
            Capability::MacEeprom,
        ]);
        emulate_flash(&mut device, FlashKind::Primary, 512, 256);
        device.on_request_reply(VR_MAC_EEPROM_READ, record(1, 1, 0));
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        let result = z.flash_upload_bitstream(&mut Cursor::new(sample(5000, SYNC)), BitSwap::Off);
        assert!(matches!(result, Err(Error::BitstreamRead { .. })));
        assert_eq!(z.device().count(VC_FLASH_WRITE), 0);
    }

    #[test]
    fn test_info_without_flash() {
        let device = MockDevice::new(&[Capability::Fpga]);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        assert_eq!(z.flash_info(), "");
        assert_eq!(z.flash2_info(), "");
    }
}
