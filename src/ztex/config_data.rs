//! The board configuration record stored at the start of the MAC EEPROM
use super::Ztex;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Size of the configuration record
pub const CONFIG_DATA_SIZE: usize = 128;

const SIGNATURE: &[u8; 3] = b"CD0";
const BITSTREAM_SIZE_OFFSET: usize = 26;
const MAX_BITSTREAM_SIZE_OFFSET: usize = 28;
const BITSTREAM_START_OFFSET: usize = 30;
/// Bitstream figures are stored in 4 KiB units
const BITSTREAM_UNIT: u32 = 4096;

fn ascii(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

/// Parsed configuration record
///
/// The record identifies the board and reserves the Flash areas used for
/// firmware and bitstream.  While a record is attached to a [`Ztex`], MAC
/// EEPROM writes below offset 80 are refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigData {
    /// 2 for FX2 boards, 3 for FX3 boards
    pub kind: u8,
    pub board_series: u8,
    pub board_number: u8,
    pub variant: String,
    pub fpga_type: u16,
    pub fpga_package: u8,
    pub fpga_speed_grade: String,
    pub fpga_temp_grade: u8,
    pub serial: String,
    pub usb_ids: (u16, u16),
    pub product: String,
    pub ram_info: [u8; 12],
    raw: [u8; CONFIG_DATA_SIZE],
}

impl ConfigData {
    /// Parses a raw record.  Returns None if the buffer is short or the
    /// signature does not match.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < CONFIG_DATA_SIZE || &buf[0..3] != SIGNATURE {
            return None;
        }
        let mut raw = [0u8; CONFIG_DATA_SIZE];
        raw.copy_from_slice(&buf[..CONFIG_DATA_SIZE]);
        let mut ram_info = [0u8; 12];
        ram_info.copy_from_slice(&raw[68..80]);

        Some(Self {
            kind: raw[3],
            board_series: raw[4],
            board_number: raw[5],
            variant: ascii(&raw[6..8]),
            fpga_type: u16::from_le_bytes([raw[8], raw[9]]),
            fpga_package: raw[10],
            fpga_speed_grade: ascii(&raw[11..14]),
            fpga_temp_grade: raw[14],
            serial: ascii(&raw[16..26]),
            usb_ids: (
                u16::from_le_bytes([raw[32], raw[33]]),
                u16::from_le_bytes([raw[34], raw[35]]),
            ),
            product: ascii(&raw[36..68]),
            ram_info,
            raw,
        })
    }

    fn units(&self, offset: usize) -> u32 {
        u16::from_le_bytes([self.raw[offset], self.raw[offset + 1]]) as u32 * BITSTREAM_UNIT
    }

    /// Bytes used by the bitstream in Flash
    pub fn bitstream_size(&self) -> u32 {
        self.units(BITSTREAM_SIZE_OFFSET)
    }

    /// Bytes reserved for the bitstream in Flash.  0 if the board reserves
    /// no bitstream area.
    pub fn max_bitstream_size(&self) -> u32 {
        self.units(MAX_BITSTREAM_SIZE_OFFSET)
    }

    /// Flash offset of the bitstream.  The firmware area ends here.
    pub fn bitstream_start(&self) -> u32 {
        self.units(BITSTREAM_START_OFFSET)
    }

    /// The 48 bytes after the protected area
    pub fn user_data(&self) -> &[u8] {
        &self.raw[80..]
    }

    pub fn as_bytes(&self) -> &[u8; CONFIG_DATA_SIZE] {
        &self.raw
    }

    /// Board name, e.g. "ZTEX USB-FPGA 2.14b"
    pub fn name(&self) -> String {
        format!(
            "ZTEX USB-FPGA {}.{:02}{}",
            self.board_series, self.board_number, self.variant
        )
    }
}

impl<D: Device> Ztex<D> {
    /// Records a new bitstream size in the attached configuration record,
    /// rounded up to 4 KiB.  Does nothing if no record is attached.
    pub(crate) fn set_config_bitstream_size(&mut self, bytes: u32) -> Result<(), Error> {
        let units = bytes.div_ceil(BITSTREAM_UNIT).min(u16::MAX as u32) as u16;
        let encoded = units.to_le_bytes();
        if self.config_data().is_none() {
            return Ok(());
        }
        debug!("Setting configured bitstream size to {units} x 4 KiB");
        self.mac_eeprom()
            .write_unguarded(BITSTREAM_SIZE_OFFSET as u16, &encoded)?;
        if let Some(cd) = self.config_data_mut() {
            cd.raw[BITSTREAM_SIZE_OFFSET..BITSTREAM_SIZE_OFFSET + 2].copy_from_slice(&encoded);
        }
        Ok(())
    }
}
