//! EZ-USB "C2" boot image encoding, as loaded from the EEPROM by the FX2
//! boot loader.
//!
//! Layout: an 8 byte header `C2 vidLo vidHi pidLo pidHi 00 00 41`, then
//! records `{lenHi, lenLo, addrHi, addrLo, data...}` and a final record
//! which writes 0 to CPUCS (0xE600) to start the CPU.  The record length is
//! 10 bits wide; bit 7 of `lenHi` marks the final record.
use super::{FirmwareImage, Run};
use crate::constants::FX2_CPUCS;
use crate::Error;

/// EEPROM pages are written and verified one at a time
pub const EEPROM_PAGE_SIZE: usize = 256;

/// Maximum number of pages of an EEPROM firmware image
pub const EEPROM_MAX_PAGES: usize = 256;

const HEADER_SIZE: usize = 8;
const MAX_RECORD_LEN: usize = 0x3ff;
const LAST_RECORD: u8 = 0x80;

/// Encodes the defined bytes of `image` into a C2 boot image, using the
/// given USB IDs in the header
///
/// # Errors
/// * `FirmwareUpload` - if the result exceeds the EEPROM
pub fn encode(image: &FirmwareImage, vid: u16, pid: u16) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(EEPROM_PAGE_SIZE * 16);
    out.push(0xc2);
    out.extend_from_slice(&vid.to_le_bytes());
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&[0x00, 0x00, 0x41]);

    for run in image.runs() {
        for (k, chunk) in run.data.chunks(MAX_RECORD_LEN).enumerate() {
            let addr = run.address + k * MAX_RECORD_LEN;
            out.push((chunk.len() >> 8) as u8);
            out.push(chunk.len() as u8);
            out.push((addr >> 8) as u8);
            out.push(addr as u8);
            out.extend_from_slice(chunk);
        }
    }

    let [cpucs_hi, cpucs_lo] = FX2_CPUCS.to_be_bytes();
    out.extend_from_slice(&[LAST_RECORD, 0x01, cpucs_hi, cpucs_lo, 0x00]);

    if out.len() > EEPROM_PAGE_SIZE * EEPROM_MAX_PAGES {
        return Err(Error::firmware_upload(format!(
            "Firmware too large for EEPROM: {} bytes > {} bytes",
            out.len(),
            EEPROM_PAGE_SIZE * EEPROM_MAX_PAGES
        )));
    }
    Ok(out)
}

/// Splits an encoded image into (EEPROM address, page data) pairs.  The
/// last page may be short.
pub fn pages(encoded: &[u8]) -> impl DoubleEndedIterator<Item = (u16, &[u8])> {
    encoded
        .chunks(EEPROM_PAGE_SIZE)
        .enumerate()
        .map(|(i, page)| ((i * EEPROM_PAGE_SIZE) as u16, page))
}

/// 8 bit sum as reported by the firmware's EEPROM state
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |cs, b| cs.wrapping_add(*b))
}

/// A decoded C2 boot image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImage {
    pub vid: u16,
    pub pid: u16,
    /// Data records, with adjacent records merged and the CPUCS start
    /// record excluded
    pub runs: Vec<Run>,
}

/// Decodes a C2 boot image as read back from the EEPROM
///
/// # Errors
/// * `InvalidFirmware` - on a missing signature or a truncated record
pub fn decode(bytes: &[u8]) -> Result<BootImage, Error> {
    if bytes.len() < HEADER_SIZE || bytes[0] != 0xc2 {
        return Err(Error::invalid_firmware("No C2 boot image"));
    }
    let vid = u16::from_le_bytes([bytes[1], bytes[2]]);
    let pid = u16::from_le_bytes([bytes[3], bytes[4]]);

    let mut runs: Vec<Run> = vec![];
    let mut ptr = HEADER_SIZE;
    loop {
        let head = bytes
            .get(ptr..ptr + 4)
            .ok_or_else(|| Error::invalid_firmware("Truncated C2 boot image"))?;
        let len = (((head[0] & 0x03) as usize) << 8) | head[1] as usize;
        let addr = ((head[2] as usize) << 8) | head[3] as usize;
        let data = bytes
            .get(ptr + 4..ptr + 4 + len)
            .ok_or_else(|| Error::invalid_firmware("Truncated C2 boot image"))?;
        ptr += 4 + len;

        if head[0] & LAST_RECORD != 0 {
            break;
        }
        match runs.last_mut() {
            Some(prev) if prev.address + prev.data.len() == addr => {
                prev.data.extend_from_slice(data)
            }
            _ => runs.push(Run {
                address: addr,
                data: data.to_vec(),
            }),
        }
    }

    Ok(BootImage { vid, pid, runs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> FirmwareImage {
        let mut image = FirmwareImage::fx2();
        image.set(0x0000, &[0x02, 0x01, 0x00]);
        image.set(0x0100, &(0..=255).cycle().take(1500).collect::<Vec<u8>>());
        image.set(0xe000, &[0xaa; 17]);
        image
    }

    #[test]
    fn test_header_and_end_marker() {
        let encoded = encode(&image(), 0x221a, 0x0100).unwrap();
        assert_eq!(&encoded[..8], &[0xc2, 0x1a, 0x22, 0x00, 0x01, 0x00, 0x00, 0x41]);
        assert_eq!(&encoded[encoded.len() - 5..], &[0x80, 0x01, 0xe6, 0x00, 0x00]);
        // first record: 3 bytes at 0
        assert_eq!(&encoded[8..12], &[0x00, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_round_trip_preserves_runs() {
        let image = image();
        let encoded = encode(&image, 0x221a, 0x0100).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.vid, 0x221a);
        assert_eq!(decoded.pid, 0x0100);
        assert_eq!(decoded.runs, image.runs());
    }

    #[test]
    fn test_long_runs_are_split() {
        let encoded = encode(&image(), 0x221a, 0x0100).unwrap();
        // 1500 bytes at 0x100 need a 1023 byte and a 477 byte record
        let second = 8 + 4 + 3;
        assert_eq!(&encoded[second..second + 4], &[0x03, 0xff, 0x01, 0x00]);
        let third = second + 4 + 1023;
        assert_eq!(&encoded[third..third + 4], &[0x01, 0xdd, 0x04, 0xff]);
    }

    #[test]
    fn test_pages_cover_encoding() {
        let encoded = encode(&image(), 0x221a, 0x0100).unwrap();
        let pages: Vec<(u16, &[u8])> = pages(&encoded).collect();
        assert_eq!(pages.len(), encoded.len().div_ceil(EEPROM_PAGE_SIZE));
        assert_eq!(pages[1].0, 256);
        let total: usize = pages.iter().map(|(_, p)| p.len()).sum();
        assert_eq!(total, encoded.len());
        let (_, last) = pages.last().unwrap();
        assert_eq!(last.len(), encoded.len() % EEPROM_PAGE_SIZE);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[0xff; 16]).is_err());
        assert!(decode(&[0xc2, 0, 0, 0, 0, 0, 0, 0x41, 0x00, 0x10]).is_err());
    }
}
