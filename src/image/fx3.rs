//! Cypress FX3 boot image encoding, as loaded from SPI Flash by the FX3
//! boot loader.
//!
//! Layout (all values little endian): `'C' 'Y' 0x20 0xB0`, then records
//! `{words: u32, address: u32, data: words * u32}`, a terminating record
//! with zero length whose address field holds the start vector, and the
//! 32 bit sum of all data words.
use super::{uncompress_addr, FirmwareImage};
use crate::Error;

/// Executable image, 30 MHz SPI clock
const IMAGE_CTL: u8 = 0x20;
/// Normal firmware image with checksum
const IMAGE_TYPE: u8 = 0xb0;

/// Encodes the defined bytes of `image` into an FX3 boot image.
///
/// Records are built from 32 bit words.  A word is emitted if any of its
/// bytes is defined; undefined bytes inside such a word are written as
/// 0xFF.
///
/// # Errors
/// * `InvalidFirmware` - a record would start at an address that is not
///   4 byte aligned
pub fn encode(image: &FirmwareImage) -> Result<Vec<u8>, Error> {
    let data = image.bytes();
    let defined = |i: usize| data.get(i).map(Option::is_some).unwrap_or(false);
    let byte = |i: usize| data[i].unwrap_or(0xff);

    let mut out = vec![b'C', b'Y', IMAGE_CTL, IMAGE_TYPE];
    let mut cs: u32 = 0;
    let mut i = 0;

    while i < data.len() {
        if !defined(i) {
            i += 1;
            continue;
        }

        let address = uncompress_addr(i);
        let mut words = 0;
        // records must not cross a memory region
        while i + words * 4 + 3 < data.len()
            && (0..4).any(|k| defined(i + words * 4 + k))
            && uncompress_addr(i + words * 4) == address.wrapping_add(words as u32 * 4)
        {
            words += 1;
        }
        if words == 0 {
            // defined bytes in a trailing partial word
            break;
        }

        if address & 3 != 0 {
            return Err(Error::invalid_firmware("Invalid address alignment"));
        }
        out.extend_from_slice(&(words as u32).to_le_bytes());
        out.extend_from_slice(&address.to_le_bytes());
        for w in 0..words {
            let base = i + w * 4;
            let word = [byte(base), byte(base + 1), byte(base + 2), byte(base + 3)];
            cs = cs.wrapping_add(u32::from_le_bytes(word));
            out.extend_from_slice(&word);
        }
        i += words * 4;
    }

    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&image.start_vector().to_le_bytes());
    out.extend_from_slice(&cs.to_le_bytes());
    Ok(out)
}
