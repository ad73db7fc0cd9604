//! Firmware images as loaded from Intel HEX (FX2) or Cypress boot image
//! (FX3) files.
//!
//! An image is a sparse byte array: every address either holds a byte or is
//! undefined.  Undefined bytes are gaps which are never written.  FX3 images
//! are kept in a compressed address space which maps the three FX3 memory
//! regions next to each other, see [`compress_addr`].
use crate::constants::*;
use crate::{Error, ZtexDescriptor};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::path::Path;

pub mod eeprom;
pub mod fx3;

/// Size of the FX2 address space
pub const FX2_IMAGE_SIZE: usize = 0x10000;

/// Size of the compressed FX3 address space
pub const FX3_IMAGE_SIZE: usize = 0x86000;

const FX3_SYSMEM_BASE: u32 = 0x4000_0000;
const FX3_SYSMEM_SIZE: u32 = 0x8_0000;
const FX3_ITCM_BASE: u32 = 0;
const FX3_ITCM_SIZE: u32 = 0x4000;
const FX3_DTCM_BASE: u32 = 0x1000_0000;
const FX3_DTCM_SIZE: u32 = 0x2000;

/// Maps an FX3 address to the compressed address space
///
/// | FX3 region | Address                   | Compressed          |
/// |------------|---------------------------|---------------------|
/// | SYSMEM     | 0x40000000 - 0x4007ffff   | 0x00000 - 0x7ffff   |
/// | ITCM       | 0x00000000 - 0x00003fff   | 0x80000 - 0x83fff   |
/// | DTCM       | 0x10000000 - 0x10001fff   | 0x84000 - 0x85fff   |
///
/// Returns None for addresses outside these regions.
pub fn compress_addr(addr: u32) -> Option<usize> {
    let c = if (FX3_SYSMEM_BASE..FX3_SYSMEM_BASE + FX3_SYSMEM_SIZE).contains(&addr) {
        addr - FX3_SYSMEM_BASE
    } else if (FX3_ITCM_BASE..FX3_ITCM_BASE + FX3_ITCM_SIZE).contains(&addr) {
        FX3_SYSMEM_SIZE + addr - FX3_ITCM_BASE
    } else if (FX3_DTCM_BASE..FX3_DTCM_BASE + FX3_DTCM_SIZE).contains(&addr) {
        FX3_SYSMEM_SIZE + FX3_ITCM_SIZE + addr - FX3_DTCM_BASE
    } else {
        return None;
    };
    Some(c as usize)
}

/// Inverse of [`compress_addr`]
pub fn uncompress_addr(c: usize) -> u32 {
    let c = c as u32;
    if c < FX3_SYSMEM_SIZE {
        FX3_SYSMEM_BASE + c
    } else if c < FX3_SYSMEM_SIZE + FX3_ITCM_SIZE {
        FX3_ITCM_BASE + c - FX3_SYSMEM_SIZE
    } else {
        FX3_DTCM_BASE + c - FX3_SYSMEM_SIZE - FX3_ITCM_SIZE
    }
}

/// A run of defined bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    /// Image address of the first byte
    pub address: usize,
    pub data: Vec<u8>,
}

/// A sparse firmware image
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareImage {
    data: Vec<Option<u8>>,
    start_vector: u32,
    fx3: bool,
    usb_ids: Option<(u16, u16)>,
}

fn damaged(message: impl Into<String>) -> Error {
    Error::firmware_upload(message)
}

impl FirmwareImage {
    /// An empty FX2 image
    pub fn fx2() -> Self {
        Self {
            data: vec![None; FX2_IMAGE_SIZE],
            start_vector: 0,
            fx3: false,
            usb_ids: None,
        }
    }

    /// An empty FX3 image (compressed address space)
    pub fn fx3() -> Self {
        Self {
            data: vec![None; FX3_IMAGE_SIZE],
            start_vector: 0,
            fx3: true,
            usb_ids: None,
        }
    }

    /// Loads an image from a file, picking the format by extension: `.img`
    /// is a Cypress FX3 boot image, anything else is Intel HEX
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        trace!("FirmwareImage::from_file {}", path.display());
        let bytes = std::fs::read(path)
            .map_err(|e| damaged(format!("{}: {e}", path.display())))?;
        let is_img = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("img"))
            .unwrap_or(false);
        if is_img {
            Self::from_fx3_img(&bytes)
        } else {
            let text = String::from_utf8_lossy(&bytes);
            Self::from_ihx(&text)
        }
    }

    /// Parses an Intel HEX file into an FX2 image.  Record checksums are
    /// verified.  Addresses must stay within 64 KiB.
    pub fn from_ihx(text: &str) -> Result<Self, Error> {
        let mut image = Self::fx2();
        let mut base: usize = 0;

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let lineno = n + 1;
            let body = line
                .strip_prefix(':')
                .ok_or_else(|| damaged(format!("Line {lineno}: ':' expected")))?;
            if body.len() < 10 || body.len() % 2 != 0 {
                return Err(damaged(format!("Line {lineno}: Invalid record length")));
            }

            let bytes = (0..body.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|e| damaged(format!("Line {lineno}: {e}")))?;

            let count = bytes[0] as usize;
            if bytes.len() != count + 5 {
                return Err(damaged(format!(
                    "Line {lineno}: Expected {count} data bytes, found {}",
                    bytes.len() - 5
                )));
            }
            let sum = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
            if sum != 0 {
                return Err(damaged(format!("Line {lineno}: Checksum error")));
            }

            let addr = ((bytes[1] as usize) << 8) | bytes[2] as usize;
            let data = &bytes[4..4 + count];
            match bytes[3] {
                0x00 => {
                    let start = base + addr;
                    if start + count > FX2_IMAGE_SIZE {
                        return Err(damaged(format!(
                            "Line {lineno}: Address 0x{start:x} out of range"
                        )));
                    }
                    image.set(start, data);
                }
                0x01 => break,
                0x02 if count == 2 => {
                    base = (((data[0] as usize) << 8) | data[1] as usize) << 4;
                }
                0x04 if count == 2 => {
                    base = (((data[0] as usize) << 8) | data[1] as usize) << 16;
                }
                0x03 | 0x05 if count == 4 => {
                    image.start_vector = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                }
                t => {
                    return Err(damaged(format!("Line {lineno}: Invalid record type {t}")));
                }
            }
        }

        debug!("Loaded Intel HEX image, {} bytes defined", image.defined());
        Ok(image)
    }

    /// Parses a Cypress FX3 boot image ("CY" header, word records, entry
    /// address and checksum)
    pub fn from_fx3_img(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 || &bytes[0..2] != b"CY" {
            return Err(damaged("Invalid FX3 image: Signature expected"));
        }
        if bytes[2] & 0x01 != 0 {
            return Err(damaged("Invalid FX3 image: Image is not executable"));
        }
        if bytes[3] != 0xb0 {
            return Err(damaged("Invalid FX3 image: Not a normal firmware image"));
        }

        let read_u32 = |offset: usize| -> Result<u32, Error> {
            bytes
                .get(offset..offset + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| damaged("Invalid FX3 image: Unexpected end of file"))
        };

        let mut image = Self::fx3();
        let mut offset = 4;
        let mut cs: u32 = 0;
        loop {
            let words = read_u32(offset)? as usize;
            let addr = read_u32(offset + 4)?;
            offset += 8;
            if words == 0 {
                image.start_vector = addr;
                break;
            }
            for k in 0..words {
                let word = read_u32(offset)?;
                cs = cs.wrapping_add(word);
                let a = addr.wrapping_add(4 * k as u32);
                let c = compress_addr(a).ok_or_else(|| {
                    damaged(format!("Invalid FX3 image: Address 0x{a:08x} out of range"))
                })?;
                if c + 4 > FX3_IMAGE_SIZE {
                    return Err(damaged(format!(
                        "Invalid FX3 image: Address 0x{a:08x} out of range"
                    )));
                }
                image.set(c, &word.to_le_bytes());
                offset += 4;
            }
        }

        let expected = read_u32(offset)?;
        if expected != cs {
            return Err(damaged(format!(
                "Invalid FX3 image: Checksum error: 0x{cs:08x} instead of 0x{expected:08x}"
            )));
        }

        debug!(
            "Loaded FX3 image, {} bytes defined, start vector 0x{:08x}",
            image.defined(),
            image.start_vector
        );
        Ok(image)
    }

    /// Defines the bytes at `addr..addr + data.len()`
    ///
    /// # Panics
    /// If the range exceeds the image size
    pub fn set(&mut self, addr: usize, data: &[u8]) {
        for (slot, b) in self.data[addr..addr + data.len()].iter_mut().zip(data) {
            *slot = Some(*b);
        }
    }

    pub fn get(&self, addr: usize) -> Option<u8> {
        self.data.get(addr).copied().flatten()
    }

    /// Size of the address space
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(Option::is_none)
    }

    /// Number of defined bytes
    pub fn defined(&self) -> usize {
        self.data.iter().filter(|b| b.is_some()).count()
    }

    pub fn start_vector(&self) -> u32 {
        self.start_vector
    }

    pub fn set_start_vector(&mut self, start_vector: u32) {
        self.start_vector = start_vector;
    }

    pub fn is_fx3(&self) -> bool {
        self.fx3
    }

    /// USB vendor and product ID written into the EEPROM boot header.  If
    /// unset, the IDs of the target device are used.
    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        self.usb_ids
    }

    pub fn set_usb_ids(&mut self, vid: u16, pid: u16) {
        self.usb_ids = Some((vid, pid));
    }

    pub(crate) fn bytes(&self) -> &[Option<u8>] {
        &self.data
    }

    /// Returns the runs of defined bytes in address order
    pub fn runs(&self) -> Vec<Run> {
        let mut runs = vec![];
        let mut i = 0;
        while i < self.data.len() {
            if self.data[i].is_none() {
                i += 1;
                continue;
            }
            let data: Vec<u8> = self.data[i..].iter().map_while(|b| *b).collect();
            let len = data.len();
            runs.push(Run { address: i, data });
            i += len;
        }
        runs
    }

    /// Locates the ZTEX descriptor embedded in the image by its prefix
    /// (size, version and signature)
    pub fn descriptor(&self) -> Option<ZtexDescriptor> {
        let mut prefix = [0u8; 6];
        prefix[0] = ZTEX_DESCRIPTOR_SIZE as u8;
        prefix[1] = ZTEX_DESCRIPTOR_VERSION;
        prefix[2..6].copy_from_slice(ZTEX_DESCRIPTOR_SIGNATURE);

        let last = self.data.len().checked_sub(ZTEX_DESCRIPTOR_SIZE)?;
        (0..=last)
            .find(|&i| {
                prefix
                    .iter()
                    .enumerate()
                    .all(|(k, p)| self.data[i + k] == Some(*p))
            })
            .and_then(|i| {
                let raw: Vec<u8> = self.data[i..i + ZTEX_DESCRIPTOR_SIZE]
                    .iter()
                    .map(|b| b.unwrap_or(0))
                    .collect();
                ZtexDescriptor::parse(&raw).ok()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_round_trip() {
        for addr in [0x4000_0000, 0x4007_fffc, 0x0, 0x3ffc, 0x1000_0000, 0x1000_1ffc] {
            let c = compress_addr(addr).unwrap();
            assert!(c < FX3_IMAGE_SIZE);
            assert_eq!(uncompress_addr(c), addr);
        }
        assert_eq!(compress_addr(0x4000_0100), Some(0x100));
        assert_eq!(compress_addr(0x100), Some(0x80100));
        assert_eq!(compress_addr(0x1000_0010), Some(0x84010));
        assert_eq!(compress_addr(0x2000_0000), None);
        assert_eq!(compress_addr(0x4008_0000), None);
    }

    #[test]
    fn test_ihx_parse() {
        let text = ":0300000002000AF1\n:02000A001234AE\n:00000001FF\n";
        let image = FirmwareImage::from_ihx(text).unwrap();
        assert!(!image.is_fx3());
        assert_eq!(
            image.runs(),
            vec![
                Run {
                    address: 0,
                    data: vec![0x02, 0x00, 0x0a]
                },
                Run {
                    address: 0x0a,
                    data: vec![0x12, 0x34]
                },
            ]
        );
        assert_eq!(image.get(3), None);
    }

    #[test]
    fn test_ihx_bad_checksum() {
        let text = ":0300000002000AF2\n";
        assert!(matches!(
            FirmwareImage::from_ihx(text),
            Err(Error::FirmwareUpload { .. })
        ));
    }

    #[test]
    fn test_ihx_extended_linear_out_of_range() {
        let text = ":020000040001F9\n:0100000055AA\n";
        assert!(FirmwareImage::from_ihx(text).is_err());
    }

    fn fx3_img(records: &[(u32, &[u32])], entry: u32) -> Vec<u8> {
        let mut out = vec![b'C', b'Y', 0x1c, 0xb0];
        let mut cs: u32 = 0;
        for (addr, words) in records {
            out.extend_from_slice(&(words.len() as u32).to_le_bytes());
            out.extend_from_slice(&addr.to_le_bytes());
            for w in *words {
                cs = cs.wrapping_add(*w);
                out.extend_from_slice(&w.to_le_bytes());
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&cs.to_le_bytes());
        out
    }

    #[test]
    fn test_fx3_img_parse() {
        let img = fx3_img(
            &[(0x4000_3000, &[0x1122_3344, 0xffff_ffff]), (0x100, &[7])],
            0x4000_3000,
        );
        let image = FirmwareImage::from_fx3_img(&img).unwrap();
        assert!(image.is_fx3());
        assert_eq!(image.start_vector(), 0x4000_3000);
        assert_eq!(image.get(0x3000), Some(0x44));
        assert_eq!(image.get(0x3003), Some(0x11));
        assert_eq!(image.get(0x80100), Some(7));
        assert_eq!(image.defined(), 12);
    }

    #[test]
    fn test_fx3_img_checksum_error() {
        let mut img = fx3_img(&[(0x4000_0000, &[1, 2])], 0x4000_0000);
        let n = img.len();
        img[n - 1] ^= 0x80;
        assert!(FirmwareImage::from_fx3_img(&img).is_err());
    }

    #[test]
    fn test_embedded_descriptor() {
        let mut image = FirmwareImage::fx2();
        let mut raw = vec![0u8; ZTEX_DESCRIPTOR_SIZE];
        raw[0] = 40;
        raw[1] = 1;
        raw[2..6].copy_from_slice(b"ZTEX");
        raw[6..10].copy_from_slice(&[10, 30, 0, 0]);
        raw[11] = 1;
        image.set(0x6c, &raw);
        let d = image.descriptor().unwrap();
        assert_eq!(d.product_id, [10, 30, 0, 0]);
        assert_eq!(d.interface_version, 1);

        assert!(FirmwareImage::fx2().descriptor().is_none());
    }
}
