//! Bitstream preparation shared by FPGA configuration and Flash storage.
//!
//! A bitstream is read completely into memory, its bit order detected from
//! the sync word, optionally bit-reversed and then split into transfer
//! chunks.
use crate::constants::*;
use crate::Error;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::io::Read;

/// Largest bitstream accepted
pub const MAX_BITSTREAM_SIZE: usize = 64 * 1024 * 1024;

const SYNC_WORD: [u8; 4] = [0xaa, 0x99, 0x55, 0x66];
const SYNC_WORD_SWAPPED: [u8; 4] = [0x55, 0x99, 0xaa, 0x66];

/// Bit order handling of a bitstream upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitSwap {
    /// Send bytes as read
    Off,
    /// Reverse the bits of every byte
    On,
    /// Decide from the sync word
    #[default]
    Auto,
}

impl BitSwap {
    /// Returns true if bits must be reversed.  `head` is the start of the
    /// bitstream and only examined in [`BitSwap::Auto`] mode.
    pub fn resolve(self, head: &[u8]) -> bool {
        match self {
            BitSwap::Off => false,
            BitSwap::On => true,
            BitSwap::Auto => detect_bit_order(head),
        }
    }
}

/// Detects the bit order from the first sync word in `buf`.  Returns true
/// if `55 99 AA 66` is found, i.e. the bits need reversing.  Without any
/// sync word a warning is logged and false returned.
pub fn detect_bit_order(buf: &[u8]) -> bool {
    for window in buf.windows(4) {
        if window == SYNC_WORD {
            return false;
        }
        if window == SYNC_WORD_SWAPPED {
            return true;
        }
    }
    warn!("Unable to determine bitstream bit order: no signature found");
    false
}

/// Returns the length of the header in front of the raw bitstream.  The raw
/// bitstream starts with at least 4 0xFF bytes followed by a sync word in
/// either bit order.  Returns 0 with a warning if no start is found.
pub fn detect_bitstream_start(buf: &[u8]) -> usize {
    let mut ones = 0;
    for i in 0..buf.len().saturating_sub(3) {
        if ones >= 4 {
            let word = &buf[i..i + 4];
            if word == SYNC_WORD || word == SYNC_WORD_SWAPPED {
                return i - ones;
            }
        }
        ones = if buf[i] == 0xff { ones + 1 } else { 0 };
    }
    warn!("Unable to determine start of raw bitstream");
    0
}

/// Reverses the bit order of every byte
pub fn swap_bits(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = b.reverse_bits();
    }
}

/// Reads a complete bitstream
///
/// # Errors
/// * `BitstreamRead` - on I/O errors, or if the stream exceeds 64 MiB
pub fn read_bitstream<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    reader
        .take(MAX_BITSTREAM_SIZE as u64 + 1)
        .read_to_end(&mut data)?;
    if data.len() > MAX_BITSTREAM_SIZE {
        return Err(Error::bitstream_read(format!(
            "Bitstream larger than {MAX_BITSTREAM_SIZE} bytes"
        )));
    }
    debug!("Read bitstream of {} bytes", data.len());
    Ok(data)
}

/// A bitstream split into transfer chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitstream {
    chunks: Vec<Vec<u8>>,
    size: usize,
    checksum: u8,
}

impl Bitstream {
    /// Prepares `data` for low speed configuration in 2048 byte chunks.
    ///
    /// A final chunk shorter than 2048 bytes whose length is a multiple of
    /// 64 gets one padding byte, so that the total never is a multiple of
    /// 64.  The firmware cannot tell such a transfer end from a framing
    /// boundary.
    ///
    /// # Errors
    /// * `BitstreamRead` - empty data, or fewer than 64 bytes, or a multiple
    ///   of 64 bytes after padding
    pub fn low_speed(data: &[u8], swap: BitSwap) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::bitstream_read("Empty bitstream"));
        }
        let head = &data[..data.len().min(FPGA_LS_TRANSACTION_SIZE)];
        let reverse = swap.resolve(head);

        let mut chunks: Vec<Vec<u8>> = data
            .chunks(FPGA_LS_TRANSACTION_SIZE)
            .filter(|c| c.len() == FPGA_LS_TRANSACTION_SIZE)
            .map(<[u8]>::to_vec)
            .collect();
        let mut last = data[chunks.len() * FPGA_LS_TRANSACTION_SIZE..].to_vec();
        if last.len() % 64 == 0 {
            last.push(0);
        }
        chunks.push(last);

        if reverse {
            chunks.iter_mut().for_each(|c| swap_bits(c));
        }

        let bitstream = Self::from_chunks(chunks);
        if bitstream.size < 64 || bitstream.size % 64 == 0 {
            return Err(Error::bitstream_read(format!(
                "Invalid file size: {}",
                bitstream.size
            )));
        }
        Ok(bitstream)
    }

    /// Prepares `data` for high speed configuration in 64 KiB chunks, led
    /// by 512 bytes of zeros.
    ///
    /// # Errors
    /// * `BitstreamRead` - empty data
    pub fn high_speed(data: &[u8], swap: BitSwap) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::bitstream_read("Empty bitstream"));
        }
        let mut stream = vec![0u8; FPGA_HS_DUMMY_HEADER];
        stream.extend_from_slice(data);
        let head = &stream[..stream.len().min(FPGA_HS_TRANSACTION_SIZE)];
        if swap.resolve(head) {
            swap_bits(&mut stream);
        }
        let chunks = stream
            .chunks(FPGA_HS_TRANSACTION_SIZE)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Self::from_chunks(chunks))
    }

    fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        let size = chunks.iter().map(Vec::len).sum();
        let checksum = chunks
            .iter()
            .flatten()
            .fold(0u8, |cs, b| cs.wrapping_add(*b));
        Self {
            chunks,
            size,
            checksum,
        }
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Total bytes to transfer, including padding
    pub fn size(&self) -> usize {
        self.size
    }

    /// 8 bit sum of all bytes, as computed by the firmware
    pub fn checksum(&self) -> u8 {
        self.checksum
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A bitstream with a header, the 0xFF preamble and a sync word
    pub(crate) fn sample(len: usize, sync: [u8; 4]) -> Vec<u8> {
        let mut data = b"header\x00\x09".to_vec();
        data.extend_from_slice(&[0xff; 8]);
        data.extend_from_slice(&sync);
        let mut i = 0u8;
        while data.len() < len {
            data.push(i);
            i = i.wrapping_add(7);
        }
        data.truncate(len);
        data
    }

    #[test]
    fn test_bit_order_detection() {
        let mut buf = vec![0u8; 100];
        buf[37..41].copy_from_slice(&[0xaa, 0x99, 0x55, 0x66]);
        assert!(!detect_bit_order(&buf));
        buf[37..41].copy_from_slice(&[0x55, 0x99, 0xaa, 0x66]);
        assert!(detect_bit_order(&buf));
        assert!(!detect_bit_order(&[1, 2, 3]));
        assert!(!detect_bit_order(&[]));
    }

    #[test]
    fn test_bitstream_start() {
        let data = sample(200, SYNC_WORD);
        assert_eq!(detect_bitstream_start(&data), 8);
        // three 0xff bytes are not a preamble
        let mut short = vec![1, 2, 0xff, 0xff, 0xff];
        short.extend_from_slice(&SYNC_WORD);
        assert_eq!(detect_bitstream_start(&short), 0);
    }

    #[test]
    fn test_swap_bits() {
        let mut buf = [0x01, 0x80, 0xaa, 0x0f];
        swap_bits(&mut buf);
        assert_eq!(buf, [0x80, 0x01, 0x55, 0xf0]);
    }

    #[test]
    fn test_low_speed_chunks_and_padding() {
        let data = sample(2048 + 128, SYNC_WORD);
        let bs = Bitstream::low_speed(&data, BitSwap::Auto).unwrap();
        assert_eq!(bs.chunks().len(), 2);
        assert_eq!(bs.chunks()[1].len(), 129);
        assert_eq!(bs.size(), 2048 + 129);
        let cs = data.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(bs.checksum(), cs);

        // exact multiple of the chunk size gets a one byte trailer
        let bs = Bitstream::low_speed(&sample(4096, SYNC_WORD), BitSwap::Off).unwrap();
        assert_eq!(bs.chunks().len(), 3);
        assert_eq!(bs.chunks()[2], vec![0]);
    }

    #[test]
    fn test_low_speed_swaps_detected_order() {
        let data = sample(300, SYNC_WORD_SWAPPED);
        let bs = Bitstream::low_speed(&data, BitSwap::Auto).unwrap();
        assert_eq!(bs.chunks()[0][0], data[0].reverse_bits());
        let bs = Bitstream::low_speed(&data, BitSwap::Off).unwrap();
        assert_eq!(bs.chunks()[0][0], data[0]);
    }

    #[test]
    fn test_low_speed_size_checks() {
        assert!(matches!(
            Bitstream::low_speed(&[], BitSwap::Off),
            Err(Error::BitstreamRead { .. })
        ));
        assert_eq!(
            Bitstream::low_speed(&[1; 40], BitSwap::Off),
            Err(Error::bitstream_read("Invalid file size: 40"))
        );
    }

    #[test]
    fn test_high_speed_dummy_header() {
        let data = sample(70000, SYNC_WORD);
        let bs = Bitstream::high_speed(&data, BitSwap::Auto).unwrap();
        assert_eq!(bs.size(), 70000 + 512);
        assert_eq!(bs.chunks().len(), 2);
        assert!(bs.chunks()[0][..512].iter().all(|b| *b == 0));
        assert_eq!(&bs.chunks()[0][512..520], &data[..8]);
    }

    #[test]
    fn test_read_bitstream() {
        let data = sample(5000, SYNC_WORD);
        let mut reader = std::io::Cursor::new(data.clone());
        assert_eq!(read_bitstream(&mut reader).unwrap(), data);
    }
}
