//! The EZ-USB boot EEPROM
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Result of the last EEPROM write as reported by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromState {
    /// Number of bytes written by the last write
    pub bytes: u16,
    /// 8 bit sum of the bytes written by the last write
    pub checksum: u8,
    pub ready: bool,
}

/// EEPROM access, see [`Ztex::eeprom`]
#[derive(Debug)]
pub struct Eeprom<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

impl<'a, D: Device> Eeprom<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    /// Reads the EEPROM state (VR 0x3A)
    pub fn state(&mut self) -> Result<EepromState, Error> {
        self.ztex.check_capability(Capability::Eeprom)?;
        let mut buf = [0u8; 4];
        self.ztex
            .vendor_request_exact(VR_EEPROM_STATE, "EEPROM State", 0, 0, &mut buf)?;
        Ok(EepromState {
            bytes: u16::from_le_bytes([buf[0], buf[1]]),
            checksum: buf[2],
            ready: buf[3] == 0,
        })
    }

    /// Polls the state until the EEPROM is ready
    ///
    /// # Errors
    /// * `Busy` - still not ready after 20 polls, 200ms apart
    pub fn wait_ready(&mut self) -> Result<EepromState, Error> {
        for attempt in 1..=FLASH_BUSY_TRIES {
            let state = self.state()?;
            if state.ready {
                return Ok(state);
            }
            if attempt < FLASH_BUSY_TRIES {
                self.ztex.delay(FLASH_BUSY_POLL_INTERVAL);
            }
        }
        Err(Error::Busy {
            what: "EEPROM".to_string(),
            tries: FLASH_BUSY_TRIES,
        })
    }

    /// Writes `data` at `addr` (VC 0x39).  A write that starts inside a 64
    /// byte block is split at the block boundary.
    pub fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        trace!("Eeprom::write addr 0x{addr:04x} len {}", data.len());
        self.ztex.check_capability(Capability::Eeprom)?;

        let offset = addr % EEPROM_WRITE_BOUNDARY;
        if offset != 0 && !data.is_empty() {
            let first = data.len().min((EEPROM_WRITE_BOUNDARY - offset) as usize);
            self.ztex
                .vendor_command(VC_EEPROM_WRITE, "EEPROM Write", addr, 0, &data[..first])?;
            self.ztex.delay(EEPROM_SETTLE);
            if first < data.len() {
                self.ztex.vendor_command(
                    VC_EEPROM_WRITE,
                    "EEPROM Write",
                    addr + first as u16,
                    0,
                    &data[first..],
                )?;
            }
        } else {
            self.ztex
                .vendor_command(VC_EEPROM_WRITE, "EEPROM Write", addr, 0, data)?;
        }
        self.ztex.delay(EEPROM_SETTLE);
        Ok(())
    }

    /// Reads `buf.len()` bytes from `addr` (VR 0x38)
    pub fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error> {
        trace!("Eeprom::read addr 0x{addr:04x} len {}", buf.len());
        self.ztex.check_capability(Capability::Eeprom)?;
        self.ztex
            .vendor_request_exact(VR_EEPROM_READ, "EEPROM Read", addr, 0, buf)?;
        self.ztex.delay(EEPROM_SETTLE);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Transfer};
    use crate::ztex::ZtexConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Emulates a 64 KiB EEPROM behind the EEPROM requests
    pub(crate) fn emulate_eeprom(device: &mut MockDevice) -> Rc<RefCell<Vec<u8>>> {
        let mem = Rc::new(RefCell::new(vec![0xffu8; 0x10000]));
        let last = Rc::new(RefCell::new((0u16, 0u8)));

        let m = mem.clone();
        let l = last.clone();
        device.on_command(VC_EEPROM_WRITE, move |addr, _, data| {
            let mut mem = m.borrow_mut();
            mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
            let cs = data.iter().fold(0u8, |a, b| a.wrapping_add(*b));
            *l.borrow_mut() = (data.len() as u16, cs);
            Ok(data.len())
        });
        let m = mem.clone();
        device.on_request(VR_EEPROM_READ, move |addr, _, buf| {
            let mem = m.borrow();
            buf.copy_from_slice(&mem[addr as usize..addr as usize + buf.len()]);
            Ok(buf.len())
        });
        let l = last.clone();
        device.on_request(VR_EEPROM_STATE, move |_, _, buf| {
            let (bytes, cs) = *l.borrow();
            let [lo, hi] = bytes.to_le_bytes();
            buf[..4].copy_from_slice(&[lo, hi, cs, 0]);
            Ok(4)
        });
        mem
    }

    #[test]
    fn test_unaligned_write_is_split() {
        let mut device = MockDevice::new(&[Capability::Eeprom]);
        let mem = emulate_eeprom(&mut device);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();

        let data: Vec<u8> = (0..100).collect();
        z.eeprom().write(60, &data).unwrap();

        let writes: Vec<(u16, usize)> = z
            .device()
            .commands(VC_EEPROM_WRITE)
            .iter()
            .map(|t| match t {
                Transfer::Out { value, data, .. } => (*value, data.len()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(writes, vec![(60, 4), (64, 96)]);
        assert_eq!(&mem.borrow()[60..160], &data[..]);
        assert_eq!(z.device().delays, vec![EEPROM_SETTLE, EEPROM_SETTLE]);
    }

    #[test]
    fn test_read_round_trip() {
        let mut device = MockDevice::new(&[Capability::Eeprom]);
        emulate_eeprom(&mut device);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        z.eeprom().write(0x100, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        z.eeprom().read(0x100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_busy_bound() {
        let mut device = MockDevice::new(&[Capability::Eeprom]);
        device.on_request_reply(VR_EEPROM_STATE, vec![0, 0, 0, 1]);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        assert_eq!(
            z.eeprom().wait_ready(),
            Err(Error::Busy {
                what: "EEPROM".to_string(),
                tries: 20
            })
        );
        assert_eq!(z.device().count(VR_EEPROM_STATE), 20);
        assert_eq!(z.device().delays, vec![FLASH_BUSY_POLL_INTERVAL; 19]);
    }

    #[test]
    fn test_requires_capability() {
        let device = MockDevice::new(&[Capability::Fpga]);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        assert_eq!(
            z.eeprom().write(0, &[0]),
            Err(Error::capability("EEPROM read/write"))
        );
        assert!(z.device().transfers.is_empty());
    }
}
