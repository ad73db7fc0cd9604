//! ATxmega NVM programming through the firmware's PDI bridge
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::image::FirmwareImage;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::{Duration, Instant};

pub const XMEGA_EC_NO_ERROR: u8 = 0;
pub const XMEGA_EC_PDI_READ_ERROR: u8 = 1;
pub const XMEGA_EC_NVM_TIMEOUT: u8 = 2;
pub const XMEGA_EC_INVALID_DEVICE: u8 = 3;
pub const XMEGA_EC_ADDRESS_ERROR: u8 = 4;
pub const XMEGA_EC_NVM_BUSY: u8 = 5;

/// Size of the address space covered by an XMEGA image
const XMEGA_IMAGE_SIZE: usize = 0x10000;

pub fn xmega_error_string(ec: u8) -> String {
    match ec {
        XMEGA_EC_NO_ERROR => "USB error".to_string(),
        XMEGA_EC_PDI_READ_ERROR => "PDI read error".to_string(),
        XMEGA_EC_NVM_TIMEOUT => "NVM timeout error".to_string(),
        XMEGA_EC_INVALID_DEVICE => "Invalid or unsupported ATxmega".to_string(),
        XMEGA_EC_ADDRESS_ERROR => "Address error (invalid address or wrong page size)".to_string(),
        XMEGA_EC_NVM_BUSY => "NVM busy".to_string(),
        n => format!("Error {n}"),
    }
}

/// Error code and geometry reported by VR 0x48
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmegaState {
    pub ec: u8,
    pub flash_pages: u16,
    pub eeprom_pages: u16,
    pub flash_page_size: usize,
    pub eeprom_page_size: usize,
}

impl XmegaState {
    pub fn decode(buf: &[u8; 7]) -> Self {
        Self {
            ec: buf[0],
            flash_pages: u16::from_le_bytes([buf[1], buf[2]]),
            eeprom_pages: u16::from_le_bytes([buf[3], buf[4]]),
            flash_page_size: 1 << (buf[5] & 15),
            eeprom_page_size: 1 << (buf[6] & 15),
        }
    }

    /// True if a controller is attached
    pub fn enabled(&self) -> bool {
        self.flash_pages > 0 && self.eeprom_pages > 0
    }
}

/// The two page-programmable XMEGA memories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmegaMemory {
    Flash,
    Eeprom,
}

impl XmegaMemory {
    fn code(self) -> u8 {
        match self {
            XmegaMemory::Flash => XMEGA_FLASH,
            XmegaMemory::Eeprom => XMEGA_EEPROM,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            XmegaMemory::Flash => "Flash",
            XmegaMemory::Eeprom => "EEPROM",
        }
    }

    fn page_size(self, state: &XmegaState) -> usize {
        match self {
            XmegaMemory::Flash => state.flash_page_size,
            XmegaMemory::Eeprom => state.eeprom_page_size,
        }
    }
}

/// XMEGA access, see [`Ztex::xmega`]
#[derive(Debug)]
pub struct Xmega<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

impl<'a, D: Device> Xmega<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    /// Reads error code and geometry, refreshing the cached state
    pub fn state(&mut self) -> Result<XmegaState, Error> {
        self.ztex.check_capability(Capability::Xmega)?;
        let mut buf = [0u8; 7];
        self.ztex
            .vendor_request_exact(VR_XMEGA_STATE, "Xmega state", 0, 0, &mut buf)?;
        let state = XmegaState::decode(&buf);
        self.ztex.xmega_state = Some(state);
        Ok(state)
    }

    /// The cached state, queried on first use
    pub fn cached_state(&mut self) -> Result<XmegaState, Error> {
        match self.ztex.xmega_state {
            Some(state) => Ok(state),
            None => self.state(),
        }
    }

    /// Last error reported by the firmware, as text
    pub fn error_string(&mut self) -> String {
        match self.state() {
            Ok(state) => xmega_error_string(state.ec),
            Err(e) => format!("Unknown error (Error receiving error code: {e})"),
        }
    }

    pub fn enabled(&mut self) -> Result<bool, Error> {
        Ok(self.cached_state()?.enabled())
    }

    pub fn flash_pages(&mut self) -> Result<u16, Error> {
        Ok(self.cached_state()?.flash_pages)
    }

    pub fn eeprom_pages(&mut self) -> Result<u16, Error> {
        Ok(self.cached_state()?.eeprom_pages)
    }

    pub fn flash_page_size(&mut self) -> Result<usize, Error> {
        Ok(self.cached_state()?.flash_page_size)
    }

    pub fn eeprom_page_size(&mut self) -> Result<usize, Error> {
        Ok(self.cached_state()?.eeprom_page_size)
    }

    /// Replaces a transport error by one carrying the firmware's error text
    fn wrap(&mut self, what: &str, e: Error) -> Error {
        if !e.is_transport() {
            return e;
        }
        debug!("{e}");
        Error::usb(format!("{what}: {}", self.error_string()))
    }

    /// Resets the controller (VC 0x49)
    pub fn reset(&mut self) -> Result<(), Error> {
        trace!("Xmega::reset");
        self.ztex.check_capability(Capability::Xmega)?;
        match self
            .ztex
            .vendor_command(VC_XMEGA_RESET, "XMEGA Reset", 0, 0, &[])
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.wrap("NVM Reset", e)),
        }
    }

    fn read_inner(&mut self, code: u8, what: &str, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        trace!("Xmega::read {what} addr 0x{addr:x} len {}", buf.len());
        self.ztex.check_capability(Capability::Xmega)?;
        if let Err(e) =
            self.ztex
                .vendor_request_exact(code, what, addr as u16, (addr >> 16) as u16, buf)
        {
            return Err(self.wrap(what, e));
        }
        self.ztex.delay(XMEGA_SETTLE);
        Ok(())
    }

    /// Reads NVM at `addr` of the PDI address space (VR 0x4A)
    pub fn nvm_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read_inner(VR_XMEGA_NVM_READ, "NVM Read", addr, buf)
    }

    /// Reads Flash relative to the Flash base (VR 0x4B)
    pub fn flash_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read_inner(XMEGA_FLASH, "XMEGA Flash Read", addr, buf)
    }

    /// Reads EEPROM relative to the EEPROM base (VR 0x4C)
    pub fn eeprom_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read_inner(XMEGA_EEPROM, "XMEGA EEPROM Read", addr, buf)
    }

    /// Reads fuses relative to the fuse base (VR 0x4D)
    pub fn fuses_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read_inner(XMEGA_FUSE, "XMEGA Fuse Read", addr, buf)
    }

    /// Reads a single fuse
    pub fn fuse_read(&mut self, idx: u16) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_inner(XMEGA_FUSE, "XMEGA Fuse Read", idx as u32, &mut buf)?;
        Ok(buf[0])
    }

    /// Writes one page.  Only the first page size bytes of `buf` are sent.
    ///
    /// # Errors
    /// * `OutOfRange` - `buf` is shorter than a page
    pub fn page_write(&mut self, memory: XmegaMemory, addr: u32, buf: &[u8]) -> Result<(), Error> {
        trace!("Xmega::page_write {} addr 0x{addr:x}", memory.name());
        self.ztex.check_capability(Capability::Xmega)?;
        let page_size = memory.page_size(&self.cached_state()?);
        if buf.len() < page_size {
            return Err(Error::out_of_range(format!(
                "Buffer smaller than the {} page size: {} < {page_size}",
                memory.name(),
                buf.len()
            )));
        }
        let what = format!("XMEGA {} page write", memory.name());
        if let Err(e) = self.ztex.vendor_command(
            memory.code(),
            &what,
            addr as u16,
            (addr >> 16) as u16,
            &buf[..page_size],
        ) {
            return Err(self.wrap(&what, e));
        }
        self.ztex.delay(XMEGA_SETTLE);
        Ok(())
    }

    pub fn flash_page_write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Error> {
        self.page_write(XmegaMemory::Flash, addr, buf)
    }

    pub fn eeprom_page_write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Error> {
        self.page_write(XmegaMemory::Eeprom, addr, buf)
    }

    /// Writes fuse `idx` (VC 0x4D)
    pub fn fuse_write(&mut self, idx: u16, val: u8) -> Result<(), Error> {
        trace!("Xmega::fuse_write {idx} 0x{val:02x}");
        self.ztex.check_capability(Capability::Xmega)?;
        if let Err(e) = self
            .ztex
            .vendor_command(XMEGA_FUSE, "XMEGA Fuse write", val as u16, idx, &[])
        {
            return Err(self.wrap("XMEGA Fuse write", e));
        }
        self.ztex.delay(XMEGA_SETTLE);
        Ok(())
    }

    fn memory_read(&mut self, memory: XmegaMemory, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        match memory {
            XmegaMemory::Flash => self.flash_read(addr, buf),
            XmegaMemory::Eeprom => self.eeprom_read(addr, buf),
        }
    }

    /// Programs the defined bytes of a 64 KiB image into `memory`.
    ///
    /// Only pages containing defined bytes are written.  Pages that are
    /// partially defined are read first so that undefined bytes keep their
    /// contents.  Each page is read back, with up to 3 attempts.
    ///
    /// # Errors
    /// * `FirmwareUpload` - a page still differs after the last attempt
    pub fn write_image(&mut self, memory: XmegaMemory, image: &FirmwareImage) -> Result<Duration, Error> {
        trace!("Xmega::write_image {}", memory.name());
        self.ztex.check_capability(Capability::Xmega)?;
        let page_size = memory.page_size(&self.cached_state()?);
        let start = Instant::now();

        let data = image.bytes();
        let limit = data.len().min(XMEGA_IMAGE_SIZE);
        let mut page = vec![0u8; page_size];
        let mut readback = vec![0u8; page_size];

        for base in (0..limit).step_by(page_size) {
            let bytes = &data[base..limit.min(base + page_size)];
            if bytes.iter().all(Option::is_none) {
                continue;
            }
            if bytes.iter().any(Option::is_none) {
                self.memory_read(memory, base as u32, &mut page)?;
            }
            for (p, b) in page.iter_mut().zip(bytes) {
                if let Some(b) = b {
                    *p = *b;
                }
            }

            let mut attempt = 1;
            loop {
                self.page_write(memory, base as u32, &page)?;
                self.memory_read(memory, base as u32, &mut readback)?;
                if readback == page {
                    break;
                }
                if attempt >= PAGE_WRITE_TRIES {
                    return Err(Error::firmware_upload(format!(
                        "Verification of {} page {base} failed",
                        memory.name()
                    )));
                }
                warn!(
                    "Verification of {} page {base} failed (try {attempt})",
                    memory.name()
                );
                attempt += 1;
            }
        }

        let elapsed = start.elapsed();
        info!(
            "Image written to XMEGA {} in {} ms",
            memory.name(),
            elapsed.as_millis()
        );
        Ok(elapsed)
    }

    /// Programs a firmware image into the XMEGA Flash
    pub fn write_firmware(&mut self, image: &FirmwareImage) -> Result<Duration, Error> {
        self.write_image(XmegaMemory::Flash, image)
    }

    /// Programs a data image into the XMEGA EEPROM
    pub fn write_eeprom(&mut self, image: &FirmwareImage) -> Result<Duration, Error> {
        self.write_image(XmegaMemory::Eeprom, image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Transfer};
    use crate::ztex::ZtexConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// 32 byte Flash pages, 16 byte EEPROM pages, error code `ec`
    fn state_reply(ec: u8) -> Vec<u8> {
        vec![ec, 0x00, 0x08, 0x40, 0x00, 5, 4]
    }

    fn emulate_xmega(device: &mut MockDevice) -> Rc<RefCell<Vec<u8>>> {
        let mem = Rc::new(RefCell::new(vec![0xffu8; 0x10000]));
        device.on_request_reply(VR_XMEGA_STATE, state_reply(0));
        let m = mem.clone();
        device.on_request(XMEGA_FLASH, move |value, index, buf| {
            let addr = value as usize | (index as usize) << 16;
            buf.copy_from_slice(&m.borrow()[addr..addr + buf.len()]);
            Ok(buf.len())
        });
        let m = mem.clone();
        device.on_command(XMEGA_FLASH, move |value, index, data| {
            let addr = value as usize | (index as usize) << 16;
            m.borrow_mut()[addr..addr + data.len()].copy_from_slice(data);
            Ok(data.len())
        });
        mem
    }

    fn ztex_with_xmega() -> (Ztex<MockDevice>, Rc<RefCell<Vec<u8>>>) {
        let mut device = MockDevice::new(&[Capability::Xmega]);
        let mem = emulate_xmega(&mut device);
        (Ztex::new(device, ZtexConfig::default()).unwrap(), mem)
    }

    #[test]
    fn test_state_decode() {
        let (mut z, _) = ztex_with_xmega();
        let state = z.xmega().state().unwrap();
        assert_eq!(
            state,
            XmegaState {
                ec: 0,
                flash_pages: 2048,
                eeprom_pages: 64,
                flash_page_size: 32,
                eeprom_page_size: 16,
            }
        );
        assert!(z.xmega().enabled().unwrap());
        // cached afterwards
        z.xmega().flash_page_size().unwrap();
        assert_eq!(z.device().count(VR_XMEGA_STATE), 1);
    }

    #[test]
    fn test_write_image_merges_partial_pages() {
        let (mut z, mem) = ztex_with_xmega();
        mem.borrow_mut()[32..64].copy_from_slice(&[0xaa; 32]);

        let mut image = FirmwareImage::fx2();
        image.set(0, &[1; 32]);
        image.set(40, &[2, 3]);
        z.xmega().write_firmware(&image).unwrap();

        let mem = mem.borrow();
        assert_eq!(&mem[..32], &[1; 32]);
        assert_eq!(&mem[38..44], &[0xaa, 0xaa, 2, 3, 0xaa, 0xaa]);
        assert_eq!(mem[64], 0xff);

        let pages: Vec<u16> = z
            .device()
            .commands(XMEGA_FLASH)
            .iter()
            .map(|t| match t {
                Transfer::Out { value, data, .. } => {
                    assert_eq!(data.len(), 32);
                    *value
                }
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(pages, vec![0, 32]);
    }

    #[test]
    fn test_write_image_verification_failure() {
        let (mut z, _) = ztex_with_xmega();
        z.device_mut().accept_command(XMEGA_FLASH);
        let mut image = FirmwareImage::fx2();
        image.set(0, &[7; 32]);
        assert_eq!(
            z.xmega().write_firmware(&image),
            Err(Error::firmware_upload("Verification of Flash page 0 failed"))
        );
        assert_eq!(z.device().commands(XMEGA_FLASH).len(), 3);
    }

    #[test]
    fn test_short_page_buffer() {
        let (mut z, _) = ztex_with_xmega();
        assert_eq!(
            z.xmega().eeprom_page_write(0, &[0; 8]),
            Err(Error::out_of_range(
                "Buffer smaller than the EEPROM page size: 8 < 16"
            ))
        );
    }

    #[test]
    fn test_transport_error_reports_firmware_error() {
        let mut device = MockDevice::new(&[Capability::Xmega]);
        device.on_request_reply(VR_XMEGA_STATE, state_reply(XMEGA_EC_PDI_READ_ERROR));
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            z.xmega().fuses_read(0, &mut buf),
            Err(Error::usb("XMEGA Fuse Read: PDI read error"))
        );
    }

    #[test]
    fn test_fuse_write() {
        let (mut z, _) = ztex_with_xmega();
        z.device_mut().accept_command(XMEGA_FUSE);
        z.xmega().fuse_write(2, 0xbf).unwrap();
        assert_eq!(
            z.device().commands(XMEGA_FUSE)[0],
            &Transfer::Out {
                request: XMEGA_FUSE,
                value: 0xbf,
                index: 2,
                data: vec![],
                timeout: DEFAULT_CONTROL_TIMEOUT,
            }
        );
        assert_eq!(z.device().delays, vec![XMEGA_SETTLE]);
    }

    #[test]
    fn test_error_strings() {
        assert_eq!(xmega_error_string(XMEGA_EC_NVM_BUSY), "NVM busy");
        assert_eq!(xmega_error_string(9), "Error 9");
    }
}
