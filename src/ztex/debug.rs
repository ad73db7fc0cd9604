//! Firmware debug helpers.
//!
//! Version 1 is a ring buffer of fixed size messages with a 16 bit message
//! counter.  Version 2 (FX3 firmware) is an indexed log of typed entries.
//! Both share VR 0x28 and keep their read cursors in the [`Ztex`] facade.
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Size of a v2 message buffer
const DEBUG2_MAX_LENGTH: usize = 4096;
/// Size of the v2 reply header, the message type is its last byte
const DEBUG2_HEADER_SIZE: usize = 10;

const DEBUG2_TYPE_TEXT: u8 = 1;
const DEBUG2_TYPE_RUNTIME_ERROR: u8 = 2;

/// Per session state of both debug helpers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DebugState {
    /// Stack size in messages and message size in bytes
    geometry: Option<(usize, usize)>,
    last_msg: u16,
    new_messages: u16,
    header: Option<Debug2Header>,
}

/// Header of every v2 reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debug2Header {
    /// Fatal error code, 0 if none occurred
    pub ec: u8,
    /// Index of the last message + 1
    pub last_idx: u32,
    /// Number of buffered messages
    pub count: u16,
}

/// Text for common FX3 API return codes
pub fn fx3_error_string(code: u16) -> String {
    let s = match code {
        0x00 => "Success",
        0x40 => "Bad argument",
        0x41 => "Null pointer",
        0x42 => "Not started",
        0x43 => "Already started",
        0x44 => "Not configured",
        0x45 => "Timeout",
        0x46 => "Not supported",
        0x47 => "Invalid sequence",
        0x48 => "Aborted",
        0x49 => "DMA failure",
        0x4a => "Failure",
        0x4b => "Bad index",
        _ => return format!("Unknown error {code}"),
    };
    s.to_string()
}

/// Ring buffer debug log, see [`Ztex::debug_log`]
#[derive(Debug)]
pub struct DebugLog<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

impl<'a, D: Device> DebugLog<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    fn geometry(&mut self) -> Result<(usize, usize), Error> {
        self.ztex.check_capability(Capability::Debug)?;
        if let Some(geometry) = self.ztex.debug_state.geometry {
            return Ok(geometry);
        }
        let mut buf = [0u8; 4];
        self.ztex
            .vendor_request_exact(VR_DEBUG, "Read debug data", 0, 0, &mut buf)?;
        let geometry = (buf[2] as usize, buf[3] as usize);
        if geometry.0 == 0 || geometry.1 == 0 {
            return Err(Error::invalid_firmware(format!(
                "Invalid debug stack: {} messages of {} bytes",
                geometry.0, geometry.1
            )));
        }
        debug!(
            "Debug stack: {} messages of {} bytes",
            geometry.0, geometry.1
        );
        self.ztex.debug_state.geometry = Some(geometry);
        Ok(geometry)
    }

    /// Capacity of the message stack in messages
    pub fn stack_size(&mut self) -> Result<usize, Error> {
        Ok(self.geometry()?.0)
    }

    /// Size of one message in bytes
    pub fn msg_size(&mut self) -> Result<usize, Error> {
        Ok(self.geometry()?.1)
    }

    /// Counter of the last message returned by [`DebugLog::read_messages`]
    pub fn last_msg(&self) -> u16 {
        self.ztex.debug_state.last_msg
    }

    /// Number of messages that were new at the last read, including those
    /// already overwritten in the stack
    pub fn new_messages(&self) -> u16 {
        self.ztex.debug_state.new_messages
    }

    /// Reads messages from the stack, oldest first.
    ///
    /// With `all` every message still in the stack is returned, otherwise
    /// only those newer than the last read.
    pub fn read_messages(&mut self, all: bool) -> Result<Vec<Vec<u8>>, Error> {
        trace!("DebugLog::read_messages all {all}");
        let (stack_size, msg_size) = self.geometry()?;
        let mut buf = vec![0u8; stack_size * msg_size + 4];
        self.ztex
            .vendor_request_exact(VR_DEBUG, "Read debug data", 0, 0, &mut buf)?;

        let lm = u16::from_le_bytes([buf[0], buf[1]]);
        let state = &mut self.ztex.debug_state;
        state.new_messages = lm.wrapping_sub(state.last_msg);
        state.last_msg = lm;

        let mut r = stack_size.min(lm as usize);
        if !all {
            r = r.min(state.new_messages as usize);
        }
        let messages = (0..r)
            .map(|i| {
                let k = (lm as usize - r + i) % stack_size;
                buf[4 + k * msg_size..4 + (k + 1) * msg_size].to_vec()
            })
            .collect();
        Ok(messages)
    }
}

/// Indexed debug log, see [`Ztex::debug2_log`]
#[derive(Debug)]
pub struct Debug2Log<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

impl<'a, D: Device> Debug2Log<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    /// Reads message `idx` in raw format, or only the header if `idx` is
    /// None.  Byte 0 of the result is the message type (0xFF for a header
    /// query), the message follows.
    ///
    /// # Errors
    /// * `InvalidFirmware` - the reply is shorter than the header
    pub fn get_message(&mut self, idx: Option<u32>) -> Result<Vec<u8>, Error> {
        self.ztex.check_capability(Capability::Debug2)?;
        let (value, index, length) = match idx {
            Some(idx) => ((idx >> 16) as u16, idx as u16, DEBUG2_MAX_LENGTH),
            None => (0xffff, 0xffff, DEBUG2_HEADER_SIZE),
        };
        let mut buf = vec![0u8; length];
        let len = self
            .ztex
            .vendor_request(VR_DEBUG, "Read Debug 2 Message", value, index, &mut buf)?;
        if len < DEBUG2_HEADER_SIZE {
            return Err(Error::invalid_firmware("Invalid result from VR 0x28"));
        }
        self.ztex.debug_state.header = Some(Debug2Header {
            ec: buf[0],
            last_idx: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
            count: u16::from_le_bytes([buf[5], buf[6]]),
        });
        if idx.is_none() {
            buf[9] = 0xff;
        }
        buf.truncate(len);
        Ok(buf.split_off(DEBUG2_HEADER_SIZE - 1))
    }

    /// Queries the header
    pub fn header(&mut self) -> Result<Debug2Header, Error> {
        self.get_message(None)?;
        self.ztex
            .debug_state
            .header
            .ok_or_else(|| Error::invalid_firmware("Invalid result from VR 0x28"))
    }

    /// Index of the last message + 1
    pub fn last_idx(&mut self) -> Result<u32, Error> {
        Ok(self.header()?.last_idx)
    }

    pub fn ec(&mut self) -> Result<u8, Error> {
        Ok(self.header()?.ec)
    }

    pub fn count(&mut self) -> Result<u16, Error> {
        Ok(self.header()?.count)
    }

    /// Index of the next message returned by
    /// [`Debug2Log::next_log_message`]
    pub fn log_idx(&self) -> u32 {
        self.ztex.debug2_log_idx
    }

    pub fn set_log_idx(&mut self, idx: u32) {
        self.ztex.debug2_log_idx = idx;
    }

    /// Returns the next text or runtime error message, or None if there is
    /// none.  Other message types are skipped.
    pub fn next_log_message(&mut self) -> Result<Option<String>, Error> {
        loop {
            let idx = self.ztex.debug2_log_idx;
            let msg = self.get_message(Some(idx))?;
            let last_idx = self.ztex.debug_state.header.map(|h| h.last_idx).unwrap_or(0);
            if idx >= last_idx {
                return Ok(None);
            }
            self.ztex.debug2_log_idx = idx + 1;
            match msg.first() {
                Some(&DEBUG2_TYPE_TEXT) => {
                    return Ok(Some(String::from_utf8_lossy(&msg[1..]).into_owned()))
                }
                Some(&DEBUG2_TYPE_RUNTIME_ERROR) => return Ok(Some(runtime_error(&msg[1..]))),
                _ => trace!("Skipping debug message {idx}"),
            }
        }
    }

    /// Logs all new messages through `info!`, returning their number.
    /// Returns 0 quietly if the firmware has no debug helper 2.
    pub fn print_next_log_messages(&mut self) -> Result<usize, Error> {
        let mut n = 0;
        loop {
            match self.next_log_message() {
                Ok(Some(msg)) => {
                    info!("{msg}");
                    n += 1;
                }
                Ok(None) => return Ok(n),
                Err(Error::Capability { .. }) => return Ok(n),
                Err(e) => return Err(e),
            }
        }
    }
}

fn runtime_error(payload: &[u8]) -> String {
    let word = |i: usize| {
        u16::from_le_bytes([
            payload.get(i).copied().unwrap_or(0),
            payload.get(i + 1).copied().unwrap_or(0),
        ])
    };
    let code = word(0);
    let line = word(2);
    let file = payload.get(4..).unwrap_or(&[]);
    let file = String::from_utf8_lossy(file);
    format!(
        "Runtime error {code} occured at line {line} of {}: {}",
        file.trim_end_matches(char::from(0)),
        fx3_error_string(code)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Transfer};
    use crate::ztex::ZtexConfig;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Stack of 4 messages of 2 bytes, message n holding [n, n]
    fn debug_ztex(counter: Rc<Cell<u16>>) -> Ztex<MockDevice> {
        let mut device = MockDevice::new(&[Capability::Debug]);
        device.on_request(VR_DEBUG, move |_, _, buf| {
            let lm = counter.get();
            buf[..4].copy_from_slice(&[lm as u8, (lm >> 8) as u8, 4, 2]);
            if buf.len() > 4 {
                // message n lives in slot (n - 1) % 4
                for slot in 0..4u16 {
                    buf[4 + slot as usize * 2] = 0;
                    buf[5 + slot as usize * 2] = 0;
                }
                for n in lm.saturating_sub(3)..=lm {
                    if n == 0 {
                        continue;
                    }
                    let slot = ((n - 1) % 4) as usize;
                    buf[4 + slot * 2] = n as u8;
                    buf[5 + slot * 2] = n as u8;
                }
            }
            Ok(buf.len())
        });
        Ztex::new(device, ZtexConfig::default()).unwrap()
    }

    #[test]
    fn test_v1_new_messages_only() {
        let counter = Rc::new(Cell::new(2));
        let mut z = debug_ztex(counter.clone());
        assert_eq!(z.debug_log().stack_size().unwrap(), 4);
        assert_eq!(z.debug_log().msg_size().unwrap(), 2);

        assert_eq!(
            z.debug_log().read_messages(false).unwrap(),
            vec![vec![1, 1], vec![2, 2]]
        );
        counter.set(3);
        assert_eq!(z.debug_log().read_messages(false).unwrap(), vec![vec![3, 3]]);
        assert_eq!(z.debug_log().last_msg(), 3);
        assert!(z.debug_log().read_messages(false).unwrap().is_empty());
    }

    #[test]
    fn test_v1_overrun_returns_stack() {
        let counter = Rc::new(Cell::new(9));
        let mut z = debug_ztex(counter);
        let messages = z.debug_log().read_messages(true).unwrap();
        assert_eq!(
            messages,
            vec![vec![6, 6], vec![7, 7], vec![8, 8], vec![9, 9]]
        );
        assert_eq!(z.debug_log().new_messages(), 9);
    }

    /// Log with messages: text "boot", a heartbeat, a runtime error
    fn debug2_ztex() -> Ztex<MockDevice> {
        let mut device = MockDevice::new(&[Capability::Debug2]);
        device.on_request(VR_DEBUG, |value, index, buf| {
            let mut reply = vec![0u8, 3, 0, 0, 0, 3, 0, 0, 0];
            match (value, index) {
                (0xffff, 0xffff) => reply.push(0),
                (0, 0) => reply.extend_from_slice(b"\x01boot"),
                (0, 1) => reply.push(7),
                (0, 2) => {
                    reply.push(2);
                    reply.extend_from_slice(&[0x45, 0, 120, 0]);
                    reply.extend_from_slice(b"main.c\x00\x00");
                }
                _ => reply.push(0),
            }
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        });
        Ztex::new(device, ZtexConfig::default()).unwrap()
    }

    #[test]
    fn test_v2_header() {
        let mut z = debug2_ztex();
        assert_eq!(
            z.debug2_log().header().unwrap(),
            Debug2Header {
                ec: 0,
                last_idx: 3,
                count: 3
            }
        );
        assert_eq!(z.debug2_log().get_message(None).unwrap(), vec![0xff]);
        match z.device().transfers.last() {
            Some(Transfer::In { length, .. }) => assert_eq!(*length, 10),
            _ => panic!("no request"),
        }
    }

    #[test]
    fn test_v2_next_messages() {
        let mut z = debug2_ztex();
        let mut log = z.debug2_log();
        assert_eq!(log.next_log_message().unwrap(), Some("boot".to_string()));
        assert_eq!(
            log.next_log_message().unwrap(),
            Some("Runtime error 69 occured at line 120 of main.c: Timeout".to_string())
        );
        assert_eq!(log.next_log_message().unwrap(), None);
        assert_eq!(log.log_idx(), 3);
        // the cursor stays at the end
        assert_eq!(log.next_log_message().unwrap(), None);
        assert_eq!(log.log_idx(), 3);
    }

    #[test]
    fn test_v2_print_drains() {
        let mut z = debug2_ztex();
        assert_eq!(z.debug2_log().print_next_log_messages().unwrap(), 2);
        assert_eq!(z.debug2_log().print_next_log_messages().unwrap(), 0);

        let mut z = Ztex::new(MockDevice::new(&[]), ZtexConfig::default()).unwrap();
        assert_eq!(z.debug2_log().print_next_log_messages().unwrap(), 0);
    }

    #[test]
    fn test_v2_short_reply() {
        let mut device = MockDevice::new(&[Capability::Debug2]);
        device.on_request_reply(VR_DEBUG, vec![0; 6]);
        let mut z = Ztex::new(device, ZtexConfig::default()).unwrap();
        assert_eq!(
            z.debug2_log().get_message(Some(0)),
            Err(Error::invalid_firmware("Invalid result from VR 0x28"))
        );
    }

    #[test]
    fn test_fx3_error_strings() {
        assert_eq!(fx3_error_string(0x46), "Not supported");
        assert_eq!(fx3_error_string(999), "Unknown error 999");
    }
}
