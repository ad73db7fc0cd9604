//! Vendor request/command envelope over the control endpoint.  Every higher
//! level operation is expressed as one or more of these calls.  There is no
//! retry here; callers own their retry policy.
use super::Ztex;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::Duration;

impl<D: Device> Ztex<D> {
    /// Sends vendor request `code` and reads the response into `buf`.
    /// Short responses are accepted; the number of bytes read is returned.
    ///
    /// # Args:
    /// * code - request code
    /// * what - description used in error messages
    /// * value, index - the 16 bit setup fields
    /// * buf - receives the response
    ///
    /// # Errors
    /// * `Usb` - on transport failure, prefixed with `what`
    pub fn vendor_request(
        &mut self,
        code: u8,
        what: &str,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let timeout = self.config().control_timeout;
        self.vendor_request_timeout(code, what, value, index, buf, timeout)
    }

    /// As [`Ztex::vendor_request`] but the response must fill `buf`
    /// completely
    pub fn vendor_request_exact(
        &mut self,
        code: u8,
        what: &str,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let timeout = self.config().control_timeout;
        let len = self.vendor_request_timeout(code, what, value, index, buf, timeout)?;
        if len != buf.len() {
            let message = format!("{what}: Received {len} bytes instead of {}", buf.len());
            debug!("{message}");
            return Err(Error::usb(message));
        }
        Ok(())
    }

    pub(crate) fn vendor_request_timeout(
        &mut self,
        code: u8,
        what: &str,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        trace!(
            "Ztex::vendor_request 0x{code:02x} ({what}) value 0x{value:04x} index 0x{index:04x} len {}",
            buf.len()
        );
        self.device_mut()
            .read_control(code, value, index, buf, timeout)
            .map_err(|e| e.context(what))
    }

    /// Sends vendor command `code` with `data` as the data phase.  The whole
    /// buffer must be accepted by the device.
    ///
    /// # Errors
    /// * `Usb` - on transport failure or a short write, prefixed with `what`
    pub fn vendor_command(
        &mut self,
        code: u8,
        what: &str,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        let timeout = self.config().control_timeout;
        self.vendor_command_timeout(code, what, value, index, data, timeout)
    }

    /// As [`Ztex::vendor_command`] with an explicit timeout for this one
    /// transfer.  The session timeout is left untouched.
    pub(crate) fn vendor_command_timeout(
        &mut self,
        code: u8,
        what: &str,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        trace!(
            "Ztex::vendor_command 0x{code:02x} ({what}) value 0x{value:04x} index 0x{index:04x} len {}",
            data.len()
        );
        let len = self
            .device_mut()
            .write_control(code, value, index, data, timeout)
            .map_err(|e| e.context(what))?;
        if len != data.len() {
            let message = format!("{what}: Sent {len} bytes instead of {}", data.len());
            debug!("{message}");
            return Err(Error::usb(message));
        }
        Ok(())
    }

    /// Blocks for `dur` via the transport
    pub(crate) fn delay(&mut self, dur: Duration) {
        self.device_mut().delay(dur);
    }
}
