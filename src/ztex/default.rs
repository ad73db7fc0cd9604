//! The default firmware interface: GPIOs, reset signal and the low speed
//! register interface (LSI) of the ZTEX default firmwares.
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Reply of VR 0x64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DefaultInfo {
    version: u8,
    out_ep: u8,
    in_ep: u8,
    sub_version: u8,
}

/// Default interface access, see [`Ztex::default_interface`]
#[derive(Debug)]
pub struct DefaultInterface<'a, D: Device> {
    ztex: &'a mut Ztex<D>,
}

fn check_length(n: usize) -> Result<(), Error> {
    if n > LSI_MAX_REGISTERS {
        return Err(Error::out_of_range(format!(
            "LSI register set length to large: {n}. Valid values are 1..256"
        )));
    }
    Ok(())
}

fn register(addr: u8, val: u32) -> [u8; 5] {
    let [a, b, c, d] = val.to_le_bytes();
    [a, b, c, d, addr]
}

impl<'a, D: Device> DefaultInterface<'a, D> {
    pub(crate) fn new(ztex: &'a mut Ztex<D>) -> Self {
        Self { ztex }
    }

    fn info(&mut self) -> Result<DefaultInfo, Error> {
        if let Some(info) = self.ztex.default_info {
            return Ok(info);
        }
        let info = match self.ztex.check_capability(Capability::Default) {
            Ok(()) => {
                let mut buf = [0u8; 4];
                self.ztex
                    .vendor_request_exact(VR_DEFAULT_INFO, "getDefaultInfo", 0, 0, &mut buf)?;
                DefaultInfo {
                    version: buf[0],
                    out_ep: buf[1],
                    in_ep: buf[2],
                    sub_version: buf[3],
                }
            }
            Err(Error::Capability { .. }) => DefaultInfo::default(),
            Err(e) => return Err(e),
        };
        debug!("Default interface version {}.{}", info.version, info.sub_version);
        self.ztex.default_info = Some(info);
        Ok(info)
    }

    /// Version of the default interface, 0 if there is none
    pub fn version(&mut self) -> Result<u8, Error> {
        Ok(self.info()?.version)
    }

    /// Fails unless the default interface has at least version `version`.
    /// Warns once per session if the firmware is outdated.
    ///
    /// # Errors
    /// * `Capability` - no default interface, or an older version
    pub fn check_version(&mut self, version: u8) -> Result<(), Error> {
        let info = self.info()?;
        if info.version < 1 {
            return Err(Error::capability(
                "Default interface not supported: Update Default Firmware",
            ));
        }
        if info.version < version {
            return Err(Error::capability(format!(
                "Invalid default interface version. Found: {}. Required: {version}. Update default firmware.",
                info.version
            )));
        }
        let outdated = info.version < DEFAULT_LATEST_VERSION
            || (info.version == DEFAULT_LATEST_VERSION
                && info.sub_version < DEFAULT_LATEST_SUB_VERSION);
        if outdated && !self.ztex.config().disable_warnings && !self.ztex.default_warned {
            warn!("Default interface is outdated. Update recommended.");
            self.ztex.default_warned = true;
        }
        Ok(())
    }

    /// Out endpoint for high speed communication
    pub fn out_ep(&mut self) -> Result<u8, Error> {
        self.check_version(1)?;
        Ok(self.info()?.out_ep)
    }

    /// In endpoint for high speed communication, with the direction bit set
    pub fn in_ep(&mut self) -> Result<u8, Error> {
        self.check_version(1)?;
        Ok(self.info()?.in_ep | ENDPOINT_IN)
    }

    pub fn sub_version(&mut self) -> Result<u8, Error> {
        self.check_version(1)?;
        Ok(self.info()?.sub_version)
    }

    /// Asserts the reset signal.  With `leave` the signal stays active,
    /// otherwise a short pulse is sent.
    pub fn reset(&mut self, leave: bool) -> Result<(), Error> {
        trace!("DefaultInterface::reset leave {leave}");
        self.check_version(1)?;
        self.ztex.vendor_command(
            VC_DEFAULT_RESET,
            "Send reset signal",
            leave as u16,
            0,
            &[],
        )
    }

    /// Sets the GPIOs selected by `mask` to `value` and returns the current
    /// state.  Only the lowest 4 bits are significant.
    pub fn gpio_ctl(&mut self, mask: u8, value: u8) -> Result<u8, Error> {
        trace!("DefaultInterface::gpio_ctl mask 0x{mask:x} value 0x{value:x}");
        self.check_version(1)?;
        let mut buf = [0u8; 1];
        self.ztex.vendor_request_exact(
            VR_DEFAULT_GPIO,
            "Set/get GPIO's",
            value as u16,
            mask as u16,
            &mut buf,
        )?;
        Ok(buf[0])
    }

    /// Writes consecutive LSI registers starting at `addr`.  The address
    /// wraps from 255 to 0.
    ///
    /// # Errors
    /// * `OutOfRange` - more than 256 values
    pub fn lsi_set(&mut self, addr: u8, vals: &[u32]) -> Result<(), Error> {
        trace!("DefaultInterface::lsi_set addr {addr} len {}", vals.len());
        self.check_version(1)?;
        check_length(vals.len())?;
        let buf: Vec<u8> = vals
            .iter()
            .enumerate()
            .flat_map(|(i, v)| register(addr.wrapping_add(i as u8), *v))
            .collect();
        self.ztex
            .vendor_command(VC_DEFAULT_LSI_SET, "Write lsi registers", 0, 0, &buf)
    }

    /// Writes `(address, value)` pairs in one transfer
    pub fn lsi_set_scattered(&mut self, regs: &[(u8, u32)]) -> Result<(), Error> {
        trace!("DefaultInterface::lsi_set_scattered len {}", regs.len());
        self.check_version(1)?;
        check_length(regs.len())?;
        let buf: Vec<u8> = regs
            .iter()
            .flat_map(|(addr, v)| register(*addr, *v))
            .collect();
        self.ztex
            .vendor_command(VC_DEFAULT_LSI_SET, "Write lsi registers", 0, 0, &buf)
    }

    /// Reads `n` consecutive LSI registers starting at `addr`.  The address
    /// wraps from 255 to 0.
    pub fn lsi_get(&mut self, addr: u8, n: usize) -> Result<Vec<u32>, Error> {
        trace!("DefaultInterface::lsi_get addr {addr} len {n}");
        self.check_version(1)?;
        check_length(n)?;
        let mut buf = vec![0u8; n * 4];
        self.ztex.vendor_request_exact(
            VR_DEFAULT_LSI_GET,
            "Read lsi registers",
            0,
            addr as u16,
            &mut buf,
        )?;
        Ok(buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Transfer};
    use crate::ztex::ZtexConfig;

    fn default_ztex(info: Vec<u8>, config: ZtexConfig) -> Ztex<MockDevice> {
        let mut device = MockDevice::new(&[Capability::Default]);
        device.on_request_reply(VR_DEFAULT_INFO, info);
        device.accept_command(VC_DEFAULT_LSI_SET);
        device.accept_command(VC_DEFAULT_RESET);
        Ztex::new(device, config).unwrap()
    }

    #[test]
    fn test_version_without_capability() {
        let mut z = Ztex::new(MockDevice::new(&[]), ZtexConfig::default()).unwrap();
        assert_eq!(z.default_interface().version(), Ok(0));
        assert_eq!(
            z.default_interface().reset(false),
            Err(Error::capability(
                "Default interface not supported: Update Default Firmware"
            ))
        );
        assert!(z.device().transfers.is_empty());
    }

    #[test]
    fn test_endpoints_and_version_check() {
        let mut z = default_ztex(vec![1, 4, 2, 4], ZtexConfig::default());
        assert_eq!(z.default_interface().out_ep(), Ok(4));
        assert_eq!(z.default_interface().in_ep(), Ok(0x82));
        assert_eq!(z.default_interface().sub_version(), Ok(4));
        assert_eq!(
            z.default_interface().check_version(2),
            Err(Error::capability(
                "Invalid default interface version. Found: 1. Required: 2. Update default firmware."
            ))
        );
        assert_eq!(z.device().count(VR_DEFAULT_INFO), 1);
        assert!(!z.default_warned);
    }

    #[test]
    fn test_outdated_warning_once() {
        let mut z = default_ztex(vec![1, 4, 2, 2], ZtexConfig::default());
        z.default_interface().check_version(1).unwrap();
        assert!(z.default_warned);

        let config = ZtexConfig {
            disable_warnings: true,
            ..Default::default()
        };
        let mut z = default_ztex(vec![1, 4, 2, 2], config);
        z.default_interface().check_version(1).unwrap();
        assert!(!z.default_warned);
    }

    #[test]
    fn test_lsi_set_layout() {
        let mut z = default_ztex(vec![1, 4, 2, 4], ZtexConfig::default());
        z.default_interface()
            .lsi_set(10, &[0x1122_3344, 5])
            .unwrap();
        z.default_interface()
            .lsi_set_scattered(&[(200, 1), (3, 0xff00_0000)])
            .unwrap();
        let data: Vec<Vec<u8>> = z
            .device()
            .commands(VC_DEFAULT_LSI_SET)
            .iter()
            .map(|t| match t {
                Transfer::Out { data, .. } => data.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            data,
            vec![
                vec![0x44, 0x33, 0x22, 0x11, 10, 5, 0, 0, 0, 11],
                vec![1, 0, 0, 0, 200, 0, 0, 0, 0xff, 3],
            ]
        );
    }

    #[test]
    fn test_lsi_get_and_range() {
        let mut z = default_ztex(vec![1, 4, 2, 4], ZtexConfig::default());
        z.device_mut()
            .on_request_reply(VR_DEFAULT_LSI_GET, vec![1, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(z.default_interface().lsi_get(254, 2), Ok(vec![1, 256]));
        assert_eq!(z.default_interface().lsi_get(255, 2), Ok(vec![1, 256]));
        match z.device().transfers.last() {
            Some(Transfer::In { index, length, .. }) => assert_eq!((*index, *length), (255, 8)),
            _ => panic!("no LSI read"),
        }
        assert!(matches!(
            z.default_interface().lsi_get(0, 257),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            z.default_interface().lsi_set(0, &[0; 257]),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_lsi_set_wraps_address() {
        let mut z = default_ztex(vec![1, 4, 2, 4], ZtexConfig::default());
        z.default_interface().lsi_set(255, &[1, 2]).unwrap();
        match z.device().transfers.last() {
            Some(Transfer::Out { request, data, .. }) => {
                assert_eq!(*request, VC_DEFAULT_LSI_SET);
                assert_eq!(data, &vec![1, 0, 0, 0, 255, 2, 0, 0, 0, 0]);
            }
            _ => panic!("no LSI write"),
        }

        z.default_interface().lsi_set(0, &[7; 256]).unwrap();
        let last = z.device().commands(VC_DEFAULT_LSI_SET).len();
        assert_eq!(last, 2);
    }

    #[test]
    fn test_gpio_and_reset() {
        let mut z = default_ztex(vec![1, 4, 2, 4], ZtexConfig::default());
        z.device_mut().on_request(VR_DEFAULT_GPIO, |value, index, buf| {
            buf[0] = (value & index) as u8;
            Ok(1)
        });
        assert_eq!(z.default_interface().gpio_ctl(0x3, 0xf), Ok(0x3));
        z.default_interface().reset(true).unwrap();
        match z.device().transfers.last() {
            Some(Transfer::Out { request, value, .. }) => {
                assert_eq!((*request, *value), (VC_DEFAULT_RESET, 1))
            }
            _ => panic!("no reset"),
        }
    }
}
