//! Temperature sensor and USB 3 error counters
use super::Ztex;
use crate::capability::Capability;
use crate::constants::*;
use crate::{Device, Error};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::Instant;

/// Reply bytes holding the sensors 0..=3
const SENSOR_BYTES: [usize; 4] = [3, 4, 1, 2];

/// Last valid temperature sensor reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TempReading {
    raw: [u8; 5],
    at: Instant,
}

/// USB 3 error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usb3Errors {
    pub send: u16,
    pub receive: u16,
}

impl<D: Device> Ztex<D> {
    /// Reads sensor `idx` in °C.
    ///
    /// The device is queried at most once per `temp_sensor_interval` (at
    /// least 40ms); in between the last reply is reused.
    ///
    /// # Errors
    /// * `OutOfRange` - `idx` > 3
    /// * `InvalidFirmware` - the reply does not follow the sensor protocol
    pub fn temp_sensor_read(&mut self, idx: usize) -> Result<f64, Error> {
        self.check_capability(Capability::TempSensor)?;
        let pos = *SENSOR_BYTES.get(idx).ok_or_else(|| {
            Error::out_of_range("tempSensorRead: Invalid temperature sensor index")
        })?;

        let interval = self.config().temp_sensor_interval.max(TEMP_SENSOR_MIN_INTERVAL);
        let raw = match self.temp_sensor {
            Some(reading) if reading.at.elapsed() < interval => reading.raw,
            _ => {
                let mut buf = [0u8; 9];
                let len = self.vendor_request(
                    VR_TEMP_SENSOR,
                    "Temperature Sensor Read",
                    0,
                    0,
                    &mut buf,
                )?;
                if len != 5 || buf[0] != 1 {
                    return Err(Error::invalid_firmware(
                        "tempSensorRead: Invalid temperature sensor protocol",
                    ));
                }
                let mut raw = [0u8; 5];
                raw.copy_from_slice(&buf[..5]);
                self.temp_sensor = Some(TempReading {
                    raw,
                    at: Instant::now(),
                });
                raw
            }
        };
        Ok((raw[pos] as f64 - 77.2727) / 1.5454)
    }

    /// Reads the USB 3 send and receive error counters (VR 0x29)
    pub fn usb3_errors(&mut self) -> Result<Usb3Errors, Error> {
        self.check_capability(Capability::Debug2)?;
        let mut buf = [0u8; 4];
        self.vendor_request_exact(VR_USB3_ERRORS, "Read USB3 errors", 0, 0, &mut buf)?;
        Ok(Usb3Errors {
            send: u16::from_le_bytes([buf[0], buf[1]]),
            receive: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}
