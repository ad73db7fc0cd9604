//! Error objects for the ztex crate
use libc::{EACCES, EBUSY, EEXIST, EINVAL, EIO, ENODEV, ENOENT, ENOTSUP, ERANGE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the ztex crate
#[derive(Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Errors while transferring data over USB.  Carries any device-side
    /// error text available at the point of failure.
    #[error("USB error while attempting to communicate with the ZTEX device: {0}")]
    Usb(SerializableUsbError),

    /// The firmware does not support the named feature, or the operation is
    /// refused to protect board data
    #[error("{feature} not supported")]
    Capability { feature: String },

    /// The firmware speaks an unexpected interface or returned a malformed
    /// response
    #[error("Invalid firmware: {message}")]
    InvalidFirmware { message: String },

    /// The FPGA already holds a bitstream and force was not requested
    #[error("FPGA already configured")]
    AlreadyConfigured,

    /// Reading or validating a local bitstream failed
    #[error("Error reading bitstream: {message}")]
    BitstreamRead { message: String },

    /// The device failed to accept a bitstream
    #[error("Error uploading bitstream: {message}")]
    BitstreamUpload { message: String },

    /// A firmware image does not match the installed firmware
    #[error("Incompatible firmware: {message}")]
    IncompatibleFirmware { message: String },

    /// Writing or verifying a firmware image failed
    #[error("Error uploading firmware: {message}")]
    FirmwareUpload { message: String },

    /// Index, address or length outside the bounds the protocol allows
    #[error("Out of range: {message}")]
    OutOfRange { message: String },

    /// The device kept reporting busy
    #[error("{what} still busy after {tries} attempts")]
    Busy { what: String, tries: u32 },

    /// DeviceAccess holds a variety errors relating to opening the device
    #[error("{kind}")]
    DeviceAccess { kind: DeviceAccess },

    /// Invalid arguments passed to the ztex library
    #[error("ztex library called with invalid arguments: {message}")]
    Args { message: String },
}

/// Used to differentiate between different types of problems accessing the
/// ZTEX device
#[derive(Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum DeviceAccess {
    #[error("ZTEX device {vid:04x}/{pid:04x} not found - is it connected and do you have permissions to access it?")]
    NotFound { vid: u16, pid: u16 },

    #[error("No ZTEX device found on bus {bus:03} address {address:03}")]
    NotAtAddress { bus: u8, address: u8 },

    #[error("Device {vid:04x}/{pid:04x} does not provide a valid ZTEX descriptor: {message}")]
    NoDescriptor { vid: u16, pid: u16, message: String },

    #[error("Hit USB permissions error while attempting to access ZTEX device.  Are you sure you have suitable permissions?  You may need to reconfigure udev rules in /etc/udev/rules.d/.")]
    Permission,
}

#[derive(Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum SerializableUsbError {
    #[error("{message}")]
    UsbError { message: String },
}

impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Usb { .. } => EIO,
            Error::Capability { .. } => ENOTSUP,
            Error::InvalidFirmware { .. } => ENODEV,
            Error::AlreadyConfigured => EEXIST,
            Error::BitstreamRead { .. } => EIO,
            Error::BitstreamUpload { .. } => EIO,
            Error::IncompatibleFirmware { .. } => EINVAL,
            Error::FirmwareUpload { .. } => EIO,
            Error::OutOfRange { .. } => ERANGE,
            Error::Busy { .. } => EBUSY,
            Error::DeviceAccess { kind } => match kind {
                DeviceAccess::NotFound { .. } => ENOENT,
                DeviceAccess::NotAtAddress { .. } => ENOENT,
                DeviceAccess::NoDescriptor { .. } => ENODEV,
                DeviceAccess::Permission => EACCES,
            },
            Error::Args { .. } => EINVAL,
        }
    }

    /// Returns true for USB transport failures
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Usb(_))
    }

    /// Prefixes a transport error's message with the given context, e.g.
    /// "Flash Write: Busy".  Other errors pass through unchanged.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            Error::Usb(SerializableUsbError::UsbError { message }) => {
                Error::usb(format!("{prefix}: {message}"))
            }
            other => other,
        }
    }

    pub(crate) fn usb(message: impl Into<String>) -> Self {
        Error::Usb(SerializableUsbError::UsbError {
            message: message.into(),
        })
    }

    pub(crate) fn capability(feature: impl Into<String>) -> Self {
        Error::Capability {
            feature: feature.into(),
        }
    }

    pub(crate) fn invalid_firmware(message: impl Into<String>) -> Self {
        Error::InvalidFirmware {
            message: message.into(),
        }
    }

    pub(crate) fn out_of_range(message: impl Into<String>) -> Self {
        Error::OutOfRange {
            message: message.into(),
        }
    }

    pub(crate) fn bitstream_read(message: impl Into<String>) -> Self {
        Error::BitstreamRead {
            message: message.into(),
        }
    }

    pub(crate) fn bitstream_upload(message: impl Into<String>) -> Self {
        Error::BitstreamUpload {
            message: message.into(),
        }
    }

    pub(crate) fn firmware_upload(message: impl Into<String>) -> Self {
        Error::FirmwareUpload {
            message: message.into(),
        }
    }
}

// Map rusb::Error to Error
impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Access => Self::DeviceAccess {
                kind: DeviceAccess::Permission,
            },
            err => Self::usb(err.to_string()),
        }
    }
}

// Stream read failures while loading a bitstream
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::bitstream_read(err.to_string())
    }
}
