//! # ztex
//!
//! This crate provides a Rust host-side driver for ZTEX USB-FPGA boards.  It
//! speaks the vendor-defined control/bulk protocol of the ZTEX firmware to
//! configure FPGAs, upload firmware and manage the boards' non-volatile
//! memories.
//!
//! ## Overview
//!
//! The ztex crate is structured around two main components:
//!
//! - A high-level [`Ztex`] facade, which checks firmware capabilities and
//!   hands out short-lived feature modules (Flash, FPGA, EEPROM, ...)
//! - A lower-level [`Device`] trait for the USB transport, implemented by
//!   [`UsbDevice`] over `rusb`
//!
//! ### Key Features
//!
//! - Capability-negotiated command set, failing fast before any USB traffic
//!   for features the firmware does not announce
//! - FPGA configuration via the low speed (control transfer) and the high
//!   speed (bulk) path, with bit order detection, retries and fallback
//! - Firmware uploads to RAM, EEPROM (FX2) and Flash (FX3), with
//!   verification
//! - Flash and 2nd Flash sector I/O, including bitstreams stored in Flash
//!   for configuration at power-up
//! - MAC EEPROM and the configuration record stored in it
//! - ATxmega NVM programming, debug logs, the default firmware interface and
//!   the temperature sensor
//!
//! ## Getting Started
//!
//! The recommended way to open a board is [`ZtexBuilder`]:
//!
//! ```rust,no_run
//! use ztex::{BitSwap, ZtexBuilder};
//! use std::fs::File;
//!
//! let mut ztex = ZtexBuilder::new().build().unwrap();
//! println!("{ztex}");
//!
//! let mut bitstream = File::open("fpga.bit").unwrap();
//! let duration = ztex
//!     .fpga()
//!     .upload_auto(&mut bitstream, false, BitSwap::Auto)
//!     .unwrap();
//! println!("FPGA configured in {} ms", duration.as_millis());
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Error`], whose variants separate transport
//! failures, missing capabilities, invalid or incompatible firmware, local
//! bitstream problems and failed uploads.  Transport errors carry any
//! device-side error text available, e.g. "Flash Read: Busy".
//!
//! ## Thread Safety
//!
//! The library is not inherently thread-safe.  All operations on one
//! [`Ztex`] are blocking and must not be interleaved; wrap it in a mutex to
//! share it between threads.
//!
//! ## Logging
//!
//! The library uses the `log` crate for diagnostic output:
//!
//! - Warn: Retries, fallbacks and outdated firmware
//! - Info: Completed uploads
//! - Debug: Detailed operation information
//! - Trace: Function entry and protocol-level details
//!
//! To enable logging, use [`env_logger::init`](https://docs.rs/env_logger/latest/env_logger/index.html) and set the `RUST_LOG` environment variable.
//!
//! ## License
//!
//! This library is licensed under the GNU General Public License Version 3 (GPLv3).

pub mod capability;
pub mod constants;
pub mod device;
pub mod error;
pub mod image;
pub mod ztex;

pub use crate::capability::{Capability, CapabilityTable};
pub use crate::device::usb::{UsbDevice, UsbDeviceConfig};
pub use crate::device::*;
pub use crate::error::{DeviceAccess, Error};
pub use crate::image::FirmwareImage;
pub use crate::ztex::{to_human_str, BitSwap, Ztex, ZtexBuilder, ZtexConfig};

/// A ZTEX board attached via USB
pub type UsbZtex = Ztex<UsbDevice>;
