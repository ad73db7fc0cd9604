//! The interface capability table reported by ZTEX firmware.
//!
//! The firmware reports a bit matrix of (byte, bit) positions, each bit
//! announcing one protocol feature.  The table is read once from the ZTEX
//! descriptor when a device is opened and is immutable afterwards.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of capability bytes the table can hold
pub const CAPABILITY_TABLE_BYTES: usize = 8;

/// Protocol features a ZTEX firmware may announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Eeprom,
    Fpga,
    Flash,
    Debug,
    Xmega,
    HsFpga,
    MacEeprom,
    MultiFpga,
    TempSensor,
    Flash2,
    Fx3,
    Debug2,
    Default,
}

impl Capability {
    /// All named capabilities, in table order
    pub const ALL: [Capability; 13] = [
        Capability::Eeprom,
        Capability::Fpga,
        Capability::Flash,
        Capability::Debug,
        Capability::Xmega,
        Capability::HsFpga,
        Capability::MacEeprom,
        Capability::MultiFpga,
        Capability::TempSensor,
        Capability::Flash2,
        Capability::Fx3,
        Capability::Debug2,
        Capability::Default,
    ];

    /// Returns the (byte, bit) position of this capability in the table
    pub fn position(self) -> (usize, usize) {
        let i = self as usize;
        (i / 8, i % 8)
    }

    /// Human readable feature string, used in capability errors
    pub fn description(self) -> &'static str {
        match self {
            Capability::Eeprom => "EEPROM read/write",
            Capability::Fpga => "FPGA configuration",
            Capability::Flash => "Flash memory support",
            Capability::Debug => "Debug helper",
            Capability::Xmega => "XMEGA support",
            Capability::HsFpga => "High speed FPGA configuration",
            Capability::MacEeprom => "MAC EEPROM read/write",
            Capability::MultiFpga => "Multi FPGA support",
            Capability::TempSensor => "Temperature Sensor support",
            Capability::Flash2 => "2nd Flash memory support",
            Capability::Fx3 => "FX3 firmware",
            Capability::Debug2 => "Debug helper 2",
            Capability::Default => "Default firmware interface",
        }
    }

    fn from_position(byte: usize, bit: usize) -> Option<Capability> {
        Capability::ALL.get(byte * 8 + bit).copied()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Bit matrix of supported capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    bytes: [u8; CAPABILITY_TABLE_BYTES],
}

impl CapabilityTable {
    /// Builds a table from the capability bytes of a ZTEX descriptor.  Bytes
    /// beyond the table size are ignored, missing bytes read as zero.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = [0u8; CAPABILITY_TABLE_BYTES];
        for (dst, src) in bytes.iter_mut().zip(raw) {
            *dst = *src;
        }
        Self { bytes }
    }

    /// Builds a table with exactly the given capabilities set
    pub fn with(capabilities: &[Capability]) -> Self {
        let mut table = Self::default();
        for cap in capabilities {
            let (byte, bit) = cap.position();
            table.bytes[byte] |= 1 << bit;
        }
        table
    }

    /// Returns true if bit `bit` of byte `byte` is set.  Positions outside
    /// the table are never set.
    pub fn is_set(&self, byte: usize, bit: usize) -> bool {
        byte < CAPABILITY_TABLE_BYTES && bit < 8 && (self.bytes[byte] >> bit) & 1 != 0
    }

    pub fn supports(&self, capability: Capability) -> bool {
        let (byte, bit) = capability.position();
        self.is_set(byte, bit)
    }

    /// Raw table bytes
    pub fn as_bytes(&self) -> &[u8; CAPABILITY_TABLE_BYTES] {
        &self.bytes
    }

    /// Lists the set capabilities, one per line, each preceded by `prefix`.
    /// Set bits without a name are listed as "byte.bit".
    pub fn info(&self, prefix: &str) -> String {
        let mut lines = vec![];
        for byte in 0..CAPABILITY_TABLE_BYTES {
            for bit in 0..8 {
                if !self.is_set(byte, bit) {
                    continue;
                }
                match Capability::from_position(byte, bit) {
                    Some(cap) => lines.push(format!("{prefix}{cap}")),
                    None => lines.push(format!("{prefix}{byte}.{bit}")),
                }
            }
        }
        lines.join("\n")
    }
}
