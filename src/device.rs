//! Device code definitions for SLMP.
//!
//! Every PLC memory area is addressed on the wire by a one-byte device code
//! followed by a 3-byte little-endian device number. Devices are either
//! bit-natured (X, Y, M, ...) or word-natured (D, W, R, ...), and some of them
//! use hexadecimal numbering in their conventional notation (X1F, W1A0).
//!
//! | Device | Code | Nature | Notation |
//! |--------|------|--------|----------|
//! | X / Y  | 0x9C / 0x9D | bit | hex |
//! | M      | 0x90 | bit  | decimal |
//! | B      | 0xA0 | bit  | hex |
//! | D      | 0xA8 | word | decimal |
//! | W      | 0xB4 | word | hex |
//! | R      | 0xAF | word | decimal |
//! | ZR     | 0xB0 | word | hex |
//!
//! The highest addressable device number depends on the PLC model and its
//! parameter settings, so [`DeviceRanges`] carries the defaults plus any
//! overrides supplied through configuration.
//!
//! ```
//! use voltage_slmp::device::{DeviceAddress, DeviceCode, DeviceRanges};
//!
//! let addr: DeviceAddress = "D100".parse().unwrap();
//! assert_eq!(addr.device, DeviceCode::D);
//! assert_eq!(addr.address, 100);
//!
//! let ranges = DeviceRanges::default().with_max_address(DeviceCode::D, 12287);
//! assert_eq!(ranges.max_address(DeviceCode::D), 12287);
//! assert!(ranges.check_range(DeviceCode::D, 12287, 2).is_some());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SlmpError, SlmpResult, Violation};

/// Largest device number the 3-byte address field can carry
pub const MAX_WIRE_ADDRESS: u32 = 0x00FF_FFFF;

/// SLMP device codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceCode {
    // Basic devices
    SM = 0x91,
    SD = 0xA9,
    X = 0x9C,
    Y = 0x9D,
    M = 0x90,
    L = 0x92,
    F = 0x93,
    V = 0x94,
    B = 0xA0,
    D = 0xA8,
    W = 0xB4,
    // Timers
    TS = 0xC1,
    TC = 0xC0,
    TN = 0xC2,
    LTS = 0x51,
    LTC = 0x50,
    LTN = 0x52,
    // Retentive timers
    SS = 0xC7,
    SC = 0xC6,
    SN = 0xC8,
    LSTS = 0x59,
    LSTC = 0x58,
    LSTN = 0x5A,
    // Counters
    CS = 0xC4,
    CC = 0xC3,
    CN = 0xC5,
    LCS = 0x55,
    LCC = 0x54,
    LCN = 0x56,
    // Link, direct and index devices
    SB = 0xA1,
    SW = 0xB5,
    DX = 0xA2,
    DY = 0xA3,
    Z = 0xCC,
    LZ = 0x62,
    // File registers
    R = 0xAF,
    ZR = 0xB0,
    RD = 0x2C,
}

impl DeviceCode {
    /// Every supported device code
    pub const ALL: [DeviceCode; 38] = [
        DeviceCode::SM, DeviceCode::SD, DeviceCode::X, DeviceCode::Y, DeviceCode::M,
        DeviceCode::L, DeviceCode::F, DeviceCode::V, DeviceCode::B, DeviceCode::D,
        DeviceCode::W, DeviceCode::TS, DeviceCode::TC, DeviceCode::TN, DeviceCode::LTS,
        DeviceCode::LTC, DeviceCode::LTN, DeviceCode::SS, DeviceCode::SC, DeviceCode::SN,
        DeviceCode::LSTS, DeviceCode::LSTC, DeviceCode::LSTN, DeviceCode::CS, DeviceCode::CC,
        DeviceCode::CN, DeviceCode::LCS, DeviceCode::LCC, DeviceCode::LCN, DeviceCode::SB,
        DeviceCode::SW, DeviceCode::DX, DeviceCode::DY, DeviceCode::Z, DeviceCode::LZ,
        DeviceCode::R, DeviceCode::ZR, DeviceCode::RD,
    ];

    /// Device code byte sent on the wire
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a device code by its wire byte
    pub fn from_u8(code: u8) -> SlmpResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.code() == code)
            .ok_or_else(|| SlmpError::invalid(format!("Unknown device code 0x{:02X}", code)))
    }

    /// Conventional device name ("D", "ZR", ...)
    pub fn name(self) -> &'static str {
        match self {
            DeviceCode::SM => "SM",
            DeviceCode::SD => "SD",
            DeviceCode::X => "X",
            DeviceCode::Y => "Y",
            DeviceCode::M => "M",
            DeviceCode::L => "L",
            DeviceCode::F => "F",
            DeviceCode::V => "V",
            DeviceCode::B => "B",
            DeviceCode::D => "D",
            DeviceCode::W => "W",
            DeviceCode::TS => "TS",
            DeviceCode::TC => "TC",
            DeviceCode::TN => "TN",
            DeviceCode::LTS => "LTS",
            DeviceCode::LTC => "LTC",
            DeviceCode::LTN => "LTN",
            DeviceCode::SS => "SS",
            DeviceCode::SC => "SC",
            DeviceCode::SN => "SN",
            DeviceCode::LSTS => "LSTS",
            DeviceCode::LSTC => "LSTC",
            DeviceCode::LSTN => "LSTN",
            DeviceCode::CS => "CS",
            DeviceCode::CC => "CC",
            DeviceCode::CN => "CN",
            DeviceCode::LCS => "LCS",
            DeviceCode::LCC => "LCC",
            DeviceCode::LCN => "LCN",
            DeviceCode::SB => "SB",
            DeviceCode::SW => "SW",
            DeviceCode::DX => "DX",
            DeviceCode::DY => "DY",
            DeviceCode::Z => "Z",
            DeviceCode::LZ => "LZ",
            DeviceCode::R => "R",
            DeviceCode::ZR => "ZR",
            DeviceCode::RD => "RD",
        }
    }

    /// Whether the device holds single bits
    pub fn is_bit_device(self) -> bool {
        matches!(
            self,
            DeviceCode::SM
                | DeviceCode::X
                | DeviceCode::Y
                | DeviceCode::M
                | DeviceCode::L
                | DeviceCode::F
                | DeviceCode::V
                | DeviceCode::B
                | DeviceCode::TS
                | DeviceCode::TC
                | DeviceCode::LTS
                | DeviceCode::LTC
                | DeviceCode::SS
                | DeviceCode::SC
                | DeviceCode::LSTS
                | DeviceCode::LSTC
                | DeviceCode::CS
                | DeviceCode::CC
                | DeviceCode::LCS
                | DeviceCode::LCC
                | DeviceCode::SB
                | DeviceCode::DX
                | DeviceCode::DY
        )
    }

    /// Whether the device holds 16-bit words
    pub fn is_word_device(self) -> bool {
        !self.is_bit_device()
    }

    /// Whether device numbers are conventionally written in hexadecimal
    pub fn is_hex_address(self) -> bool {
        matches!(
            self,
            DeviceCode::X
                | DeviceCode::Y
                | DeviceCode::B
                | DeviceCode::W
                | DeviceCode::SB
                | DeviceCode::SW
                | DeviceCode::DX
                | DeviceCode::DY
                | DeviceCode::ZR
        )
    }

    /// Default highest device number when no override is configured
    pub fn default_max_address(self) -> u32 {
        match self {
            DeviceCode::ZR => MAX_WIRE_ADDRESS,
            DeviceCode::RD => 1_048_575,
            DeviceCode::Z | DeviceCode::LZ => 23,
            _ => 65_535,
        }
    }

    /// Format a device number in the device's conventional radix
    pub fn format_address(self, address: u32) -> String {
        if self.is_hex_address() {
            format!("{:X}", address)
        } else {
            address.to_string()
        }
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceCode {
    type Err = SlmpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.name() == upper)
            .ok_or_else(|| SlmpError::invalid(format!("Unknown device name '{}'", s)))
    }
}

/// A device code plus device number, e.g. `D100` or `X1F`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub device: DeviceCode,
    pub address: u32,
}

impl DeviceAddress {
    pub fn new(device: DeviceCode, address: u32) -> Self {
        Self { device, address }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.device, self.device.format_address(self.address))
    }
}

impl FromStr for DeviceAddress {
    type Err = SlmpError;

    /// Parse `"D100"`, `"x1f"`, `"ZR8000"`.
    ///
    /// The longest matching device name wins, so `"SD10"` is SD10 rather
    /// than an S-prefixed device.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let device = DeviceCode::ALL
            .iter()
            .copied()
            .filter(|d| {
                upper.starts_with(d.name())
                    && upper.len() > d.name().len()
                    && number_fits(d, &upper[d.name().len()..])
            })
            .max_by_key(|d| d.name().len())
            .ok_or_else(|| SlmpError::invalid(format!("Cannot parse device address '{}'", s)))?;

        let digits = &upper[device.name().len()..];
        let radix = if device.is_hex_address() { 16 } else { 10 };
        let address = u32::from_str_radix(digits, radix)
            .map_err(|_| SlmpError::invalid(format!("Invalid device number in '{}'", s)))?;
        Ok(Self { device, address })
    }
}

fn number_fits(device: &DeviceCode, digits: &str) -> bool {
    if device.is_hex_address() {
        digits.chars().all(|c| c.is_ascii_hexdigit())
    } else {
        digits.chars().all(|c| c.is_ascii_digit())
    }
}

/// Highest addressable device numbers
///
/// Starts from [`DeviceCode::default_max_address`] and applies overrides,
/// which are typically loaded from the PLC's parameter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRanges {
    overrides: HashMap<DeviceCode, u32>,
}

impl DeviceRanges {
    /// Override the highest device number for one device
    pub fn with_max_address(mut self, device: DeviceCode, max_address: u32) -> Self {
        self.overrides.insert(device, max_address.min(MAX_WIRE_ADDRESS));
        self
    }

    /// Highest valid device number for `device`
    pub fn max_address(&self, device: DeviceCode) -> u32 {
        self.overrides
            .get(&device)
            .copied()
            .unwrap_or_else(|| device.default_max_address())
            .min(MAX_WIRE_ADDRESS)
    }

    /// Check that `count` points starting at `address` stay inside the device.
    ///
    /// Returns the violation instead of an error so callers can collect
    /// every problem in a request before failing.
    pub fn check_range(&self, device: DeviceCode, address: u32, count: u32) -> Option<Violation> {
        let max = self.max_address(device);
        let last = address as u64 + count.max(1) as u64 - 1;
        if last > max as u64 {
            Some(Violation::at(
                device,
                address,
                format!(
                    "{} point(s) exceed maximum address {}{}",
                    count,
                    device,
                    device.format_address(max)
                ),
            ))
        } else {
            None
        }
    }
}
