//! Wire protocol of the SMS UPS serial interface.
//!
//! The device answers a single fixed query command with a binary status frame.
//! This module builds commands, validates and decodes frames into a [`Reading`]
//! and derives the instantaneous wattage from a configured [`FullPower`] rating.
//!
//! ```
//! use smsups_lib::protocol::{self as proto, FullPower};
//!
//! let frame = "3d00e600e600e603e801f403e800190000";
//! let reading = proto::decode_hex(&format!("{frame}00"))?
//!     .with_full_power(FullPower::default());
//! assert_eq!(reading.output_voltage, 23.0);
//! assert_eq!(reading.watts, 1400.0);
//! # Ok::<(), proto::Error>(())
//! ```

use std::fmt;
use std::ops::Deref;

/// Errors raised while validating values or decoding frames.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The frame is shorter than [`FRAME_LEN`].
    #[error("response too short: {0} bytes")]
    TooShort(usize),
    /// The first byte of the frame is not [`RESPONSE_HEADER`].
    #[error("invalid header: expected 0x3d, got 0x{0:02x}")]
    BadHeader(u8),
    /// A hex encoded frame could not be converted to bytes.
    #[error("invalid hex frame: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    /// The baud rate is not one the device supports.
    #[error("unsupported baud rate {0}, expected one of 2400, 4800 or 9600")]
    BaudRateNotSupported(u32),
    /// The full power rating must be a positive number of watts.
    #[error("full power rating must be greater than zero, got {0}")]
    FullPowerOutOfRange(u32),
}

/// First byte of every valid status frame.
pub const RESPONSE_HEADER: u8 = 0x3D;

/// Minimum length of a status frame in bytes.
pub const FRAME_LEN: usize = 18;

/// Status query ("Q") including its trailing checksum and carriage return.
pub const QUERY_COMMAND: [u8; 7] = [0x51, 0xFF, 0xFF, 0xFF, 0xFF, 0xB3, 0x0D];

/// Offset of the status bitmask within a frame.
const STATUS_OFFSET: usize = 15;

/// Bit masks of the status byte, bit 0 being the least significant.
pub mod status {
    pub const BATTERY_IN_USE: u8 = 1 << 0;
    pub const BATTERY_LOW: u8 = 1 << 1;
    pub const BYPASS_ACTIVE: u8 = 1 << 2;
    pub const BOOST_ACTIVE: u8 = 1 << 3;
    pub const LINE_OK: u8 = 1 << 4;
    pub const TEST_ACTIVE: u8 = 1 << 5;
    pub const SHUTDOWN_ACTIVE: u8 = 1 << 6;
    pub const BEEP_ENABLED: u8 = 1 << 7;
}

/// An immutable byte sequence sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(Vec<u8>);

impl Command {
    /// Builds a command from `payload` followed by its [`checksum`].
    pub fn with_checksum(payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.extend_from_slice(payload);
        bytes.push(checksum(payload));
        Self(bytes)
    }

    /// Returns `true` if all bytes including the trailing checksum sum to zero modulo 0x100.
    pub fn is_checksum_valid(&self) -> bool {
        !self.0.is_empty() && sum(&self.0) == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Command {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Command> for Vec<u8> {
    fn from(command: Command) -> Self {
        command.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Returns a fresh copy of the status query command.
pub fn build_query_command() -> Command {
    Command(QUERY_COMMAND.to_vec())
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Computes the 8-bit checksum `(0x100 - (sum % 0x100)) % 0x100` of `payload`.
///
/// Appending the result to `payload` makes the whole buffer sum to zero
/// modulo 0x100. A payload that already sums to zero gets a checksum of zero.
pub fn checksum(payload: &[u8]) -> u8 {
    // Two's complement negation is exactly (0x100 - s) % 0x100.
    sum(payload).wrapping_neg()
}

/// Decoded status bits of a frame.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub battery_in_use: bool,
    pub battery_low: bool,
    pub bypass_active: bool,
    pub boost_active: bool,
    pub line_ok: bool,
    pub test_active: bool,
    pub shutdown_active: bool,
    pub beep_enabled: bool,
}

impl From<u8> for Status {
    fn from(bits: u8) -> Self {
        Self {
            battery_in_use: bits & status::BATTERY_IN_USE != 0,
            battery_low: bits & status::BATTERY_LOW != 0,
            bypass_active: bits & status::BYPASS_ACTIVE != 0,
            boost_active: bits & status::BOOST_ACTIVE != 0,
            line_ok: bits & status::LINE_OK != 0,
            test_active: bits & status::TEST_ACTIVE != 0,
            shutdown_active: bits & status::SHUTDOWN_ACTIVE != 0,
            beep_enabled: bits & status::BEEP_ENABLED != 0,
        }
    }
}

/// One decoded status frame.
///
/// A reading is either fully decoded (`no_data == false`) or the
/// [`Reading::no_data`] sentinel, whose values carry no meaning.
///
/// Only [`decode`] produces readings with `no_data == false`. Code that
/// builds a `Reading` by hand starts from one of those two and must not
/// clear `no_data` on the sentinel. A reading flagged `no_data` is never
/// shown or summarized, whatever its other fields hold.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Input voltage before the last transfer, in volts.
    pub last_input_voltage: f64,
    /// Input voltage in volts.
    pub input_voltage: f64,
    /// Output voltage in volts.
    pub output_voltage: f64,
    /// Output load in percent of the full power rating.
    pub output_load: f64,
    /// Output frequency in hertz.
    pub output_frequency: f64,
    /// Battery level in percent.
    pub battery_level: f64,
    /// Temperature in degrees Celsius (°C).
    pub temperature: f64,
    /// Instantaneous power in watts, see [`Reading::with_full_power`].
    pub watts: f64,
    pub status: Status,
    /// Set on the sentinel only, hides every other field.
    pub no_data: bool,
}

impl Reading {
    /// The "no reading available" sentinel.
    pub const fn no_data() -> Self {
        Self {
            last_input_voltage: 0.0,
            input_voltage: 0.0,
            output_voltage: 0.0,
            output_load: 0.0,
            output_frequency: 0.0,
            battery_level: 0.0,
            temperature: 0.0,
            watts: 0.0,
            status: Status {
                battery_in_use: false,
                battery_low: false,
                bypass_active: false,
                boost_active: false,
                line_ok: false,
                test_active: false,
                shutdown_active: false,
                beep_enabled: false,
            },
            no_data: true,
        }
    }

    /// Returns a copy with `watts = full_power * output_load / 100`.
    ///
    /// Must only be called on decoded readings; the sentinel is not guarded.
    pub fn with_full_power(self, full_power: FullPower) -> Self {
        Self {
            watts: *full_power as f64 * (self.output_load / 100.0),
            ..self
        }
    }

    /// Summarizes the status bits into a single operating condition.
    pub fn condition(&self) -> Condition {
        if self.no_data {
            Condition::NoData
        } else if self.status.battery_low {
            Condition::LowBattery
        } else if self.status.battery_in_use {
            Condition::OnBattery
        } else if self.status.line_ok {
            Condition::Online
        } else {
            Condition::Unknown
        }
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::no_data()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_data {
            return write!(f, "No data");
        }
        write!(
            f,
            "In: {:.1}V | Out: {:.1}V ({:.0}%) | {:.0}W | {:.1}Hz | Bat: {:.0}% | {:.0}°C",
            self.input_voltage,
            self.output_voltage,
            self.output_load,
            self.watts,
            self.output_frequency,
            self.battery_level,
            self.temperature
        )
    }
}

/// Operating condition derived from the status bits.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NoData,
    LowBattery,
    OnBattery,
    Online,
    Unknown,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Condition::NoData => "No data",
            Condition::LowBattery => "Low Battery",
            Condition::OnBattery => "On Battery",
            Condition::Online => "OK",
            Condition::Unknown => "Unknown",
        };
        write!(f, "{text}")
    }
}

/// Big-endian two's complement field scaled by 1/10.
fn scaled_field(raw: &[u8], offset: usize) -> f64 {
    i16::from_be_bytes([raw[offset], raw[offset + 1]]) as f64 / 10.0
}

/// Decodes a raw status frame.
///
/// Bytes after the status byte are reserved and ignored, but they count
/// towards the [`FRAME_LEN`] check.
pub fn decode(raw: &[u8]) -> Result<Reading, Error> {
    if raw.len() < FRAME_LEN {
        return Err(Error::TooShort(raw.len()));
    }
    if raw[0] != RESPONSE_HEADER {
        return Err(Error::BadHeader(raw[0]));
    }
    Ok(Reading {
        last_input_voltage: scaled_field(raw, 1),
        input_voltage: scaled_field(raw, 3),
        output_voltage: scaled_field(raw, 5),
        output_load: scaled_field(raw, 7),
        output_frequency: scaled_field(raw, 9),
        battery_level: scaled_field(raw, 11),
        temperature: scaled_field(raw, 13),
        watts: 0.0,
        status: Status::from(raw[STATUS_OFFSET]),
        no_data: false,
    })
}

/// Decodes a hex encoded status frame such as `3d00e600e6...`.
///
/// Whitespace between byte pairs is ignored.
pub fn decode_hex(text: &str) -> Result<Reading, Error> {
    let compact: String = text.split_whitespace().collect();
    let raw = hex::decode(compact)?;
    decode(&raw)
}

/// Serial baud rates supported by the device.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum BaudRate {
    #[default]
    B2400 = 2400,
    B4800 = 4800,
    B9600 = 9600,
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2400 => Ok(BaudRate::B2400),
            4800 => Ok(BaudRate::B4800),
            9600 => Ok(BaudRate::B9600),
            _ => Err(Error::BaudRateNotSupported(value)),
        }
    }
}

impl From<&BaudRate> for u32 {
    fn from(baud_rate: &BaudRate) -> u32 {
        *baud_rate as u32
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u32::from(self))
    }
}

/// Rated output of the UPS at 100% load, in watts.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullPower(u32);

impl FullPower {
    pub const DEFAULT: FullPower = FullPower(1400);
}

impl Default for FullPower {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Deref for FullPower {
    type Target = u32;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u32> for FullPower {
    type Error = Error;

    fn try_from(watts: u32) -> Result<Self, Self::Error> {
        if watts == 0 {
            Err(Error::FullPowerOutOfRange(watts))
        } else {
            Ok(Self(watts))
        }
    }
}

impl fmt::Display for FullPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} W", self.0)
    }
}
