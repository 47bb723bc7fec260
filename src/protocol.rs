/// SLMP protocol definitions and frame codec
///
/// This module contains the binary 3E/4E frame layout, command codes, end
/// codes and the payload encoders/decoders for every device operation.
/// Everything here is pure: no I/O and no hidden state, so a frame is fully
/// determined by its inputs.
///
/// Request frame (4E; 3E omits serial and reserved):
///
/// ```text
/// [sub-header:2][serial:2][reserved:2][network:1][node:1][dest-proc:2][multidrop:1]
/// [length:2][timer:2][command:2][subcommand:2][payload...]
/// ```
///
/// Response frame:
///
/// ```text
/// [sub-header:2][serial:2][reserved:2][network:1][node:1][dest-proc:2][multidrop:1]
/// [length:2][end-code:2][data...]
/// ```
///
/// All multi-byte fields are little-endian. `length` counts everything after
/// itself (timer, command and subcommand in requests; end code in responses).

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceAddress, DeviceCode};
use crate::error::{SlmpError, SlmpResult};

/// Maximum bit points per device read/write frame
pub const MAX_BIT_POINTS: usize = 7168;

/// Maximum word points per device read/write frame
pub const MAX_WORD_POINTS: usize = 960;

/// Maximum devices in a random read/write or monitor registration
pub const MAX_RANDOM_POINTS: usize = 192;

/// Maximum blocks in a block read/write
pub const MAX_BLOCKS: usize = 120;

/// Maximum words in a memory read/write
pub const MAX_MEMORY_WORDS: usize = 480;

/// Maximum characters of self-test loopback data
pub const MAX_SELF_TEST_CHARS: usize = 960;

/// Encoded request frames must be shorter than this
pub const MAX_FRAME_LEN: usize = 8194;

/// Bytes covered by the request length field besides the payload
/// (timer + command + subcommand)
const REQUEST_LENGTH_OVERHEAD: usize = 6;

/// Frame version (3E or 4E)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameVersion {
    #[serde(rename = "3E")]
    E3,
    #[serde(rename = "4E")]
    E4,
}

impl FrameVersion {
    /// Request sub-header bytes
    pub fn request_subheader(self) -> [u8; 2] {
        match self {
            FrameVersion::E3 => [0x50, 0x00],
            FrameVersion::E4 => [0x54, 0x00],
        }
    }

    /// Response sub-header bytes
    pub fn response_subheader(self) -> [u8; 2] {
        match self {
            FrameVersion::E3 => [0xD0, 0x00],
            FrameVersion::E4 => [0xD4, 0x00],
        }
    }

    /// Response bytes up to and including the data length field
    pub fn response_header_len(self) -> usize {
        match self {
            FrameVersion::E3 => 9,
            FrameVersion::E4 => 13,
        }
    }

    /// Request bytes up to and including the data length field
    pub fn request_header_len(self) -> usize {
        self.response_header_len()
    }

    /// Whether frames carry a serial number
    pub fn has_serial(self) -> bool {
        matches!(self, FrameVersion::E4)
    }

    fn routing_offset(self) -> usize {
        match self {
            FrameVersion::E3 => 2,
            FrameVersion::E4 => 6,
        }
    }
}

impl fmt::Display for FrameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameVersion::E3 => f.write_str("3E"),
            FrameVersion::E4 => f.write_str("4E"),
        }
    }
}

/// Routing target of a request
///
/// The all-zero target addresses the directly connected station.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    pub network: u8,
    pub node: u8,
    pub dest_processor: u16,
    pub multidrop: u8,
}

impl Target {
    pub fn new(network: u8, node: u8, dest_processor: u16, multidrop: u8) -> Self {
        Self {
            network,
            node,
            dest_processor,
            multidrop,
        }
    }

    /// Directly connected station
    pub fn local() -> Self {
        Self::default()
    }

    /// Whether every routing field is zero
    pub fn is_local(&self) -> bool {
        *self == Self::default()
    }
}

/// SLMP commands issued by this library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Command {
    DeviceRead = 0x0401,
    DeviceWrite = 0x1401,
    DeviceReadRandom = 0x0403,
    DeviceWriteRandom = 0x1402,
    DeviceReadBlock = 0x0406,
    DeviceWriteBlock = 0x1406,
    EntryMonitorDevice = 0x0801,
    ExecuteMonitor = 0x0802,
    ReadTypeName = 0x0101,
    SelfTest = 0x0619,
    ClearError = 0x1617,
    MemoryRead = 0x0613,
    MemoryWrite = 0x1613,
}

impl Command {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0401 => Some(Command::DeviceRead),
            0x1401 => Some(Command::DeviceWrite),
            0x0403 => Some(Command::DeviceReadRandom),
            0x1402 => Some(Command::DeviceWriteRandom),
            0x0406 => Some(Command::DeviceReadBlock),
            0x1406 => Some(Command::DeviceWriteBlock),
            0x0801 => Some(Command::EntryMonitorDevice),
            0x0802 => Some(Command::ExecuteMonitor),
            0x0101 => Some(Command::ReadTypeName),
            0x0619 => Some(Command::SelfTest),
            0x1617 => Some(Command::ClearError),
            0x0613 => Some(Command::MemoryRead),
            0x1613 => Some(Command::MemoryWrite),
            _ => None,
        }
    }

    /// Wire value
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Human-readable command name
    pub fn name(self) -> &'static str {
        match self {
            Command::DeviceRead => "Device Read",
            Command::DeviceWrite => "Device Write",
            Command::DeviceReadRandom => "Device Read Random",
            Command::DeviceWriteRandom => "Device Write Random",
            Command::DeviceReadBlock => "Device Read Block",
            Command::DeviceWriteBlock => "Device Write Block",
            Command::EntryMonitorDevice => "Entry Monitor Device",
            Command::ExecuteMonitor => "Execute Monitor",
            Command::ReadTypeName => "Read Type Name",
            Command::SelfTest => "Self Test",
            Command::ClearError => "Clear Error",
            Command::MemoryRead => "Memory Read",
            Command::MemoryWrite => "Memory Write",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.name(), self.to_u16())
    }
}

/// Subcommands for device access
pub mod subcommand {
    /// Access in 16-bit word units
    pub const WORD_UNITS: u16 = 0x0000;
    /// Access in single-bit units
    pub const BIT_UNITS: u16 = 0x0001;
}

/// End codes returned by the PLC
pub mod end_code {
    pub const SUCCESS: u16 = 0x0000;
    pub const WRITE_POINTS_OUT_OF_RANGE: u16 = 0xC051;
    pub const READ_POINTS_OUT_OF_RANGE: u16 = 0xC052;
    pub const DEVICE_OUT_OF_RANGE: u16 = 0xC056;
    pub const REQUEST_LENGTH_MISMATCH: u16 = 0xC058;
    pub const WRONG_COMMAND: u16 = 0xC059;
    pub const DEVICE_NOT_ACCESSIBLE: u16 = 0xC05B;
    pub const WRONG_FORMAT: u16 = 0xC05C;
    pub const WRONG_METHOD: u16 = 0xC05F;
    pub const SAME_DATA: u16 = 0xC060;
    pub const WRONG_LENGTH: u16 = 0xC061;
    pub const BUSY: u16 = 0xCEE0;
    pub const EXCEED_REQUEST_LENGTH: u16 = 0xCEE1;
    pub const EXCEED_RESPONSE_LENGTH: u16 = 0xCEE2;
    pub const OTHER_NETWORK_ERROR: u16 = 0xCF00;
    pub const SERVER_NOT_FOUND: u16 = 0xCF10;
    pub const WRONG_CONFIG_ITEM: u16 = 0xCF20;
    pub const PARAMETER_ID_NOT_FOUND: u16 = 0xCF30;
    pub const EXCLUSIVE_WRITE_NOT_STARTED: u16 = 0xCF31;
    pub const DATA_FRAGMENT_SHORTAGE: u16 = 0xCF40;
    pub const DATA_FRAGMENT_DUPLICATE: u16 = 0xCF41;
    pub const DATA_FRAGMENT_LOST: u16 = 0xCF43;
    pub const DATA_FRAGMENT_NOT_SUPPORTED: u16 = 0xCF44;
    pub const RELAY_FAILURE: u16 = 0xCF70;
    pub const TIMEOUT: u16 = 0xCF71;

    /// Human-readable description of an end code
    pub fn describe(code: u16) -> &'static str {
        match code {
            SUCCESS => "success",
            WRITE_POINTS_OUT_OF_RANGE => "write points out of range",
            READ_POINTS_OUT_OF_RANGE => "read points out of range",
            DEVICE_OUT_OF_RANGE => "device number out of range",
            REQUEST_LENGTH_MISMATCH => "request data length mismatch",
            WRONG_COMMAND => "command or subcommand not supported",
            DEVICE_NOT_ACCESSIBLE => "device cannot be read or written",
            WRONG_FORMAT => "request content error",
            WRONG_METHOD => "request not executable in this state",
            SAME_DATA => "same data",
            WRONG_LENGTH => "request length error",
            BUSY => "busy",
            EXCEED_REQUEST_LENGTH => "request data too long",
            EXCEED_RESPONSE_LENGTH => "response data too long",
            OTHER_NETWORK_ERROR => "other network error",
            SERVER_NOT_FOUND => "server not found",
            WRONG_CONFIG_ITEM => "wrong configuration item",
            PARAMETER_ID_NOT_FOUND => "parameter ID not found",
            EXCLUSIVE_WRITE_NOT_STARTED => "exclusive write not started",
            DATA_FRAGMENT_SHORTAGE => "data fragment shortage",
            DATA_FRAGMENT_DUPLICATE => "duplicate data fragment",
            DATA_FRAGMENT_LOST => "data fragment lost",
            DATA_FRAGMENT_NOT_SUPPORTED => "data fragmentation not supported",
            RELAY_FAILURE => "relay failure",
            TIMEOUT => "PLC-side timeout",
            _ => "unknown end code",
        }
    }
}

/// An SLMP request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub version: FrameVersion,
    /// Serial number (4E only; ignored for 3E)
    pub serial: u16,
    pub target: Target,
    /// Monitoring timer in 250 ms units (0 = wait indefinitely)
    pub timer: u16,
    pub command: u16,
    pub subcommand: u16,
    pub payload: Vec<u8>,
}

impl RequestFrame {
    pub fn new(version: FrameVersion, command: Command, subcommand: u16, payload: Vec<u8>) -> Self {
        Self {
            version,
            serial: 0,
            target: Target::default(),
            timer: 0,
            command: command.to_u16(),
            subcommand,
            payload,
        }
    }

    pub fn with_serial(mut self, serial: u16) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_timer(mut self, timer: u16) -> Self {
        self.timer = timer;
        self
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        self.version.request_header_len() + REQUEST_LENGTH_OVERHEAD + self.payload.len()
    }

    /// Encode to wire bytes
    ///
    /// Fails with a validation error when the frame would reach
    /// [`MAX_FRAME_LEN`]; nothing else can fail.
    pub fn encode(&self) -> SlmpResult<Vec<u8>> {
        let total = self.encoded_len();
        if total >= MAX_FRAME_LEN {
            return Err(SlmpError::invalid(format!(
                "Request frame of {} bytes exceeds the {} byte limit",
                total,
                MAX_FRAME_LEN - 1
            )));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&self.version.request_subheader());
        if self.version.has_serial() {
            buf.put_u16_le(self.serial);
            buf.put_u16_le(0x0000);
        }
        put_target(&mut buf, &self.target);
        buf.put_u16_le((self.payload.len() + REQUEST_LENGTH_OVERHEAD) as u16);
        buf.put_u16_le(self.timer);
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.subcommand);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    /// Decode a request frame (used by the simulator)
    pub fn decode(frame: &[u8]) -> SlmpResult<Self> {
        let version = match frame.get(0..2) {
            Some([0x50, 0x00]) => FrameVersion::E3,
            Some([0x54, 0x00]) => FrameVersion::E4,
            _ => return Err(SlmpError::frame("Unknown request sub-header")),
        };
        let header_len = version.request_header_len();
        if frame.len() < header_len + REQUEST_LENGTH_OVERHEAD {
            return Err(SlmpError::frame(format!(
                "Request frame too short: {} bytes",
                frame.len()
            )));
        }
        let serial = if version.has_serial() {
            LittleEndian::read_u16(&frame[2..4])
        } else {
            0
        };
        let target = read_target(&frame[version.routing_offset()..]);
        let length = LittleEndian::read_u16(&frame[header_len - 2..header_len]) as usize;
        if length < REQUEST_LENGTH_OVERHEAD || frame.len() < header_len + length {
            return Err(SlmpError::frame(format!(
                "Request length field {} does not match {} received bytes",
                length,
                frame.len()
            )));
        }
        let body = &frame[header_len..header_len + length];
        Ok(Self {
            version,
            serial,
            target,
            timer: LittleEndian::read_u16(&body[0..2]),
            command: LittleEndian::read_u16(&body[2..4]),
            subcommand: LittleEndian::read_u16(&body[4..6]),
            payload: body[6..].to_vec(),
        })
    }
}

/// A decoded SLMP response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub version: FrameVersion,
    pub serial: Option<u16>,
    pub target: Target,
    pub end_code: u16,
    pub data: Vec<u8>,
}

impl ResponseFrame {
    /// Successful response carrying `data`
    pub fn success(version: FrameVersion, serial: u16, target: Target, data: Vec<u8>) -> Self {
        Self {
            version,
            serial: version.has_serial().then_some(serial),
            target,
            end_code: end_code::SUCCESS,
            data,
        }
    }

    /// Error response carrying `end_code`
    pub fn failure(version: FrameVersion, serial: u16, target: Target, code: u16) -> Self {
        Self {
            version,
            serial: version.has_serial().then_some(serial),
            target,
            end_code: code,
            data: Vec::new(),
        }
    }

    /// Decode a complete response frame
    ///
    /// Rejects frames shorter than the fixed header, frames with the wrong
    /// sub-header and frames whose length field claims more bytes than were
    /// received. The end code is returned as-is; see [`ResponseFrame::into_data`].
    pub fn decode(frame: &[u8], version: FrameVersion) -> SlmpResult<Self> {
        let header_len = version.response_header_len();
        if frame.len() < header_len + 2 {
            return Err(SlmpError::frame(format!(
                "Response frame too short: {} bytes, expected at least {}",
                frame.len(),
                header_len + 2
            )));
        }
        if frame[0..2] != version.response_subheader() {
            return Err(SlmpError::frame(format!(
                "Unexpected response sub-header {:02X} {:02X} for {} frame",
                frame[0], frame[1], version
            )));
        }

        let serial = version
            .has_serial()
            .then(|| LittleEndian::read_u16(&frame[2..4]));
        let target = read_target(&frame[version.routing_offset()..]);
        let length = LittleEndian::read_u16(&frame[header_len - 2..header_len]) as usize;
        if length < 2 {
            return Err(SlmpError::frame(format!("Response length field {} is too small", length)));
        }
        if frame.len() < header_len + length {
            return Err(SlmpError::frame(format!(
                "Incomplete response: length field {} but only {} bytes follow the header",
                length,
                frame.len() - header_len
            )));
        }

        let end_code = LittleEndian::read_u16(&frame[header_len..header_len + 2]);
        let data = frame[header_len + 2..header_len + length].to_vec();
        Ok(Self {
            version,
            serial,
            target,
            end_code,
            data,
        })
    }

    /// Encode to wire bytes (used by the simulator)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.version.response_header_len() + 2 + self.data.len());
        buf.put_slice(&self.version.response_subheader());
        if self.version.has_serial() {
            buf.put_u16_le(self.serial.unwrap_or(0));
            buf.put_u16_le(0x0000);
        }
        put_target(&mut buf, &self.target);
        buf.put_u16_le((self.data.len() + 2) as u16);
        buf.put_u16_le(self.end_code);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Response data, or a protocol error for a non-zero end code
    pub fn into_data(self) -> SlmpResult<Vec<u8>> {
        if self.end_code == end_code::SUCCESS {
            Ok(self.data)
        } else {
            Err(SlmpError::protocol(self.end_code))
        }
    }
}

/// Decode a response and return its data on success
pub fn decode_response(frame: &[u8], version: FrameVersion) -> SlmpResult<Vec<u8>> {
    ResponseFrame::decode(frame, version)?.into_data()
}

/// Number of bytes that follow a response header, read from its length field
///
/// `header` must hold at least [`FrameVersion::response_header_len`] bytes.
pub fn response_body_len(header: &[u8], version: FrameVersion) -> SlmpResult<usize> {
    let header_len = version.response_header_len();
    if header.len() < header_len {
        return Err(SlmpError::frame("Response header truncated"));
    }
    if header[0..2] != version.response_subheader() {
        return Err(SlmpError::frame(format!(
            "Unexpected response sub-header {:02X} {:02X} for {} frame",
            header[0], header[1], version
        )));
    }
    let length = LittleEndian::read_u16(&header[header_len - 2..header_len]) as usize;
    if length < 2 || header_len + length >= MAX_FRAME_LEN {
        return Err(SlmpError::frame(format!("Invalid response length field {}", length)));
    }
    Ok(length)
}

/// Serial number carried by a 4E frame (request or response)
pub fn frame_serial(frame: &[u8]) -> Option<u16> {
    match frame.get(0..4) {
        Some([0x54 | 0xD4, 0x00, lo, hi]) => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

fn put_target(buf: &mut BytesMut, target: &Target) {
    buf.put_u8(target.network);
    buf.put_u8(target.node);
    buf.put_u16_le(target.dest_processor);
    buf.put_u8(target.multidrop);
}

fn read_target(bytes: &[u8]) -> Target {
    Target {
        network: bytes[0],
        node: bytes[1],
        dest_processor: LittleEndian::read_u16(&bytes[2..4]),
        multidrop: bytes[4],
    }
}

/// Word-range spec for block read/write
///
/// For bit devices `count` is in 16-point words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub device: DeviceCode,
    pub address: u32,
    pub count: u16,
}

impl BlockSpec {
    pub fn new(device: DeviceCode, address: u32, count: u16) -> Self {
        Self {
            device,
            address,
            count,
        }
    }
}

/// Word block data for block write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordBlock {
    pub device: DeviceCode,
    pub address: u32,
    pub values: Vec<u16>,
}

/// Bit block data for block write; `bits.len()` must be a multiple of 16
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitBlock {
    pub device: DeviceCode,
    pub address: u32,
    pub bits: Vec<bool>,
}

/// Values returned by random read and monitor execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomReadResult {
    pub words: Vec<u16>,
    pub dwords: Vec<u32>,
}

/// Values returned by block read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReadResult {
    pub word_blocks: Vec<Vec<u16>>,
    pub bit_blocks: Vec<Vec<bool>>,
}

/// PLC model reported by Read Type Name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeName {
    pub model: String,
    pub model_code: Option<u16>,
}

/// Payload encoders and response-data decoders
pub mod payload {
    use super::*;

    fn put_device(buf: &mut BytesMut, device: DeviceCode, address: u32) {
        buf.put_uint_le(address as u64, 3);
        buf.put_u8(device.code());
    }

    /// `[address:3][code:1][count:2]`
    pub fn device_read(device: DeviceCode, address: u32, count: u16) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6);
        put_device(&mut buf, device, address);
        buf.put_u16_le(count);
        buf.to_vec()
    }

    /// Device write in bit units: header followed by nibble-packed bits
    pub fn bit_write(device: DeviceCode, address: u32, bits: &[bool]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6 + (bits.len() + 1) / 2);
        put_device(&mut buf, device, address);
        buf.put_u16_le(bits.len() as u16);
        buf.put_slice(&pack_bits_nibble(bits));
        buf.to_vec()
    }

    /// Device write in word units: header followed by little-endian words
    pub fn word_write(device: DeviceCode, address: u32, words: &[u16]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6 + words.len() * 2);
        put_device(&mut buf, device, address);
        buf.put_u16_le(words.len() as u16);
        for &w in words {
            buf.put_u16_le(w);
        }
        buf.to_vec()
    }

    /// `[wordCount:1][dwordCount:1]` then one device spec per entry.
    ///
    /// Shared by random read and monitor registration.
    pub fn random_read(words: &[DeviceAddress], dwords: &[DeviceAddress]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + (words.len() + dwords.len()) * 4);
        buf.put_u8(words.len() as u8);
        buf.put_u8(dwords.len() as u8);
        for d in words.iter().chain(dwords) {
            put_device(&mut buf, d.device, d.address);
        }
        buf.to_vec()
    }

    /// `[count:1]` then `[device:4][value:1]` per bit
    pub fn random_bit_write(bits: &[(DeviceAddress, bool)]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + bits.len() * 5);
        buf.put_u8(bits.len() as u8);
        for (d, value) in bits {
            put_device(&mut buf, d.device, d.address);
            buf.put_u8(u8::from(*value));
        }
        buf.to_vec()
    }

    /// `[wordCount:1][dwordCount:1]`, word entries with u16 values, then dword entries with u32 values
    pub fn random_word_write(words: &[(DeviceAddress, u16)], dwords: &[(DeviceAddress, u32)]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + words.len() * 6 + dwords.len() * 8);
        buf.put_u8(words.len() as u8);
        buf.put_u8(dwords.len() as u8);
        for (d, value) in words {
            put_device(&mut buf, d.device, d.address);
            buf.put_u16_le(*value);
        }
        for (d, value) in dwords {
            put_device(&mut buf, d.device, d.address);
            buf.put_u32_le(*value);
        }
        buf.to_vec()
    }

    /// `[wordBlocks:1][bitBlocks:1]` then `[device:4][count:2]` per block
    pub fn block_read(word_blocks: &[BlockSpec], bit_blocks: &[BlockSpec]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + (word_blocks.len() + bit_blocks.len()) * 6);
        buf.put_u8(word_blocks.len() as u8);
        buf.put_u8(bit_blocks.len() as u8);
        for b in word_blocks.iter().chain(bit_blocks) {
            put_device(&mut buf, b.device, b.address);
            buf.put_u16_le(b.count);
        }
        buf.to_vec()
    }

    /// Block write: each block spec is followed by its data
    pub fn block_write(word_blocks: &[WordBlock], bit_blocks: &[BitBlock]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(word_blocks.len() as u8);
        buf.put_u8(bit_blocks.len() as u8);
        for b in word_blocks {
            put_device(&mut buf, b.device, b.address);
            buf.put_u16_le(b.values.len() as u16);
            for &w in &b.values {
                buf.put_u16_le(w);
            }
        }
        for b in bit_blocks {
            let words = bits_to_words(&b.bits);
            put_device(&mut buf, b.device, b.address);
            buf.put_u16_le(words.len() as u16);
            for w in words {
                buf.put_u16_le(w);
            }
        }
        buf.to_vec()
    }

    /// `[address:4][words:2]`
    pub fn memory_read(address: u32, words: u16) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32_le(address);
        buf.put_u16_le(words);
        buf.to_vec()
    }

    /// `[address:4][words:2][data...]`
    pub fn memory_write(address: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6 + data.len());
        buf.put_u32_le(address);
        buf.put_u16_le((data.len() / 2) as u16);
        buf.put_slice(data);
        buf.to_vec()
    }

    /// `[length:2][ascii data...]`
    pub fn self_test(data: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + data.len());
        buf.put_u16_le(data.len() as u16);
        buf.put_slice(data.as_bytes());
        buf.to_vec()
    }

    /// Pack bits two per byte, first point in the high nibble
    pub fn pack_bits_nibble(bits: &[bool]) -> Vec<u8> {
        bits.chunks(2)
            .map(|pair| {
                let high = if pair[0] { 0x10 } else { 0x00 };
                let low = if pair.get(1).copied().unwrap_or(false) { 0x01 } else { 0x00 };
                high | low
            })
            .collect()
    }

    /// Unpack `count` nibble-packed bits
    pub fn unpack_bits_nibble(data: &[u8], count: usize) -> SlmpResult<Vec<bool>> {
        let needed = (count + 1) / 2;
        if data.len() < needed {
            return Err(SlmpError::frame(format!(
                "Bit data too short: {} bytes for {} points",
                data.len(),
                count
            )));
        }
        Ok((0..count)
            .map(|i| {
                let byte = data[i / 2];
                if i % 2 == 0 {
                    byte & 0x10 != 0
                } else {
                    byte & 0x01 != 0
                }
            })
            .collect())
    }

    /// Pack bits LSB-first into 16-bit words (bit blocks)
    pub fn bits_to_words(bits: &[bool]) -> Vec<u16> {
        bits.chunks(16)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u16, |acc, (i, &b)| if b { acc | (1 << i) } else { acc })
            })
            .collect()
    }

    /// Expand words into bits, LSB first
    pub fn words_to_bits(words: &[u16]) -> Vec<bool> {
        words
            .iter()
            .flat_map(|&w| (0..16).map(move |i| w & (1 << i) != 0))
            .collect()
    }

    /// Decode `count` little-endian words
    pub fn parse_words(data: &[u8], count: usize) -> SlmpResult<Vec<u16>> {
        if data.len() < count * 2 {
            return Err(SlmpError::frame(format!(
                "Word data too short: {} bytes for {} words",
                data.len(),
                count
            )));
        }
        Ok(data[..count * 2]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect())
    }

    /// Decode random-read / monitor data: words first, then dwords
    pub fn parse_random(data: &[u8], words: usize, dwords: usize) -> SlmpResult<RandomReadResult> {
        let needed = words * 2 + dwords * 4;
        if data.len() < needed {
            return Err(SlmpError::frame(format!(
                "Random read data too short: {} bytes, expected {}",
                data.len(),
                needed
            )));
        }
        let (word_bytes, rest) = data.split_at(words * 2);
        Ok(RandomReadResult {
            words: word_bytes.chunks_exact(2).map(LittleEndian::read_u16).collect(),
            dwords: rest[..dwords * 4]
                .chunks_exact(4)
                .map(LittleEndian::read_u32)
                .collect(),
        })
    }

    /// Decode block-read data in request order
    pub fn parse_blocks(
        data: &[u8],
        word_blocks: &[BlockSpec],
        bit_blocks: &[BlockSpec],
    ) -> SlmpResult<BlockReadResult> {
        let mut offset = 0usize;
        let mut take = |count: u16| -> SlmpResult<Vec<u16>> {
            let len = count as usize * 2;
            let slice = data.get(offset..offset + len).ok_or_else(|| {
                SlmpError::frame(format!(
                    "Block read data too short: {} bytes, needed {}",
                    data.len(),
                    offset + len
                ))
            })?;
            offset += len;
            Ok(slice.chunks_exact(2).map(LittleEndian::read_u16).collect())
        };

        let mut result = BlockReadResult::default();
        for block in word_blocks {
            result.word_blocks.push(take(block.count)?);
        }
        for block in bit_blocks {
            result.bit_blocks.push(words_to_bits(&take(block.count)?));
        }
        Ok(result)
    }

    /// Decode Read Type Name data: 16 ASCII bytes plus an optional model code
    pub fn parse_type_name(data: &[u8]) -> SlmpResult<TypeName> {
        if data.len() < 16 {
            return Err(SlmpError::frame(format!(
                "Type name data too short: {} bytes",
                data.len()
            )));
        }
        let model = String::from_utf8_lossy(&data[..16])
            .trim_end_matches(|c: char| c == '\0' || c == ' ')
            .to_string();
        let model_code = data.get(16..18).map(LittleEndian::read_u16);
        Ok(TypeName { model, model_code })
    }

    /// Decode self-test echo data
    pub fn parse_self_test(data: &[u8]) -> SlmpResult<Vec<u8>> {
        if data.len() < 2 {
            return Err(SlmpError::frame("Self test response too short"));
        }
        let len = LittleEndian::read_u16(&data[0..2]) as usize;
        data.get(2..2 + len)
            .map(|d| d.to_vec())
            .ok_or_else(|| SlmpError::frame("Self test echo truncated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_4e_word_read() {
        let frame = RequestFrame::new(
            FrameVersion::E4,
            Command::DeviceRead,
            subcommand::WORD_UNITS,
            payload::device_read(DeviceCode::D, 100, 4),
        )
        .with_serial(0x1234)
        .with_timer(4)
        .encode()
        .unwrap();

        assert_eq!(
            frame,
            vec![
                0x54, 0x00, // sub-header
                0x34, 0x12, // serial
                0x00, 0x00, // reserved
                0x00, 0x00, // network, node
                0x00, 0x00, // dest processor
                0x00, // multidrop
                0x0C, 0x00, // length = 6 + 6
                0x04, 0x00, // timer
                0x01, 0x04, // command 0x0401
                0x00, 0x00, // subcommand
                0x64, 0x00, 0x00, 0xA8, // D100
                0x04, 0x00, // count
            ]
        );
    }

    #[test]
    fn test_encode_3e_omits_serial() {
        let target = Target::new(1, 2, 0x03FF, 0);
        let frame = RequestFrame::new(FrameVersion::E3, Command::ClearError, 0, Vec::new())
            .with_serial(0x9999)
            .with_target(target)
            .encode()
            .unwrap();
        assert_eq!(
            frame,
            vec![0x50, 0x00, 0x01, 0x02, 0xFF, 0x03, 0x00, 0x06, 0x00, 0x00, 0x00, 0x17, 0x16, 0x00, 0x00]
        );
        let decoded = RequestFrame::decode(&frame).unwrap();
        assert_eq!(decoded.target, target);
        assert_eq!(decoded.command, Command::ClearError.to_u16());
    }

    #[test]
    fn test_encode_is_deterministic() {
        let build = || {
            RequestFrame::new(
                FrameVersion::E4,
                Command::DeviceWrite,
                subcommand::BIT_UNITS,
                payload::bit_write(DeviceCode::M, 10, &[true, false, true]),
            )
            .with_serial(7)
            .encode()
            .unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = RequestFrame::new(FrameVersion::E3, Command::DeviceWrite, 0, vec![0u8; 8200]);
        assert!(matches!(frame.encode(), Err(SlmpError::Validation { .. })));
    }

    #[test]
    fn test_decode_success_response() {
        let bytes = ResponseFrame::success(FrameVersion::E4, 5, Target::local(), vec![0x0A, 0x00, 0x0B, 0x00])
            .encode();
        let frame = ResponseFrame::decode(&bytes, FrameVersion::E4).unwrap();
        assert_eq!(frame.serial, Some(5));
        assert_eq!(frame.end_code, 0);
        assert_eq!(frame.into_data().unwrap(), vec![0x0A, 0x00, 0x0B, 0x00]);
    }

    #[test]
    fn test_decode_end_code_maps_to_protocol_error() {
        let bytes = vec![0xD0, 0x00, 0x00, 0xFF, 0xFF, 0x03, 0x00, 0x02, 0x00, 0x59, 0xC0];
        let err = decode_response(&bytes, FrameVersion::E3).unwrap_err();
        assert_eq!(err.end_code(), Some(0xC059));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // shorter than the fixed header
        assert!(matches!(
            ResponseFrame::decode(&[0xD0, 0x00, 0x00], FrameVersion::E3),
            Err(SlmpError::Frame { .. })
        ));
        // wrong sub-header for the version
        let bytes = ResponseFrame::success(FrameVersion::E3, 0, Target::local(), vec![]).encode();
        assert!(ResponseFrame::decode(&bytes, FrameVersion::E4).is_err());
        // length claims more data than present
        let mut bytes = ResponseFrame::success(FrameVersion::E3, 0, Target::local(), vec![1, 2]).encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            ResponseFrame::decode(&bytes, FrameVersion::E3),
            Err(SlmpError::Frame { .. })
        ));
    }

    #[test]
    fn test_response_body_len_and_serial() {
        let bytes = ResponseFrame::success(FrameVersion::E4, 0x0102, Target::local(), vec![0; 8]).encode();
        assert_eq!(response_body_len(&bytes[..13], FrameVersion::E4).unwrap(), 10);
        assert_eq!(frame_serial(&bytes), Some(0x0102));
        assert_eq!(frame_serial(&[0xD0, 0x00, 0x01, 0x02]), None);
    }

    #[test]
    fn test_nibble_bit_packing() {
        let packed = payload::pack_bits_nibble(&[true, false, true, true, false]);
        assert_eq!(packed, vec![0x10, 0x11, 0x00]);
        let bits = payload::unpack_bits_nibble(&packed, 5).unwrap();
        assert_eq!(bits, vec![true, false, true, true, false]);
        assert!(payload::unpack_bits_nibble(&[0x10], 3).is_err());
    }

    #[test]
    fn test_bit_block_words() {
        let mut bits = vec![false; 16];
        bits[0] = true;
        bits[15] = true;
        assert_eq!(payload::bits_to_words(&bits), vec![0x8001]);
        assert_eq!(payload::words_to_bits(&[0x8001]), bits);
    }

    #[test]
    fn test_random_payload_and_parse() {
        let words = [DeviceAddress::new(DeviceCode::D, 0), DeviceAddress::new(DeviceCode::W, 0x10)];
        let dwords = [DeviceAddress::new(DeviceCode::D, 1500)];
        let p = payload::random_read(&words, &dwords);
        assert_eq!(p[0], 2);
        assert_eq!(p[1], 1);
        assert_eq!(&p[2..6], &[0x00, 0x00, 0x00, 0xA8]);
        assert_eq!(&p[6..10], &[0x10, 0x00, 0x00, 0xB4]);
        assert_eq!(&p[10..14], &[0xDC, 0x05, 0x00, 0xA8]);

        let data = [0x01, 0x00, 0x02, 0x00, 0x78, 0x56, 0x34, 0x12];
        let result = payload::parse_random(&data, 2, 1).unwrap();
        assert_eq!(result.words, vec![1, 2]);
        assert_eq!(result.dwords, vec![0x1234_5678]);
        assert!(payload::parse_random(&data[..6], 2, 1).is_err());
    }

    #[test]
    fn test_parse_blocks() {
        let words = [BlockSpec::new(DeviceCode::D, 0, 2)];
        let bits = [BlockSpec::new(DeviceCode::M, 0, 1)];
        let data = [0x01, 0x00, 0x02, 0x00, 0x05, 0x00];
        let result = payload::parse_blocks(&data, &words, &bits).unwrap();
        assert_eq!(result.word_blocks, vec![vec![1, 2]]);
        assert_eq!(result.bit_blocks[0].len(), 16);
        assert!(result.bit_blocks[0][0]);
        assert!(!result.bit_blocks[0][1]);
        assert!(result.bit_blocks[0][2]);
    }

    #[test]
    fn test_parse_type_name() {
        let mut data = b"Q03UDVCPU\0\0\0\0\0\0\0".to_vec();
        data.extend_from_slice(&[0x66, 0x03]);
        let name = payload::parse_type_name(&data).unwrap();
        assert_eq!(name.model, "Q03UDVCPU");
        assert_eq!(name.model_code, Some(0x0366));
    }

    #[test]
    fn test_memory_and_self_test_payloads() {
        assert_eq!(payload::memory_read(0x0000_1000, 4), vec![0x00, 0x10, 0x00, 0x00, 0x04, 0x00]);
        let p = payload::self_test("ABCD");
        assert_eq!(p, vec![0x04, 0x00, b'A', b'B', b'C', b'D']);
        assert_eq!(payload::parse_self_test(&p).unwrap(), b"ABCD".to_vec());
    }
}
