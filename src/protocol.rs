/// EMS telegram definitions and wire codec
///
/// This module contains the telegram value type, the CRC-8 used on the bus,
/// decoding of raw frames in both the legacy and the extended dialect,
/// encoding back to CRC-terminated bytes, and typed field extraction used
/// by the telegram views.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};

use crate::error::{EmsError, EmsResult};
use crate::utils::format::bytes_to_hex;

/// Bus device address (7-bit)
pub type DeviceId = u8;

/// Logical telegram type (values above 0xFF belong to the extended dialect)
pub type TypeId = u16;

/// Role flag carried in the top bit of the source/destination bytes
pub const ADDRESS_MASK: u8 = 0x80;

/// Destination id used for broadcasts
pub const BROADCAST_ID: DeviceId = 0x00;

/// On-wire type byte announcing an extended-dialect telegram
pub const EXTENDED_TYPE_MARKER: u8 = 0xFF;

/// Largest frame the transport puts on the wire
pub const MAX_TELEGRAM_SIZE: usize = 33;

/// Payload cap of the legacy dialect, also the default requested read length
pub const MAX_DATA_LENGTH: usize = 27;

/// Payload cap of the extended dialect, whose two type bytes eat into the frame
pub const MAX_EXTENDED_DATA_LENGTH: usize = MAX_TELEGRAM_SIZE - HEADER_SIZE - 3;

/// Source, destination, type and offset bytes
pub const HEADER_SIZE: usize = 4;

/// Smallest telegram the controller accepts once the break marker is stripped
pub const MIN_TELEGRAM_SIZE: usize = 6;

/// Smallest frame the codec can decode: a header plus the CRC byte
const MIN_DECODE_SIZE: usize = HEADER_SIZE + 1;

// Lookup table for the bus CRC-8 (x * 2 reduced by 0x19 for the upper half).
// Wire compatible with every EMS device, do not regenerate.
const EMS_CRC_TABLE: [u8; 256] = [
    0x00, 0x02, 0x04, 0x06, 0x08, 0x0A, 0x0C, 0x0E, 0x10, 0x12, 0x14, 0x16, 0x18, 0x1A, 0x1C, 0x1E,
    0x20, 0x22, 0x24, 0x26, 0x28, 0x2A, 0x2C, 0x2E, 0x30, 0x32, 0x34, 0x36, 0x38, 0x3A, 0x3C, 0x3E,
    0x40, 0x42, 0x44, 0x46, 0x48, 0x4A, 0x4C, 0x4E, 0x50, 0x52, 0x54, 0x56, 0x58, 0x5A, 0x5C, 0x5E,
    0x60, 0x62, 0x64, 0x66, 0x68, 0x6A, 0x6C, 0x6E, 0x70, 0x72, 0x74, 0x76, 0x78, 0x7A, 0x7C, 0x7E,
    0x80, 0x82, 0x84, 0x86, 0x88, 0x8A, 0x8C, 0x8E, 0x90, 0x92, 0x94, 0x96, 0x98, 0x9A, 0x9C, 0x9E,
    0xA0, 0xA2, 0xA4, 0xA6, 0xA8, 0xAA, 0xAC, 0xAE, 0xB0, 0xB2, 0xB4, 0xB6, 0xB8, 0xBA, 0xBC, 0xBE,
    0xC0, 0xC2, 0xC4, 0xC6, 0xC8, 0xCA, 0xCC, 0xCE, 0xD0, 0xD2, 0xD4, 0xD6, 0xD8, 0xDA, 0xDC, 0xDE,
    0xE0, 0xE2, 0xE4, 0xE6, 0xE8, 0xEA, 0xEC, 0xEE, 0xF0, 0xF2, 0xF4, 0xF6, 0xF8, 0xFA, 0xFC, 0xFE,
    0x19, 0x1B, 0x1D, 0x1F, 0x11, 0x13, 0x15, 0x17, 0x09, 0x0B, 0x0D, 0x0F, 0x01, 0x03, 0x05, 0x07,
    0x39, 0x3B, 0x3D, 0x3F, 0x31, 0x33, 0x35, 0x37, 0x29, 0x2B, 0x2D, 0x2F, 0x21, 0x23, 0x25, 0x27,
    0x59, 0x5B, 0x5D, 0x5F, 0x51, 0x53, 0x55, 0x57, 0x49, 0x4B, 0x4D, 0x4F, 0x41, 0x43, 0x45, 0x47,
    0x79, 0x7B, 0x7D, 0x7F, 0x71, 0x73, 0x75, 0x77, 0x69, 0x6B, 0x6D, 0x6F, 0x61, 0x63, 0x65, 0x67,
    0x99, 0x9B, 0x9D, 0x9F, 0x91, 0x93, 0x95, 0x97, 0x89, 0x8B, 0x8D, 0x8F, 0x81, 0x83, 0x85, 0x87,
    0xB9, 0xBB, 0xBD, 0xBF, 0xB1, 0xB3, 0xB5, 0xB7, 0xA9, 0xAB, 0xAD, 0xAF, 0xA1, 0xA3, 0xA5, 0xA7,
    0xD9, 0xDB, 0xDD, 0xDF, 0xD1, 0xD3, 0xD5, 0xD7, 0xC9, 0xCB, 0xCD, 0xCF, 0xC1, 0xC3, 0xC5, 0xC7,
    0xF9, 0xFB, 0xFD, 0xFF, 0xF1, 0xF3, 0xF5, 0xF7, 0xE9, 0xEB, 0xED, 0xEF, 0xE1, 0xE3, 0xE5, 0xE7,
];

/// Calculate the bus CRC-8 over `data`
pub fn calculate_crc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| EMS_CRC_TABLE[crc as usize] ^ byte)
}

/// Telegram operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Read request, payload is the requested length
    Read,
    /// Read request carrying additional payload
    ReadWithData,
    /// Write addressed to a single device
    Write,
    /// Write addressed to everybody (destination 0)
    Broadcast,
}

impl Operation {
    /// Single letter used in the classic telegram log line
    pub fn symbol(self) -> char {
        match self {
            Operation::Read => 'R',
            Operation::ReadWithData => 'D',
            Operation::Write => 'W',
            Operation::Broadcast => 'B',
        }
    }

    /// Whether the destination byte carries the read flag on the wire
    pub fn is_read(self) -> bool {
        matches!(self, Operation::Read | Operation::ReadWithData)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "Read",
            Operation::ReadWithData => "Read With Data",
            Operation::Write => "Write",
            Operation::Broadcast => "Broadcast",
        };
        write!(f, "{} ({})", name, self.symbol())
    }
}

/// What a received frame looks like before any decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Master grants the addressed device a transmit slot
    Poll(DeviceId),
    /// Candidate telegram, long enough to be decoded
    Telegram,
    /// Poll reply or line noise, nothing to do
    Runt,
}

/// Classify a frame with its break marker already stripped
pub fn classify_frame(frame: &[u8]) -> FrameKind {
    match frame.len() {
        1 | 2 if frame[0] & ADDRESS_MASK == 0 => FrameKind::Poll(frame[0]),
        len if len >= MIN_TELEGRAM_SIZE => FrameKind::Telegram,
        _ => FrameKind::Runt,
    }
}

fn extended_type(high: u8, low: u8) -> TypeId {
    ((high as TypeId) << 8) + low as TypeId + 0x100
}

/// One complete bus message
///
/// Source and destination are kept as 7-bit ids; the read flag lives in
/// [`Operation`] and is put back on the wire by [`Telegram::encode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telegram {
    operation: Operation,
    source: DeviceId,
    destination: DeviceId,
    offset: u8,
    type_id: TypeId,
    data: Vec<u8>,
}

impl Telegram {
    /// Create a telegram from its parts
    pub fn new(
        operation: Operation,
        source: DeviceId,
        destination: DeviceId,
        offset: u8,
        type_id: TypeId,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            operation,
            source: source & !ADDRESS_MASK,
            destination: destination & !ADDRESS_MASK,
            offset,
            type_id,
            data: data.into(),
        }
    }

    /// Read request for `requested_len` bytes starting at offset 0
    pub fn read(source: DeviceId, destination: DeviceId, type_id: TypeId, requested_len: u8) -> Self {
        Self::new(Operation::Read, source, destination, 0, type_id, vec![requested_len])
    }

    /// Write of `data` at `offset`
    pub fn write(
        source: DeviceId,
        destination: DeviceId,
        offset: u8,
        type_id: TypeId,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(Operation::Write, source, destination, offset, type_id, data)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn source(&self) -> DeviceId {
        self.source
    }

    pub fn destination(&self) -> DeviceId {
        self.destination
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Requested length of a read request, 0 when the payload is empty
    pub fn requested_len(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    /// Whether the type needs the extended on-wire encoding
    pub fn is_extended(&self) -> bool {
        self.type_id > 0xFF
    }

    /// Decode a raw frame (break marker already stripped, CRC included)
    ///
    /// A `0xFF` type byte selects the extended dialect once the frame has
    /// [`MIN_TELEGRAM_SIZE`] bytes. The dialects cannot be told apart on the
    /// wire, so a legacy telegram of type `0x00FF` only survives without
    /// payload: with one data byte it is rejected as [`EmsError::Malformed`],
    /// with more its first two data bytes are taken as an extended type.
    pub fn decode(raw: &[u8]) -> EmsResult<Self> {
        let length = raw.len();
        if length < MIN_DECODE_SIZE {
            return Err(EmsError::too_short(length, MIN_DECODE_SIZE));
        }

        let expected = calculate_crc(&raw[..length - 1]);
        let actual = raw[length - 1];
        if expected != actual {
            return Err(EmsError::checksum(expected, actual));
        }

        let destination = raw[1];
        let is_read = destination & ADDRESS_MASK != 0;
        let operation = if destination == BROADCAST_ID {
            Operation::Broadcast
        } else if is_read {
            Operation::Read
        } else {
            Operation::Write
        };

        let telegram = if raw[2] != EXTENDED_TYPE_MARKER || length < MIN_TELEGRAM_SIZE {
            trace!(target: "ems::telegram", "legacy frame, {} bytes from 0x{:02X}", length, raw[0]);
            Self::new(operation, raw[0], destination, raw[3], raw[2] as TypeId, &raw[4..length - 1])
        } else if is_read {
            if length < 8 {
                return Err(EmsError::malformed(format!(
                    "extended read request of {} bytes has no type field",
                    length
                )));
            }
            trace!(target: "ems::telegram", "extended read request, {} bytes", length);
            Self::new(operation, raw[0], destination, raw[3], extended_type(raw[5], raw[6]), &raw[4..5])
        } else {
            if length < 7 {
                return Err(EmsError::malformed(format!(
                    "extended write of {} bytes has no type field",
                    length
                )));
            }
            trace!(target: "ems::telegram", "extended frame, {} bytes", length);
            Self::new(operation, raw[0], destination, raw[3], extended_type(raw[4], raw[5]), &raw[6..length - 1])
        };

        Ok(telegram)
    }

    /// Encode to wire bytes with the trailing CRC
    ///
    /// Payloads are cut to [`MAX_DATA_LENGTH`] in the legacy dialect and to
    /// [`MAX_EXTENDED_DATA_LENGTH`] in the extended one, so the result never
    /// exceeds [`MAX_TELEGRAM_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        let cap = if self.is_extended() {
            MAX_EXTENDED_DATA_LENGTH
        } else {
            MAX_DATA_LENGTH
        };
        let data = if self.data.len() > cap {
            warn!(
                target: "ems::telegram",
                "payload of {} bytes for type 0x{:04X} truncated to {}",
                self.data.len(),
                self.type_id,
                cap
            );
            &self.data[..cap]
        } else {
            &self.data[..]
        };

        let mut raw = Vec::with_capacity(HEADER_SIZE + 3 + data.len() + 1);
        raw.push(self.source | ADDRESS_MASK);
        if self.operation.is_read() && self.destination != BROADCAST_ID {
            raw.push(self.destination | ADDRESS_MASK);
        } else {
            raw.push(self.destination);
        }

        if self.is_extended() {
            raw.push(EXTENDED_TYPE_MARKER);
            raw.push(self.offset);
            let high = ((self.type_id >> 8) - 1) as u8;
            let low = (self.type_id & 0xFF) as u8;
            if self.operation == Operation::Read {
                raw.push(self.requested_len());
                raw.push(high);
                raw.push(low);
            } else {
                raw.push(high);
                raw.push(low);
                raw.extend_from_slice(data);
            }
        } else {
            raw.push(self.type_id as u8);
            raw.push(self.offset);
            if self.operation == Operation::Read {
                raw.push(self.requested_len());
            } else {
                raw.extend_from_slice(data);
            }
        }

        raw.push(calculate_crc(&raw));
        raw
    }

    /// Bytes of a field that starts at logical position `start`
    ///
    /// Returns `None` unless the whole field lies inside the carried data.
    pub fn field(&self, start: u8, size: usize) -> Option<&[u8]> {
        self.field_with_offset(start, self.offset, size)
    }

    /// Same as [`Telegram::field`] but relative to an explicit offset
    pub fn field_with_offset(&self, start: u8, offset: u8, size: usize) -> Option<&[u8]> {
        if offset > start {
            return None;
        }
        let local = (start - offset) as usize;
        if local + size > self.data.len() {
            return None;
        }
        Some(&self.data[local..local + size])
    }

    pub fn u8_at(&self, start: u8) -> Option<u8> {
        self.field(start, 1).map(|b| b[0])
    }

    pub fn i8_at(&self, start: u8) -> Option<i8> {
        self.field(start, 1).map(|b| b[0] as i8)
    }

    pub fn u16_at(&self, start: u8) -> Option<u16> {
        self.field(start, 2).map(BigEndian::read_u16)
    }

    pub fn i16_at(&self, start: u8) -> Option<i16> {
        self.field(start, 2).map(BigEndian::read_i16)
    }

    /// Unsigned 24-bit big-endian value
    pub fn u24_at(&self, start: u8) -> Option<u32> {
        self.field(start, 3).map(BigEndian::read_u24)
    }

    /// Signed 24-bit big-endian value, sign-extended to 32 bits
    pub fn i24_at(&self, start: u8) -> Option<i32> {
        self.field(start, 3).map(BigEndian::read_i24)
    }

    /// Single flag bit `bit` (0 = LSB) of the byte at `start`
    pub fn bit_at(&self, start: u8, bit: u8) -> Option<bool> {
        self.u8_at(start).map(|byte| byte & (1 << bit) != 0)
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(0x{:02X}) -{}-> (0x{:02X}), type: 0x{:04X}, offset: {}, dataLen: {} data: {}",
            self.source,
            self.operation.symbol(),
            self.destination,
            self.type_id,
            self.offset,
            self.data.len(),
            bytes_to_hex(&self.data)
        )
    }
}
