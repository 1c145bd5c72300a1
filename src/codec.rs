//! Byte order handling, scalar encoding and command frame construction
//!
//! Every multi byte field that crosses the bus goes through [ByteOrder::apply]. Values are
//! first laid out little endian, then reversed if the target talks Motorola format.

use std::fmt;

use strum_macros::{Display, EnumString};

/// Size of a CAN frame payload used by CCP and XCP command objects
pub const FRAME_SIZE: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Byte order of the target ECU
pub enum ByteOrder {
    /// Intel format
    #[default]
    #[strum(serialize = "lsb_first")]
    LsbFirst,
    /// Motorola format
    #[strum(serialize = "msb_first")]
    MsbFirst,
}

impl ByteOrder {
    /// Converts a little endian field in place into this byte order.
    /// Applying it twice restores the original field.
    pub fn apply(self, field: &mut [u8]) {
        if self == ByteOrder::MsbFirst {
            field.reverse();
        }
    }

    /// Returns a copy of `field` converted into this byte order
    pub fn swapped<const N: usize>(self, mut field: [u8; N]) -> [u8; N] {
        self.apply(&mut field);
        field
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumString, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Scalar types that can be measured or calibrated
pub enum ScalarType {
    /// Signed 8 bit
    #[strum(serialize = "BYTE")]
    I8,
    /// Unsigned 8 bit
    #[strum(serialize = "UBYTE")]
    U8,
    /// Signed 16 bit
    #[strum(serialize = "WORD")]
    I16,
    /// Unsigned 16 bit
    #[strum(serialize = "UWORD")]
    U16,
    /// Signed 32 bit
    #[strum(serialize = "DWORD")]
    I32,
    /// Unsigned 32 bit
    #[strum(serialize = "UDWORD")]
    U32,
    /// IEEE 754 single precision
    #[strum(serialize = "FLOAT")]
    F32,
    /// IEEE 754 double precision. Only usable for calibration, a double does not fit
    /// into any DTO placement
    #[strum(serialize = "DOUBLE")]
    F64,
}

impl ScalarType {
    /// Size of the type on the target in bytes
    pub fn size(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
/// A typed value as it is stored on the target
pub enum ScalarValue {
    /// BYTE
    I8(i8),
    /// UBYTE
    U8(u8),
    /// WORD
    I16(i16),
    /// UWORD
    U16(u16),
    /// DWORD
    I32(i32),
    /// UDWORD
    U32(u32),
    /// FLOAT
    F32(f32),
    /// DOUBLE
    F64(f64),
}

impl ScalarValue {
    /// Casts a physical value into the given target type.
    /// Integer targets truncate toward zero and saturate at the type limits.
    pub fn from_f64(kind: ScalarType, value: f64) -> Self {
        match kind {
            ScalarType::I8 => ScalarValue::I8(value as i8),
            ScalarType::U8 => ScalarValue::U8(value as u8),
            ScalarType::I16 => ScalarValue::I16(value as i16),
            ScalarType::U16 => ScalarValue::U16(value as u16),
            ScalarType::I32 => ScalarValue::I32(value as i32),
            ScalarType::U32 => ScalarValue::U32(value as u32),
            ScalarType::F32 => ScalarValue::F32(value as f32),
            ScalarType::F64 => ScalarValue::F64(value),
        }
    }

    /// Type of the value
    pub fn kind(&self) -> ScalarType {
        match self {
            ScalarValue::I8(_) => ScalarType::I8,
            ScalarValue::U8(_) => ScalarType::U8,
            ScalarValue::I16(_) => ScalarType::I16,
            ScalarValue::U16(_) => ScalarType::U16,
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::F64(_) => ScalarType::F64,
        }
    }

    /// Widens the value to a double
    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::I8(v) => v as f64,
            ScalarValue::U8(v) => v as f64,
            ScalarValue::I16(v) => v as f64,
            ScalarValue::U16(v) => v as f64,
            ScalarValue::I32(v) => v as f64,
            ScalarValue::U32(v) => v as f64,
            ScalarValue::F32(v) => v as f64,
            ScalarValue::F64(v) => v,
        }
    }

    /// Encodes the value in target byte order
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut bytes = match *self {
            ScalarValue::I8(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U8(v) => v.to_le_bytes().to_vec(),
            ScalarValue::I16(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U16(v) => v.to_le_bytes().to_vec(),
            ScalarValue::I32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::F32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::F64(v) => v.to_le_bytes().to_vec(),
        };
        order.apply(&mut bytes);
        bytes
    }

    /// Decodes a value of type `kind` from the start of `bytes`.
    ///
    /// Returns `None` if `bytes` is shorter than the type
    pub fn decode(kind: ScalarType, bytes: &[u8], order: ByteOrder) -> Option<Self> {
        let mut raw = bytes.get(..kind.size())?.to_vec();
        order.apply(&mut raw);
        Some(match kind {
            ScalarType::I8 => ScalarValue::I8(raw[0] as i8),
            ScalarType::U8 => ScalarValue::U8(raw[0]),
            ScalarType::I16 => ScalarValue::I16(i16::from_le_bytes([raw[0], raw[1]])),
            ScalarType::U16 => ScalarValue::U16(u16::from_le_bytes([raw[0], raw[1]])),
            ScalarType::I32 => ScalarValue::I32(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            ScalarType::U32 => ScalarValue::U32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            ScalarType::F32 => ScalarValue::F32(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            ScalarType::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&raw);
                ScalarValue::F64(f64::from_le_bytes(b))
            }
        })
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.as_f64())
    }
}

/// Builder for a single 8 byte command object.
///
/// Unused bytes stay zero. Writes that would run past the end of the frame are truncated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    data: [u8; FRAME_SIZE],
    order: ByteOrder,
}

impl CommandFrame {
    /// Starts a frame with the command code in byte 0
    pub fn new(opcode: u8, order: ByteOrder) -> Self {
        let mut data = [0u8; FRAME_SIZE];
        data[0] = opcode;
        Self { data, order }
    }

    /// Sets a single byte
    pub fn with_u8(mut self, pos: usize, value: u8) -> Self {
        if let Some(b) = self.data.get_mut(pos) {
            *b = value;
        }
        self
    }

    /// Sets a 16 bit field in the frame's byte order
    pub fn with_u16(self, pos: usize, value: u16) -> Self {
        let order = self.order;
        self.with_u16_as(pos, value, order)
    }

    /// Sets a 16 bit field in an explicit byte order
    pub fn with_u16_as(self, pos: usize, value: u16, order: ByteOrder) -> Self {
        self.with_slice(pos, &order.swapped(value.to_le_bytes()))
    }

    /// Sets a 32 bit field in the frame's byte order
    pub fn with_u32(self, pos: usize, value: u32) -> Self {
        let order = self.order;
        self.with_slice(pos, &order.swapped(value.to_le_bytes()))
    }

    /// Copies raw bytes into the frame starting at `pos`
    pub fn with_slice(mut self, pos: usize, bytes: &[u8]) -> Self {
        if pos < FRAME_SIZE {
            let n = bytes.len().min(FRAME_SIZE - pos);
            self.data[pos..pos + n].copy_from_slice(&bytes[..n]);
        }
        self
    }

    /// Finished frame
    pub fn into_bytes(self) -> [u8; FRAME_SIZE] {
        self.data
    }
}

/// Reads a 32 bit field from a received frame
pub fn read_u32(data: &[u8; FRAME_SIZE], pos: usize, order: ByteOrder) -> u32 {
    let mut field = [0u8; 4];
    if let Some(src) = data.get(pos..pos + 4) {
        field.copy_from_slice(src);
    }
    u32::from_le_bytes(order.swapped(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_is_an_involution() {
        let original = [0x12u8, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        for len in [2, 4, 8] {
            let mut field = original[..len].to_vec();
            ByteOrder::MsbFirst.apply(&mut field);
            let reversed: Vec<u8> = original[..len].iter().rev().copied().collect();
            assert_eq!(field, reversed, "{len} byte field");
            ByteOrder::MsbFirst.apply(&mut field);
            assert_eq!(field, &original[..len], "{len} byte field");

            ByteOrder::LsbFirst.apply(&mut field);
            assert_eq!(field, &original[..len], "{len} byte field");
        }
        assert_eq!(ByteOrder::MsbFirst.swapped([1u8, 2]), [2, 1]);
    }

    #[test]
    fn multi_byte_scalars_survive_both_orders() {
        let values = [
            ScalarValue::U16(0xBEEF),
            ScalarValue::I16(-2),
            ScalarValue::U32(0xDEAD_BEEF),
            ScalarValue::F32(-1.5),
            ScalarValue::F64(1234.5678),
        ];
        for v in values {
            let kind = match v {
                ScalarValue::U16(_) => ScalarType::U16,
                ScalarValue::I16(_) => ScalarType::I16,
                ScalarValue::U32(_) => ScalarType::U32,
                ScalarValue::F32(_) => ScalarType::F32,
                _ => ScalarType::F64,
            };
            let lsb = v.encode(ByteOrder::LsbFirst);
            let msb = v.encode(ByteOrder::MsbFirst);
            assert_eq!(lsb.len(), kind.size());
            let mut reversed = lsb.clone();
            reversed.reverse();
            assert_eq!(msb, reversed, "{kind}");
            assert_eq!(ScalarValue::decode(kind, &lsb, ByteOrder::LsbFirst), Some(v));
            assert_eq!(ScalarValue::decode(kind, &msb, ByteOrder::MsbFirst), Some(v));
        }
        assert_eq!(
            ScalarValue::F64(1.0).encode(ByteOrder::MsbFirst),
            vec![0x3F, 0xF0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(ScalarValue::I16(-2).encode(ByteOrder::LsbFirst), vec![0xFE, 0xFF]);
    }

    #[test]
    fn frame_fields_follow_byte_order() {
        let f = CommandFrame::new(0x01, ByteOrder::MsbFirst)
            .with_u8(1, 0xAA)
            .with_u16(2, 0x0039)
            .into_bytes();
        assert_eq!(f, [0x01, 0xAA, 0x00, 0x39, 0, 0, 0, 0]);

        let f = CommandFrame::new(0x02, ByteOrder::LsbFirst)
            .with_u32(4, 0x1234_5678)
            .into_bytes();
        assert_eq!(f, [0x02, 0, 0, 0, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(read_u32(&f, 4, ByteOrder::LsbFirst), 0x1234_5678);
    }

    #[test]
    fn slices_are_truncated_at_frame_end() {
        let f = CommandFrame::new(0x03, ByteOrder::LsbFirst)
            .with_slice(6, &[1, 2, 3, 4])
            .into_bytes();
        assert_eq!(f, [0x03, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn scalar_cast_and_codec() {
        assert_eq!(ScalarValue::from_f64(ScalarType::U8, 300.0), ScalarValue::U8(255));
        assert_eq!(ScalarValue::from_f64(ScalarType::I16, -12.7), ScalarValue::I16(-12));

        let v = ScalarValue::U16(0xBEEF);
        let bytes = v.encode(ByteOrder::MsbFirst);
        assert_eq!(bytes, vec![0xBE, 0xEF]);
        assert_eq!(ScalarValue::decode(ScalarType::U16, &bytes, ByteOrder::MsbFirst), Some(v));
        assert_eq!(ScalarValue::decode(ScalarType::U32, &bytes, ByteOrder::MsbFirst), None);
    }

    #[test]
    fn type_names() {
        assert_eq!("UWORD".parse::<ScalarType>().unwrap(), ScalarType::U16);
        assert_eq!(ScalarType::F32.to_string(), "FLOAT");
        assert!("LONG".parse::<ScalarType>().is_err());
        assert_eq!(ScalarType::F64.size(), 8);
    }
}
