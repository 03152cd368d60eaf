//! Fixed-width numeric types, booleans and the variable-length `i64`

use std::cmp::Ordering;

use super::varint;
use super::{ByteReader, ByteWriter, CodecError, FieldType};

/// `false` = `0x00`, `true` = `0x01`
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanType;

impl FieldType for BooleanType {
    type Value = bool;

    fn name(&self) -> &str {
        "boolean"
    }

    fn write(&self, writer: &mut ByteWriter, value: &bool) {
        writer.write_byte(*value as u8);
    }

    fn read(&self, reader: &mut ByteReader<'_>) -> Result<bool, CodecError> {
        match reader.read_byte()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            b => Err(CodecError::Invalid(format!("invalid boolean byte 0x{:02x}", b))),
        }
    }

    fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        reader.skip(1)
    }

    fn compare(&self, a: &bool, b: &bool) -> Ordering {
        a.cmp(b)
    }

    fn has_prefix_0x00(&self) -> bool {
        true
    }

    fn has_prefix_0xff(&self) -> bool {
        false
    }
}

// Two's complement with the sign bit flipped, big-endian
macro_rules! signed_type {
    ($ty:ident, $prim:ty, $bits:ty, $name:literal) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $ty;

        impl $ty {
            const SIGN: $bits = 1 << (<$bits>::BITS - 1);
            const WIDTH: usize = std::mem::size_of::<$prim>();
        }

        impl FieldType for $ty {
            type Value = $prim;

            fn name(&self) -> &str {
                $name
            }

            fn write(&self, writer: &mut ByteWriter, value: &$prim) {
                let bits = (*value as $bits) ^ Self::SIGN;
                writer.write_bytes(&bits.to_be_bytes());
            }

            fn read(&self, reader: &mut ByteReader<'_>) -> Result<$prim, CodecError> {
                let bits = <$bits>::from_be_bytes(reader.read_array()?);
                Ok((bits ^ Self::SIGN) as $prim)
            }

            fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
                reader.skip(Self::WIDTH)
            }

            fn compare(&self, a: &$prim, b: &$prim) -> Ordering {
                a.cmp(b)
            }

            fn has_prefix_0x00(&self) -> bool {
                true
            }

            fn has_prefix_0xff(&self) -> bool {
                true
            }
        }
    };
}

macro_rules! unsigned_type {
    ($ty:ident, $prim:ty, $name:literal) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $ty;

        impl FieldType for $ty {
            type Value = $prim;

            fn name(&self) -> &str {
                $name
            }

            fn write(&self, writer: &mut ByteWriter, value: &$prim) {
                writer.write_bytes(&value.to_be_bytes());
            }

            fn read(&self, reader: &mut ByteReader<'_>) -> Result<$prim, CodecError> {
                Ok(<$prim>::from_be_bytes(reader.read_array()?))
            }

            fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
                reader.skip(std::mem::size_of::<$prim>())
            }

            fn compare(&self, a: &$prim, b: &$prim) -> Ordering {
                a.cmp(b)
            }

            fn has_prefix_0x00(&self) -> bool {
                true
            }

            fn has_prefix_0xff(&self) -> bool {
                true
            }
        }
    };
}

// Positive values get the sign bit set, negative values are fully inverted, so the
// byte order matches `total_cmp` (-NaN < -inf < ... < -0.0 < 0.0 < ... < inf < NaN).
macro_rules! float_type {
    ($ty:ident, $prim:ty, $bits:ty, $name:literal) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $ty;

        impl $ty {
            const SIGN: $bits = 1 << (<$bits>::BITS - 1);
        }

        impl FieldType for $ty {
            type Value = $prim;

            fn name(&self) -> &str {
                $name
            }

            fn write(&self, writer: &mut ByteWriter, value: &$prim) {
                let bits = value.to_bits();
                let bits = if bits & Self::SIGN != 0 {
                    !bits
                } else {
                    bits | Self::SIGN
                };
                writer.write_bytes(&bits.to_be_bytes());
            }

            fn read(&self, reader: &mut ByteReader<'_>) -> Result<$prim, CodecError> {
                let bits = <$bits>::from_be_bytes(reader.read_array()?);
                let bits = if bits & Self::SIGN != 0 {
                    bits & !Self::SIGN
                } else {
                    !bits
                };
                Ok(<$prim>::from_bits(bits))
            }

            fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
                reader.skip(std::mem::size_of::<$prim>())
            }

            fn compare(&self, a: &$prim, b: &$prim) -> Ordering {
                a.total_cmp(b)
            }

            fn has_prefix_0x00(&self) -> bool {
                true
            }

            fn has_prefix_0xff(&self) -> bool {
                true
            }
        }
    };
}

signed_type!(I8Type, i8, u8, "i8");
signed_type!(I16Type, i16, u16, "i16");
signed_type!(I32Type, i32, u32, "i32");
signed_type!(I64Type, i64, u64, "i64");

unsigned_type!(U8Type, u8, "u8");
unsigned_type!(U16Type, u16, "u16");
unsigned_type!(U32Type, u32, "u32");
unsigned_type!(U64Type, u64, "u64");

float_type!(F32Type, f32, u32, "f32");
float_type!(F64Type, f64, u64, "f64");

/// Variable-length `i64`: small magnitudes take one byte, never starts with `0x00`/`0xff`
#[derive(Debug, Clone, Copy, Default)]
pub struct VarLongType;

impl FieldType for VarLongType {
    type Value = i64;

    fn name(&self) -> &str {
        "varlong"
    }

    fn write(&self, writer: &mut ByteWriter, value: &i64) {
        varint::write_signed(writer, *value);
    }

    fn read(&self, reader: &mut ByteReader<'_>) -> Result<i64, CodecError> {
        varint::read_signed(reader)
    }

    fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        let len = varint::signed_length(reader.peek()?)?;
        reader.skip(len)
    }

    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn has_prefix_0x00(&self) -> bool {
        false
    }

    fn has_prefix_0xff(&self) -> bool {
        false
    }
}
