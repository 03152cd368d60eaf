//! Order-preserving variable-length integer encodings
//!
//! Both encoders put the byte count in the first byte, so a reader can learn the total
//! length before consuming the rest, and shorter encodings only sort first when the
//! magnitude demands it.
//!
//! Signed layout (never emits `0x00` or `0xff` as the first byte):
//!
//! ```text
//! 0x01..=0x08  negative, followed by 8..=1 inverted big-endian bytes of (-119 - v)
//! 0x09..=0xf6  single byte, value = byte - 127            (-118..=119)
//! 0xf7..=0xfe  positive, followed by 1..=8 big-endian bytes of (v - 120)
//! ```
//!
//! Unsigned layout:
//!
//! ```text
//! 0x00..=0xf7  single byte, value = byte
//! 0xf8..=0xff  followed by 1..=8 big-endian bytes of the value
//! ```

use super::{ByteReader, ByteWriter, CodecError};

const MIN_SINGLE_BYTE_ENCODED: u8 = 0x09;
const MAX_SINGLE_BYTE_ENCODED: u8 = 0xf6;
const ZERO_ADJUST: i64 = 127;
const MIN_SINGLE_BYTE_VALUE: i64 = MIN_SINGLE_BYTE_ENCODED as i64 - ZERO_ADJUST;
const MAX_SINGLE_BYTE_VALUE: i64 = MAX_SINGLE_BYTE_ENCODED as i64 - ZERO_ADJUST;

const MAX_UNSIGNED_SINGLE_BYTE: u8 = 0xf7;

/// Minimal number of bytes (at least one) needed to hold `u`
fn byte_len(u: u64) -> usize {
    let bits = 64 - u.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

fn write_be(writer: &mut ByteWriter, u: u64, n: usize) {
    writer.write_bytes(&u.to_be_bytes()[8 - n..]);
}

fn read_be(reader: &mut ByteReader<'_>, n: usize) -> Result<u64, CodecError> {
    let bytes = reader.read_bytes(n)?;
    Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

fn check_minimal(u: u64, n: usize) -> Result<(), CodecError> {
    if byte_len(u) != n {
        return Err(CodecError::Invalid(format!(
            "non-canonical {}-byte integer encoding",
            n
        )));
    }
    Ok(())
}

/// Total encoded length (including the first byte) of a signed varint starting with `first`
pub fn signed_length(first: u8) -> Result<usize, CodecError> {
    match first {
        0x00 | 0xff => Err(CodecError::Invalid(format!(
            "0x{:02x} never starts a signed varint",
            first
        ))),
        MIN_SINGLE_BYTE_ENCODED..=MAX_SINGLE_BYTE_ENCODED => Ok(1),
        f if f > MAX_SINGLE_BYTE_ENCODED => Ok(1 + (f - MAX_SINGLE_BYTE_ENCODED) as usize),
        f => Ok(1 + (MIN_SINGLE_BYTE_ENCODED - f) as usize),
    }
}

pub fn write_signed(writer: &mut ByteWriter, value: i64) {
    if (MIN_SINGLE_BYTE_VALUE..=MAX_SINGLE_BYTE_VALUE).contains(&value) {
        writer.write_byte((value + ZERO_ADJUST) as u8);
    } else if value > MAX_SINGLE_BYTE_VALUE {
        let u = (value - (MAX_SINGLE_BYTE_VALUE + 1)) as u64;
        let n = byte_len(u);
        writer.write_byte(MAX_SINGLE_BYTE_ENCODED + n as u8);
        write_be(writer, u, n);
    } else {
        // value <= -119, so the magnitude beyond the single-byte range fits in u64
        let u = (-(value - (MIN_SINGLE_BYTE_VALUE - 1))) as u64;
        let n = byte_len(u);
        writer.write_byte(MIN_SINGLE_BYTE_ENCODED - n as u8);
        write_be(writer, !u, n);
    }
}

pub fn read_signed(reader: &mut ByteReader<'_>) -> Result<i64, CodecError> {
    let first = reader.peek()?;
    let len = signed_length(first)?;
    if len > reader.remaining() {
        return Err(CodecError::Truncated {
            needed: len,
            available: reader.remaining(),
        });
    }
    reader.read_byte()?;
    let n = len - 1;
    if n == 0 {
        return Ok(first as i64 - ZERO_ADJUST);
    }
    let raw = read_be(reader, n)?;
    if first > MAX_SINGLE_BYTE_ENCODED {
        check_minimal(raw, n)?;
        if raw > (i64::MAX - (MAX_SINGLE_BYTE_VALUE + 1)) as u64 {
            return Err(CodecError::Invalid("signed varint overflows i64".into()));
        }
        Ok(raw as i64 + MAX_SINGLE_BYTE_VALUE + 1)
    } else {
        let mask = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        let u = !raw & mask;
        check_minimal(u, n)?;
        let limit = (i64::MAX as u64) - (-(MIN_SINGLE_BYTE_VALUE - 1)) as u64 + 1;
        if u > limit {
            return Err(CodecError::Invalid("signed varint underflows i64".into()));
        }
        Ok((MIN_SINGLE_BYTE_VALUE - 1) - u as i64)
    }
}

/// Encoded length of `value` as a signed varint
pub fn signed_encoded_len(value: i64) -> usize {
    let mut writer = ByteWriter::with_capacity(9);
    write_signed(&mut writer, value);
    writer.len()
}

/// Total encoded length (including the first byte) of an unsigned varint starting with `first`
pub fn unsigned_length(first: u8) -> usize {
    if first <= MAX_UNSIGNED_SINGLE_BYTE {
        1
    } else {
        1 + (first - MAX_UNSIGNED_SINGLE_BYTE) as usize
    }
}

pub fn write_unsigned(writer: &mut ByteWriter, value: u64) {
    if value <= MAX_UNSIGNED_SINGLE_BYTE as u64 {
        writer.write_byte(value as u8);
    } else {
        let n = byte_len(value);
        writer.write_byte(MAX_UNSIGNED_SINGLE_BYTE + n as u8);
        write_be(writer, value, n);
    }
}

pub fn read_unsigned(reader: &mut ByteReader<'_>) -> Result<u64, CodecError> {
    let first = reader.peek()?;
    let len = unsigned_length(first);
    if len > reader.remaining() {
        return Err(CodecError::Truncated {
            needed: len,
            available: reader.remaining(),
        });
    }
    reader.read_byte()?;
    if len == 1 {
        return Ok(first as u64);
    }
    let n = len - 1;
    let value = read_be(reader, n)?;
    check_minimal(value, n)?;
    if value <= MAX_UNSIGNED_SINGLE_BYTE as u64 {
        return Err(CodecError::Invalid(
            "non-canonical unsigned varint encoding".into(),
        ));
    }
    Ok(value)
}

/// Read an unsigned varint that must fit in `usize` (lengths, counts)
pub fn read_length(reader: &mut ByteReader<'_>) -> Result<usize, CodecError> {
    let value = read_unsigned(reader)?;
    usize::try_from(value).map_err(|_| CodecError::Invalid(format!("length {} too large", value)))
}
