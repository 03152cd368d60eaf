//! Raw byte arrays
//!
//! The encoding is the bytes themselves. There is no terminator, so the length must come
//! from the enclosing structure: either the rest of the buffer or an explicit length.

use std::cmp::Ordering;

use super::{ByteReader, ByteWriter, CodecError, FieldType};

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArrayType;

impl ByteArrayType {
    /// Read exactly `len` bytes
    pub fn read_with_length(
        &self,
        reader: &mut ByteReader<'_>,
        len: usize,
    ) -> Result<Vec<u8>, CodecError> {
        Ok(reader.read_bytes(len)?.to_vec())
    }

    /// Decode a buffer whose declared length is `len`
    pub fn decode_with_length(&self, bytes: &[u8], len: usize) -> Result<Vec<u8>, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = self.read_with_length(&mut reader, len)?;
        reader.finish()?;
        Ok(value)
    }
}

impl FieldType for ByteArrayType {
    type Value = Vec<u8>;

    fn name(&self) -> &str {
        "bytes"
    }

    fn write(&self, writer: &mut ByteWriter, value: &Vec<u8>) {
        writer.write_bytes(value);
    }

    /// Consumes the remainder of the input
    fn read(&self, reader: &mut ByteReader<'_>) -> Result<Vec<u8>, CodecError> {
        Ok(reader.read_remaining().to_vec())
    }

    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    fn has_prefix_0x00(&self) -> bool {
        true
    }

    fn has_prefix_0xff(&self) -> bool {
        true
    }

    fn is_self_delimiting(&self) -> bool {
        false
    }
}
