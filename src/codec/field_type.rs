//! The `FieldType` contract and its type-erased form

use std::cmp::Ordering;

use super::{ByteReader, ByteWriter, CodecError};

/// An order-preserving encoding of values of type `Value`.
///
/// Implementations guarantee that for any `a`, `b`:
/// `compare(a, b)` agrees with the unsigned lexicographic order of `encode(a)` and
/// `encode(b)`, and `decode(encode(v)) == v`.
pub trait FieldType: Send + Sync {
    type Value;

    /// Registry name, unique per registry
    fn name(&self) -> &str;

    fn write(&self, writer: &mut ByteWriter, value: &Self::Value);

    fn read(&self, reader: &mut ByteReader<'_>) -> Result<Self::Value, CodecError>;

    /// Advance past one encoded value without materializing it
    fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        self.read(reader).map(|_| ())
    }

    fn compare(&self, a: &Self::Value, b: &Self::Value) -> Ordering;

    /// Whether some encoding may begin with `0x00`
    fn has_prefix_0x00(&self) -> bool;

    /// Whether some encoding may begin with `0xff`
    fn has_prefix_0xff(&self) -> bool;

    /// Whether the encoding carries its own length. Only self-delimiting types may
    /// appear before another component in a composite key.
    fn is_self_delimiting(&self) -> bool {
        true
    }

    fn encode(&self, value: &Self::Value) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.write(&mut writer, value);
        writer.into_bytes()
    }

    /// Decode a buffer holding exactly one value
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = self.read(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

/// Object-safe view of a [`FieldType`], used by the registry and composite keys
pub trait AnyFieldType: Send + Sync {
    fn name(&self) -> &str;
    fn has_prefix_0x00(&self) -> bool;
    fn has_prefix_0xff(&self) -> bool;
    fn is_self_delimiting(&self) -> bool;
    fn skip_value(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError>;

    /// Compare two encodings by their decoded values
    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering, CodecError>;
}

impl<F: FieldType> AnyFieldType for F {
    fn name(&self) -> &str {
        FieldType::name(self)
    }

    fn has_prefix_0x00(&self) -> bool {
        FieldType::has_prefix_0x00(self)
    }

    fn has_prefix_0xff(&self) -> bool {
        FieldType::has_prefix_0xff(self)
    }

    fn is_self_delimiting(&self) -> bool {
        FieldType::is_self_delimiting(self)
    }

    fn skip_value(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        self.skip(reader)
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering, CodecError> {
        let a = self.decode(a)?;
        let b = self.decode(b)?;
        Ok(self.compare(&a, &b))
    }
}

impl std::fmt::Debug for dyn AnyFieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldType")
            .field("name", &self.name())
            .finish()
    }
}
