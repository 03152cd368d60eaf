//! Nullable wrapper: `null` sorts after every non-null value
//!
//! `null` encodes as `0xff`. When the inner type can itself start with `0xff`, non-null
//! encodings are prefixed with `0x01` so the two cases stay distinguishable and ordered.

use std::cmp::Ordering;
use std::sync::Arc;

use super::{AnyFieldType, ByteReader, ByteWriter, CodecError, FieldType};

const NULL: u8 = 0xff;
const NOT_NULL: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct NullableType<F> {
    inner: F,
    name: String,
}

impl<F: FieldType> NullableType<F> {
    pub fn new(inner: F) -> Self {
        let name = format!("{}?", FieldType::name(&inner));
        Self { inner, name }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn escaped(&self) -> bool {
        FieldType::has_prefix_0xff(&self.inner)
    }

    /// Returns true if the next value is null (and consumes it), otherwise consumes the escape
    fn read_marker(&self, reader: &mut ByteReader<'_>) -> Result<bool, CodecError> {
        read_marker(reader, self.escaped())
    }
}

fn read_marker(reader: &mut ByteReader<'_>, escaped: bool) -> Result<bool, CodecError> {
    if reader.peek()? == NULL {
        reader.read_byte()?;
        return Ok(true);
    }
    if escaped {
        let marker = reader.read_byte()?;
        if marker != NOT_NULL {
            return Err(CodecError::Invalid(format!(
                "expected non-null marker 0x01, found 0x{:02x}",
                marker
            )));
        }
    }
    Ok(false)
}

impl<F: FieldType> FieldType for NullableType<F> {
    type Value = Option<F::Value>;

    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, writer: &mut ByteWriter, value: &Option<F::Value>) {
        match value {
            None => writer.write_byte(NULL),
            Some(v) => {
                if self.escaped() {
                    writer.write_byte(NOT_NULL);
                }
                self.inner.write(writer, v);
            }
        }
    }

    fn read(&self, reader: &mut ByteReader<'_>) -> Result<Option<F::Value>, CodecError> {
        if self.read_marker(reader)? {
            return Ok(None);
        }
        self.inner.read(reader).map(Some)
    }

    fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        if self.read_marker(reader)? {
            return Ok(());
        }
        self.inner.skip(reader)
    }

    fn compare(&self, a: &Option<F::Value>, b: &Option<F::Value>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => self.inner.compare(a, b),
        }
    }

    fn has_prefix_0x00(&self) -> bool {
        !self.escaped() && FieldType::has_prefix_0x00(&self.inner)
    }

    fn has_prefix_0xff(&self) -> bool {
        true
    }

    fn is_self_delimiting(&self) -> bool {
        FieldType::is_self_delimiting(&self.inner)
    }
}

/// Nullable wrapper over a registry entry whose concrete type is not known statically
pub(crate) struct DynNullableType {
    inner: Arc<dyn AnyFieldType>,
    name: String,
}

impl DynNullableType {
    pub(crate) fn new(inner: Arc<dyn AnyFieldType>) -> Self {
        let name = format!("{}?", inner.name());
        Self { inner, name }
    }

    /// Split an encoding into `None` for null, or the inner encoding
    fn strip<'a>(&self, bytes: &'a [u8]) -> Result<Option<&'a [u8]>, CodecError> {
        let mut reader = ByteReader::new(bytes);
        if read_marker(&mut reader, self.inner.has_prefix_0xff())? {
            reader.finish()?;
            return Ok(None);
        }
        Ok(Some(reader.read_remaining()))
    }
}

impl AnyFieldType for DynNullableType {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_prefix_0x00(&self) -> bool {
        !self.inner.has_prefix_0xff() && self.inner.has_prefix_0x00()
    }

    fn has_prefix_0xff(&self) -> bool {
        true
    }

    fn is_self_delimiting(&self) -> bool {
        self.inner.is_self_delimiting()
    }

    fn skip_value(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        if read_marker(reader, self.inner.has_prefix_0xff())? {
            return Ok(());
        }
        self.inner.skip_value(reader)
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering, CodecError> {
        match (self.strip(a)?, self.strip(b)?) {
            (None, None) => Ok(Ordering::Equal),
            (None, Some(_)) => Ok(Ordering::Greater),
            (Some(_), None) => Ok(Ordering::Less),
            (Some(a), Some(b)) => self.inner.compare_encoded(a, b),
        }
    }
}
