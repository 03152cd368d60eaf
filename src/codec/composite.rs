//! Composite keys: concatenated component encodings
//!
//! Byte order of a composite encoding is the lexicographic order of its component tuple,
//! provided every component except the last is self-delimiting.

use std::cmp::Ordering;
use std::sync::Arc;

use super::{AnyFieldType, ByteReader, CodecError};

#[derive(Debug, Clone)]
pub struct CompositeType {
    components: Vec<Arc<dyn AnyFieldType>>,
    name: String,
}

impl CompositeType {
    /// Build a composite, rejecting non-self-delimiting components in non-final positions
    pub fn new(components: Vec<Arc<dyn AnyFieldType>>) -> Result<Self, CodecError> {
        if components.is_empty() {
            return Err(CodecError::Composition(
                "composite type needs at least one component".into(),
            ));
        }
        let last = components.len() - 1;
        for (i, component) in components.iter().enumerate() {
            if i < last && !component.is_self_delimiting() {
                return Err(CodecError::Composition(format!(
                    "component {} ({}) is not self-delimiting and must be last",
                    i,
                    component.name()
                )));
            }
        }
        let name = format!(
            "({})",
            components
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(",")
        );
        Ok(Self { components, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[Arc<dyn AnyFieldType>] {
        &self.components
    }

    /// Split an encoding into one slice per component
    pub fn split<'a>(&self, bytes: &'a [u8]) -> Result<Vec<&'a [u8]>, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let mut parts = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let start = reader.position();
            component.skip_value(&mut reader)?;
            parts.push(reader.consumed_since(start));
        }
        reader.finish()?;
        Ok(parts)
    }

    /// Concatenate already-encoded components, checking each is a single well-formed value
    pub fn join(&self, parts: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
        if parts.len() != self.components.len() {
            return Err(CodecError::Composition(format!(
                "expected {} components, got {}",
                self.components.len(),
                parts.len()
            )));
        }
        let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for (component, part) in self.components.iter().zip(parts) {
            let mut reader = ByteReader::new(part);
            component.skip_value(&mut reader)?;
            reader.finish()?;
            out.extend_from_slice(part);
        }
        Ok(out)
    }

    /// Compare two encodings component by component on decoded values
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering, CodecError> {
        let (a, b) = (self.split(a)?, self.split(b)?);
        for ((component, x), y) in self.components.iter().zip(a).zip(b) {
            match component.compare_encoded(x, y)? {
                Ordering::Equal => continue,
                other => return Ok(other),
            }
        }
        Ok(Ordering::Equal)
    }

    pub fn has_prefix_0x00(&self) -> bool {
        self.components[0].has_prefix_0x00()
    }

    pub fn has_prefix_0xff(&self) -> bool {
        self.components[0].has_prefix_0xff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteArrayType, FieldType, I32Type, StringType, VarLongType};

    fn erased<F: FieldType + 'static>(ty: F) -> Arc<dyn AnyFieldType> {
        Arc::new(ty)
    }

    fn key(ty: &CompositeType, s: &str, n: i64) -> Vec<u8> {
        let s = StringType.encode(&s.to_string());
        let n = VarLongType.encode(&n);
        ty.join(&[s.as_slice(), n.as_slice()]).unwrap()
    }

    #[test]
    fn test_tuple_order() {
        let ty = CompositeType::new(vec![erased(StringType), erased(VarLongType)]).unwrap();
        let keys = [
            key(&ty, "", 5),
            key(&ty, "a", -1000),
            key(&ty, "a", 0),
            key(&ty, "a", 1000),
            key(&ty, "a\u{0}", -5),
            key(&ty, "b", i64::MIN),
        ];
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(ty.compare(&pair[0], &pair[1]).unwrap(), Ordering::Less);
        }
        assert_eq!(ty.split(&keys[2]).unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_non_delimiting_prefix() {
        let err = CompositeType::new(vec![erased(ByteArrayType), erased(I32Type)]).unwrap_err();
        assert!(matches!(err, CodecError::Composition(_)));

        // Trailing position is fine
        let ty = CompositeType::new(vec![erased(I32Type), erased(ByteArrayType)]).unwrap();
        let mut bytes = I32Type.encode(&7);
        bytes.extend_from_slice(&[1, 2, 3]);
        let parts = ty.split(&bytes).unwrap();
        assert_eq!(parts[1], &[1, 2, 3]);
        assert_eq!(ty.name(), "(i32,bytes)");
    }

    #[test]
    fn test_join_validates_parts() {
        let ty = CompositeType::new(vec![erased(I32Type), erased(I32Type)]).unwrap();
        let short: &[u8] = &[0x80, 0, 0];
        let full: &[u8] = &[0x80, 0, 0, 0];
        assert!(ty.join(&[short, full]).is_err());
        assert!(ty.join(&[full]).is_err());
        assert_eq!(ty.join(&[full, full]).unwrap().len(), 8);
        assert!(ty.split(&[0x80, 0, 0, 0, 0x80, 0, 0, 0, 9]).is_err());
    }
}
