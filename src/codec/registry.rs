//! Name-keyed lookup of field types

use std::collections::BTreeMap;
use std::sync::Arc;

use super::nullable::DynNullableType;
use super::{
    AnyFieldType, BooleanType, ByteArrayType, CodecError, CompositeType, DateType, F32Type,
    F64Type, I16Type, I32Type, I64Type, I8Type, StringType, U16Type, U32Type, U64Type, U8Type,
    VarLongType,
};

#[derive(Debug, Clone, Default)]
pub struct FieldTypeRegistry {
    types: BTreeMap<String, Arc<dyn AnyFieldType>>,
}

impl FieldTypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in type
    pub fn with_builtins() -> Self {
        let builtins: Vec<Arc<dyn AnyFieldType>> = vec![
            Arc::new(BooleanType),
            Arc::new(I8Type),
            Arc::new(I16Type),
            Arc::new(I32Type),
            Arc::new(I64Type),
            Arc::new(U8Type),
            Arc::new(U16Type),
            Arc::new(U32Type),
            Arc::new(U64Type),
            Arc::new(F32Type),
            Arc::new(F64Type),
            Arc::new(VarLongType),
            Arc::new(DateType),
            Arc::new(StringType),
            Arc::new(ByteArrayType),
        ];
        let mut registry = Self::new();
        for ty in builtins {
            registry
                .types
                .insert(ty.name().to_string(), ty);
        }
        registry
    }

    pub fn register(&mut self, ty: Arc<dyn AnyFieldType>) -> Result<(), CodecError> {
        let name = ty.name().to_string();
        if self.types.contains_key(&name) {
            return Err(CodecError::Composition(format!(
                "field type '{}' is already registered",
                name
            )));
        }
        self.types.insert(name, ty);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnyFieldType>> {
        self.types.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    fn require(&self, name: &str) -> Result<Arc<dyn AnyFieldType>, CodecError> {
        self.get(name)
            .ok_or_else(|| CodecError::Composition(format!("unknown field type '{}'", name)))
    }

    /// Register (if needed) and return the nullable form of `name`, named `name?`
    pub fn nullable(&mut self, name: &str) -> Result<Arc<dyn AnyFieldType>, CodecError> {
        let wrapped_name = format!("{}?", name);
        if let Some(existing) = self.get(&wrapped_name) {
            return Ok(existing);
        }
        let inner = self.require(name)?;
        let ty: Arc<dyn AnyFieldType> = Arc::new(DynNullableType::new(inner));
        self.register(ty.clone())?;
        Ok(ty)
    }

    /// Build a composite key type from registered component names
    pub fn composite(&self, names: &[&str]) -> Result<CompositeType, CodecError> {
        let components = names
            .iter()
            .map(|name| self.require(name))
            .collect::<Result<Vec<_>, _>>()?;
        CompositeType::new(components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldType, NullableType};

    #[test]
    fn test_builtins_and_duplicates() {
        let mut registry = FieldTypeRegistry::with_builtins();
        assert!(registry.get("string").is_some());
        assert!(registry.get("date").is_some());
        assert!(registry.get("nope").is_none());

        let err = registry.register(Arc::new(StringType)).unwrap_err();
        assert!(matches!(err, CodecError::Composition(_)));
        assert!(registry.names().count() >= 15);
    }

    #[test]
    fn test_nullable_registration() {
        let mut registry = FieldTypeRegistry::with_builtins();
        let ty = registry.nullable("u32").unwrap();
        assert_eq!(ty.name(), "u32?");
        assert!(ty.has_prefix_0xff());
        assert!(registry.get("u32?").is_some());
        // Second request returns the same registration
        assert!(registry.nullable("u32").is_ok());

        let typed = NullableType::new(U32Type);
        let bytes = typed.encode(&Some(17));
        let mut reader = crate::codec::ByteReader::new(&bytes);
        ty.skip_value(&mut reader).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_composite_from_names() {
        let registry = FieldTypeRegistry::with_builtins();
        let ty = registry.composite(&["string", "varlong", "bytes"]).unwrap();
        assert_eq!(ty.components().len(), 3);
        assert!(registry.composite(&["bytes", "string"]).is_err());
        assert!(registry.composite(&["missing"]).is_err());
    }
}
