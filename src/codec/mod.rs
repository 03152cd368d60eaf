//! Order-preserving binary encodings for keys and values
//!
//! Every [`FieldType`] maps values to bytes such that unsigned lexicographic comparison
//! of the encodings agrees with the type's natural ordering. Self-delimiting types can
//! be concatenated into [`CompositeType`] keys whose byte order is the tuple order.

mod buffer;
mod composite;
mod date;
mod field_type;
mod nullable;
mod primitive;
mod registry;
mod string;
pub mod varint;

mod array;

use thiserror::Error;

pub use array::ByteArrayType;
pub use buffer::{ByteReader, ByteWriter};
pub use composite::CompositeType;
pub use date::DateType;
pub use field_type::{AnyFieldType, FieldType};
pub use nullable::NullableType;
pub use primitive::{
    BooleanType, F32Type, F64Type, I16Type, I32Type, I64Type, I8Type, U16Type, U32Type,
    U64Type, U8Type, VarLongType,
};
pub use registry::FieldTypeRegistry;
pub use string::StringType;

/// Decoding and composition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid encoding: {0}")]
    Invalid(String),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("invalid type composition: {0}")]
    Composition(String),
}
