//! Codec properties: exact round trips and byte order matching value order

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use quorumkv::codec::{
    varint, AnyFieldType, ByteArrayType, ByteReader, ByteWriter, CodecError, CompositeType,
    DateType, F64Type, FieldType, FieldTypeRegistry, I32Type, I64Type, NullableType, StringType,
    U64Type, VarLongType,
};

fn check_order<F: FieldType>(ty: &F, a: &F::Value, b: &F::Value) {
    let (ea, eb) = (ty.encode(a), ty.encode(b));
    assert_eq!(ea.cmp(&eb), ty.compare(a, b));
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let mut w = ByteWriter::new();
    varint::write_unsigned(&mut w, value);
    w.into_bytes()
}

proptest! {
    #[test]
    fn varlong_round_trips_and_orders(a in any::<i64>(), b in any::<i64>()) {
        let ty = VarLongType;
        prop_assert_eq!(ty.decode(&ty.encode(&a)).unwrap(), a);
        check_order(&ty, &a, &b);
        let first = ty.encode(&a)[0];
        prop_assert!(first != 0x00 && first != 0xff);
    }

    #[test]
    fn fixed_ints_order_across_sign(a in any::<i64>(), b in any::<i64>(), c in any::<i32>(), d in any::<i32>()) {
        prop_assert_eq!(I64Type.decode(&I64Type.encode(&a)).unwrap(), a);
        check_order(&I64Type, &a, &b);
        check_order(&I32Type, &c, &d);
    }

    #[test]
    fn unsigned_varint_orders(a in any::<u64>(), b in any::<u64>()) {
        let (ea, eb) = (unsigned_bytes(a), unsigned_bytes(b));
        prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
        let mut reader = ByteReader::new(&ea);
        prop_assert_eq!(varint::read_unsigned(&mut reader).unwrap(), a);
        prop_assert!(reader.is_empty());
        prop_assert_eq!(varint::unsigned_length(ea[0]), ea.len());
    }

    #[test]
    fn floats_follow_total_order(a in any::<f64>(), b in any::<f64>()) {
        let decoded = F64Type.decode(&F64Type.encode(&a)).unwrap();
        prop_assert_eq!(decoded.to_bits(), a.to_bits());
        check_order(&F64Type, &a, &b);
    }

    #[test]
    fn strings_round_trip_and_order(a in ".*", b in ".*") {
        prop_assert_eq!(StringType.decode(&StringType.encode(&a)).unwrap(), a.clone());
        check_order(&StringType, &a, &b);
    }

    #[test]
    fn strings_with_nul_bytes(a in proptest::collection::vec(0u8..4, 0..12), b in proptest::collection::vec(0u8..4, 0..12)) {
        let a = String::from_utf8(a).unwrap();
        let b = String::from_utf8(b).unwrap();
        prop_assert_eq!(StringType.decode(&StringType.encode(&a)).unwrap(), a.clone());
        check_order(&StringType, &a, &b);
    }

    #[test]
    fn dates_round_trip_at_millisecond_precision(a in -10_000_000_000_000i64..10_000_000_000_000, b in -10_000_000_000_000i64..10_000_000_000_000) {
        let da = DateTime::<Utc>::from_timestamp_millis(a).unwrap();
        let db = DateTime::<Utc>::from_timestamp_millis(b).unwrap();
        prop_assert_eq!(DateType.decode(&DateType.encode(&da)).unwrap(), da);
        check_order(&DateType, &da, &db);
    }

    #[test]
    fn nullable_sorts_null_last(a in proptest::option::of(any::<u64>()), b in proptest::option::of(any::<u64>())) {
        let ty = NullableType::new(U64Type);
        prop_assert_eq!(ty.decode(&ty.encode(&a)).unwrap(), a);
        check_order(&ty, &a, &b);
    }

    #[test]
    fn composite_orders_like_tuples(a in (any::<i64>(), ".*"), b in (any::<i64>(), ".*")) {
        let components: Vec<Arc<dyn AnyFieldType>> = vec![Arc::new(VarLongType), Arc::new(StringType)];
        let key = CompositeType::new(components).unwrap();
        let join = |(n, s): &(i64, String)| {
            let n = VarLongType.encode(n);
            let s = StringType.encode(s);
            key.join(&[n.as_slice(), s.as_slice()]).unwrap()
        };
        let (ea, eb) = (join(&a), join(&b));
        let expected = a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1));
        prop_assert_eq!(ea.cmp(&eb), expected);
        prop_assert_eq!(key.compare(&ea, &eb).unwrap(), expected);
        prop_assert_eq!(key.split(&ea).unwrap().len(), 2);
    }
}

#[test]
fn test_byte_array_with_declared_length() {
    let bytes = [0x00, 0xff, 0x10];
    assert_eq!(
        ByteArrayType.decode_with_length(&bytes, 3).unwrap(),
        vec![0x00, 0xff, 0x10]
    );
    assert!(matches!(
        ByteArrayType.decode_with_length(&bytes, 5),
        Err(CodecError::Truncated {
            needed: 5,
            available: 3
        })
    ));
}

#[test]
fn test_truncated_inputs_fail_cleanly() {
    let encoded = VarLongType.encode(&1_000_000);
    assert!(encoded.len() > 1);
    assert!(matches!(
        VarLongType.decode(&encoded[..encoded.len() - 1]),
        Err(CodecError::Truncated { .. })
    ));
    assert!(matches!(
        I64Type.decode(&[0x80, 0x00]),
        Err(CodecError::Truncated { .. })
    ));
    // string without its terminator
    assert!(StringType.decode(b"abc").is_err());
    assert!(matches!(
        I32Type.decode(&[0x80, 0, 0, 1, 9]),
        Err(CodecError::TrailingBytes(1))
    ));
}

#[test]
fn test_registry_composition_guards() {
    let mut registry = FieldTypeRegistry::with_builtins();
    assert!(registry.get("varlong").is_some());
    assert!(registry.composite(&["string", "i64"]).is_ok());
    // a raw byte array can only end a composite key
    assert!(matches!(
        registry.composite(&["bytes", "i64"]),
        Err(CodecError::Composition(_))
    ));
    assert!(registry.composite(&["i64", "bytes"]).is_ok());
    assert!(registry.nullable("u32").is_ok());
    assert!(registry.register(Arc::new(StringType)).is_err());
}

#[test]
fn test_fixed_width_ints_sort_negative_first() {
    let values = [i64::MIN, -1, 0, 1, i64::MAX];
    let encoded: Vec<Vec<u8>> = values.iter().map(|v| I64Type.encode(v)).collect();
    for pair in encoded.windows(2) {
        assert_eq!(pair[0].cmp(&pair[1]), Ordering::Less);
    }
    assert_eq!(I64Type.encode(&0), vec![0x80, 0, 0, 0, 0, 0, 0, 0]);
}
