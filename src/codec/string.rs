//! Null-terminated UTF-8 strings
//!
//! `0x00` and `0x01` inside the string are escaped as `0x01 0x01` and `0x01 0x02`, so the
//! terminator is the only unescaped `0x00` and shorter strings sort before their extensions.

use std::cmp::Ordering;

use super::{ByteReader, ByteWriter, CodecError, FieldType};

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;
const ESCAPED_TERMINATOR: u8 = 0x01;
const ESCAPED_ESCAPE: u8 = 0x02;

#[derive(Debug, Clone, Copy, Default)]
pub struct StringType;

impl StringType {
    /// Unescape into a byte buffer, stopping after the terminator
    fn read_raw(
        reader: &mut ByteReader<'_>,
        mut out: Option<&mut Vec<u8>>,
    ) -> Result<(), CodecError> {
        loop {
            let b = reader.read_byte()?;
            let decoded = match b {
                TERMINATOR => return Ok(()),
                ESCAPE => match reader.read_byte()? {
                    ESCAPED_TERMINATOR => TERMINATOR,
                    ESCAPED_ESCAPE => ESCAPE,
                    other => {
                        return Err(CodecError::Invalid(format!(
                            "invalid string escape 0x01 0x{:02x}",
                            other
                        )))
                    }
                },
                b => b,
            };
            if let Some(buf) = out.as_deref_mut() {
                buf.push(decoded);
            }
        }
    }
}

impl FieldType for StringType {
    type Value = String;

    fn name(&self) -> &str {
        "string"
    }

    fn write(&self, writer: &mut ByteWriter, value: &String) {
        for &b in value.as_bytes() {
            match b {
                TERMINATOR => writer.write_bytes(&[ESCAPE, ESCAPED_TERMINATOR]),
                ESCAPE => writer.write_bytes(&[ESCAPE, ESCAPED_ESCAPE]),
                b => writer.write_byte(b),
            }
        }
        writer.write_byte(TERMINATOR);
    }

    fn read(&self, reader: &mut ByteReader<'_>) -> Result<String, CodecError> {
        let mut buf = Vec::new();
        Self::read_raw(reader, Some(&mut buf))?;
        String::from_utf8(buf).map_err(|e| CodecError::Invalid(format!("invalid UTF-8: {}", e)))
    }

    fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        Self::read_raw(reader, None)
    }

    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    fn has_prefix_0x00(&self) -> bool {
        true
    }

    fn has_prefix_0xff(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping() {
        let s = "a\u{0}b\u{1}".to_string();
        assert_eq!(
            StringType.encode(&s),
            vec![b'a', 0x01, 0x01, b'b', 0x01, 0x02, 0x00]
        );
        assert_eq!(StringType.decode(&StringType.encode(&s)).unwrap(), s);
        assert_eq!(StringType.encode(&String::new()), vec![0x00]);
    }

    #[test]
    fn test_order_with_control_chars() {
        let mut values: Vec<String> = ["", "a", "a\u{0}", "a\u{1}", "a\u{2}", "ab", "b", "é"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        values.sort();
        for pair in values.windows(2) {
            assert!(StringType.encode(&pair[0]) < StringType.encode(&pair[1]));
        }
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            StringType.decode(b"abc"),
            Err(CodecError::Truncated { .. })
        ));
        assert!(StringType.decode(&[0x01, 0x07, 0x00]).is_err());
        assert!(StringType.decode(&[0xc3, 0x00]).is_err());
    }
}
