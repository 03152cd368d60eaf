//! Timestamps as signed milliseconds since the Unix epoch
//!
//! Encoded with the signed varint, so encodings never start with `0x00` or `0xff`.
//! Sub-millisecond precision is dropped on write.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::varint;
use super::{ByteReader, ByteWriter, CodecError, FieldType};

#[derive(Debug, Clone, Copy, Default)]
pub struct DateType;

impl FieldType for DateType {
    type Value = DateTime<Utc>;

    fn name(&self) -> &str {
        "date"
    }

    fn write(&self, writer: &mut ByteWriter, value: &DateTime<Utc>) {
        varint::write_signed(writer, value.timestamp_millis());
    }

    fn read(&self, reader: &mut ByteReader<'_>) -> Result<DateTime<Utc>, CodecError> {
        let millis = varint::read_signed(reader)?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| CodecError::Invalid(format!("timestamp {}ms out of range", millis)))
    }

    fn skip(&self, reader: &mut ByteReader<'_>) -> Result<(), CodecError> {
        let len = varint::signed_length(reader.peek()?)?;
        reader.skip(len)
    }

    fn compare(&self, a: &DateTime<Utc>, b: &DateTime<Utc>) -> Ordering {
        a.cmp(b)
    }

    fn has_prefix_0x00(&self) -> bool {
        false
    }

    fn has_prefix_0xff(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_trip_millis() {
        let dates = [
            Utc.timestamp_millis_opt(-86_400_000).unwrap(),
            Utc.timestamp_millis_opt(0).unwrap(),
            Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        ];
        for d in dates {
            assert_eq!(DateType.decode(&DateType.encode(&d)).unwrap(), d);
        }
        assert!(DateType.encode(&dates[0]) < DateType.encode(&dates[1]));
        assert!(DateType.encode(&dates[1]) < DateType.encode(&dates[2]));
    }

    #[test]
    fn test_epoch_is_single_byte() {
        let epoch = Utc.timestamp_millis_opt(0).unwrap();
        assert_eq!(DateType.encode(&epoch), vec![0x7f]);
    }
}
