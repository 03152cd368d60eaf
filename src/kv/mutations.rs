//! A transaction's write set: range removals followed by puts
//!
//! Wire format (all lengths and counts are unsigned varints):
//!
//! ```text
//! [removal count] ([min len][min][has max: 0|1][max len][max])*
//! [put count]     ([key len][key][value len][value])*
//! ```

use std::collections::BTreeMap;

use crate::codec::{varint, ByteArrayType, ByteReader, ByteWriter, CodecError};

use super::{KeyRange, KeyRanges, KVMap};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutations {
    removes: KeyRanges,
    puts: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// What a write set says about a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState<'a> {
    Put(&'a [u8]),
    Removed,
    Untouched,
}

impl Mutations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.puts.is_empty()
    }

    pub fn removes(&self) -> &KeyRanges {
        &self.removes
    }

    pub fn puts(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.puts
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.puts.insert(key.to_vec(), value.to_vec());
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.remove_range(&KeyRange::single(key));
    }

    /// Remove a range; earlier puts inside it are discarded
    pub fn remove_range(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        self.puts.retain(|k, _| !range.contains(k));
        self.removes.add(range.clone());
    }

    pub fn state(&self, key: &[u8]) -> WriteState<'_> {
        if let Some(value) = self.puts.get(key) {
            WriteState::Put(value)
        } else if self.removes.contains(key) {
            WriteState::Removed
        } else {
            WriteState::Untouched
        }
    }

    /// True if applying these mutations could change what a reader of `reads` observed
    pub fn conflicts_with(&self, reads: &KeyRanges) -> bool {
        if reads.is_empty() {
            return false;
        }
        self.puts.keys().any(|k| reads.contains(k)) || self.removes.intersects_any(reads)
    }

    /// Every key range this write set may change
    pub fn write_ranges(&self) -> KeyRanges {
        let mut ranges = self.removes.clone();
        for key in self.puts.keys() {
            ranges.add_key(key);
        }
        ranges
    }

    pub fn apply_to(&self, map: &mut KVMap) {
        for range in self.removes.iter() {
            if range.is_full() {
                map.clear();
                continue;
            }
            let doomed: Vec<Vec<u8>> = map
                .range::<[u8], _>(range.bounds())
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                map.remove(&key);
            }
        }
        for (key, value) in &self.puts {
            map.insert(key.clone(), value.clone());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        varint::write_unsigned(&mut writer, self.removes.len() as u64);
        for range in self.removes.iter() {
            write_chunk(&mut writer, &range.min);
            match &range.max {
                Some(max) => {
                    writer.write_byte(1);
                    write_chunk(&mut writer, max);
                }
                None => writer.write_byte(0),
            }
        }
        varint::write_unsigned(&mut writer, self.puts.len() as u64);
        for (key, value) in &self.puts {
            write_chunk(&mut writer, key);
            write_chunk(&mut writer, value);
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let mut mutations = Mutations::new();

        let removes = varint::read_length(&mut reader)?;
        for _ in 0..removes {
            let min = read_chunk(&mut reader)?;
            let max = match reader.read_byte()? {
                0 => None,
                1 => Some(read_chunk(&mut reader)?),
                b => {
                    return Err(CodecError::Invalid(format!(
                        "invalid range bound flag 0x{:02x}",
                        b
                    )))
                }
            };
            mutations.removes.add(KeyRange { min, max });
        }

        let puts = varint::read_length(&mut reader)?;
        for _ in 0..puts {
            let key = read_chunk(&mut reader)?;
            let value = read_chunk(&mut reader)?;
            mutations.puts.insert(key, value);
        }

        reader.finish()?;
        Ok(mutations)
    }
}

pub(crate) fn write_chunk(writer: &mut ByteWriter, bytes: &[u8]) {
    varint::write_unsigned(writer, bytes.len() as u64);
    writer.write_bytes(bytes);
}

pub(crate) fn read_chunk(reader: &mut ByteReader<'_>) -> Result<Vec<u8>, CodecError> {
    let len = varint::read_length(reader)?;
    ByteArrayType.read_with_length(reader, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_discards_earlier_puts() {
        let mut m = Mutations::new();
        m.put(b"a1", b"x");
        m.put(b"b", b"y");
        m.remove_range(&KeyRange::prefix(b"a"));
        m.put(b"a2", b"z");

        assert_eq!(m.state(b"a1"), WriteState::Removed);
        assert_eq!(m.state(b"a2"), WriteState::Put(b"z"));
        assert_eq!(m.state(b"b"), WriteState::Put(b"y"));
        assert_eq!(m.state(b"c"), WriteState::Untouched);
    }

    #[test]
    fn test_apply_removes_before_puts() {
        let mut map = KVMap::new();
        map.insert(b"a1".to_vec(), b"old".to_vec());
        map.insert(b"a3".to_vec(), b"old".to_vec());
        map.insert(b"c".to_vec(), b"keep".to_vec());

        let mut m = Mutations::new();
        m.remove_range(&KeyRange::prefix(b"a"));
        m.put(b"a2", b"new");
        m.apply_to(&mut map);

        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec![b"a2".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_conflicts() {
        let mut m = Mutations::new();
        m.put(b"x", b"1");
        let mut reads = KeyRanges::new();
        reads.add_key(b"y");
        assert!(!m.conflicts_with(&reads));
        reads.add(KeyRange::new(b"w".to_vec(), Some(b"xa".to_vec())));
        assert!(m.conflicts_with(&reads));

        let mut wipe = Mutations::new();
        wipe.remove_range(&KeyRange::full());
        assert!(wipe.conflicts_with(&reads));
        assert!(!wipe.conflicts_with(&KeyRanges::new()));
    }

    #[test]
    fn test_encode_decode() {
        let mut m = Mutations::new();
        m.remove_range(&KeyRange::new(b"k".to_vec(), None));
        m.remove(b"\x00");
        m.put(b"a", &[0xff; 300]);
        m.put(b"", b"");
        let decoded = Mutations::decode(&m.encode()).unwrap();
        assert_eq!(decoded, m);

        let mut bytes = m.encode();
        bytes.truncate(bytes.len() - 10);
        assert!(Mutations::decode(&bytes).is_err());
    }
}
