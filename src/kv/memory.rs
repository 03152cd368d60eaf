//! In-memory ordered key/value state with copy-on-write snapshots

use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::{varint, ByteReader, ByteWriter, CodecError};

use super::mutations::{read_chunk, write_chunk};
use super::{KVMap, KVPair, KVStore, KeyRange, Mutations};

/// Readers take an `Arc` snapshot in O(1); writers clone the map only while a snapshot
/// is still held.
#[derive(Debug, Default)]
pub struct MemoryKVStore {
    data: RwLock<Arc<KVMap>>,
}

impl MemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: KVMap) -> Self {
        Self {
            data: RwLock::new(Arc::new(map)),
        }
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> Arc<KVMap> {
        self.data.read().clone()
    }

    pub fn apply(&self, mutations: &Mutations) {
        let mut data = self.data.write();
        mutations.apply_to(Arc::make_mut(&mut data));
    }

    /// Swap in a whole new state, e.g. after installing a snapshot
    pub fn replace(&self, map: KVMap) {
        *self.data.write() = Arc::new(map);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KVStore for KVMap {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        KVMap::get(self, key).cloned()
    }

    fn get_at_least(&self, min: &[u8], max: Option<&[u8]>) -> Option<KVPair> {
        let range = KeyRange::new(min, max.map(<[u8]>::to_vec));
        if range.is_empty() {
            return None;
        }
        self.range::<[u8], _>(range.bounds())
            .next()
            .map(|(k, v)| KVPair::new(k.clone(), v.clone()))
    }

    fn get_at_most(&self, max: &[u8], min: Option<&[u8]>) -> Option<KVPair> {
        let range = KeyRange::new(min.unwrap_or_default(), Some(max.to_vec()));
        if range.is_empty() {
            return None;
        }
        self.range::<[u8], _>(range.bounds())
            .next_back()
            .map(|(k, v)| KVPair::new(k.clone(), v.clone()))
    }

    fn get_range(&self, range: &KeyRange, reverse: bool) -> Vec<KVPair> {
        if range.is_empty() {
            return Vec::new();
        }
        let iter = self
            .range::<[u8], _>(range.bounds())
            .map(|(k, v)| KVPair::new(k.clone(), v.clone()));
        if reverse {
            iter.rev().collect()
        } else {
            iter.collect()
        }
    }
}

/// Serialize a full state as `[count] ([key len][key][value len][value])*`
pub fn encode_snapshot(map: &KVMap) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(16 * map.len() + 8);
    varint::write_unsigned(&mut writer, map.len() as u64);
    for (key, value) in map {
        write_chunk(&mut writer, key);
        write_chunk(&mut writer, value);
    }
    writer.into_bytes()
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<KVMap, CodecError> {
    let mut map = KVMap::new();
    if bytes.is_empty() {
        return Ok(map);
    }
    let mut reader = ByteReader::new(bytes);
    let count = varint::read_length(&mut reader)?;
    let mut last: Option<Vec<u8>> = None;
    for _ in 0..count {
        let key = read_chunk(&mut reader)?;
        let value = read_chunk(&mut reader)?;
        if last.as_ref().is_some_and(|prev| *prev >= key) {
            return Err(CodecError::Invalid("snapshot keys out of order".into()));
        }
        last = Some(key.clone());
        map.insert(key, value);
    }
    reader.finish()?;
    Ok(map)
}
