//! Transaction-local view: a base snapshot overlaid with buffered writes, plus read tracking

use std::sync::Arc;

use crate::common::{Error, Result};

use super::{key_after, KVMap, KVPair, KeyRange, KeyRanges, Mutations, WriteState};

#[derive(Debug)]
pub struct TransactionView {
    base: Arc<KVMap>,
    writes: Mutations,
    reads: KeyRanges,
    read_only: bool,
    closed: bool,
}

impl TransactionView {
    pub fn new(base: Arc<KVMap>) -> Self {
        Self {
            base,
            writes: Mutations::new(),
            reads: KeyRanges::new(),
            read_only: false,
            closed: false,
        }
    }

    /// A view that refuses writes
    pub fn read_only(base: Arc<KVMap>) -> Self {
        Self {
            read_only: true,
            ..Self::new(base)
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn reads(&self) -> &KeyRanges {
        &self.reads
    }

    pub fn writes(&self) -> &Mutations {
        &self.writes
    }

    /// Take the read and write sets, closing the view
    pub fn take(&mut self) -> (KeyRanges, Mutations) {
        self.closed = true;
        (
            std::mem::take(&mut self.reads),
            std::mem::take(&mut self.writes),
        )
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::TransactionClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.reads.add_key(key);
        Ok(match self.writes.state(key) {
            WriteState::Put(value) => Some(value.to_vec()),
            WriteState::Removed => None,
            WriteState::Untouched => self.base.get(key).cloned(),
        })
    }

    pub fn get_at_least(&mut self, min: &[u8], max: Option<&[u8]>) -> Result<Option<KVPair>> {
        self.check_open()?;
        let found = self.first_at_least(min, max);
        let end = match &found {
            Some(pair) => Some(key_after(&pair.key)),
            None => max.map(<[u8]>::to_vec),
        };
        self.reads.add(KeyRange::new(min, end));
        Ok(found)
    }

    pub fn get_at_most(&mut self, max: &[u8], min: Option<&[u8]>) -> Result<Option<KVPair>> {
        self.check_open()?;
        let found = self.last_at_most(max, min);
        let start = match &found {
            Some(pair) => pair.key.clone(),
            None => min.unwrap_or_default().to_vec(),
        };
        self.reads.add(KeyRange::new(start, Some(max.to_vec())));
        Ok(found)
    }

    pub fn get_range(&mut self, range: &KeyRange, reverse: bool) -> Result<Vec<KVPair>> {
        self.check_open()?;
        self.reads.add(range.clone());
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let mut merged: KVMap = self
            .base
            .range::<[u8], _>(range.bounds())
            .filter(|(k, _)| !self.writes.removes().contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in self.writes.puts().range::<[u8], _>(range.bounds()) {
            merged.insert(k.clone(), v.clone());
        }
        let pairs = merged.into_iter().map(|(k, v)| KVPair::new(k, v));
        Ok(if reverse {
            pairs.rev().collect()
        } else {
            pairs.collect()
        })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.writes.put(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.writes.remove(key);
        Ok(())
    }

    pub fn remove_range(&mut self, range: &KeyRange) -> Result<()> {
        self.check_writable()?;
        self.writes.remove_range(range);
        Ok(())
    }

    fn first_at_least(&self, min: &[u8], max: Option<&[u8]>) -> Option<KVPair> {
        let range = KeyRange::new(min, max.map(<[u8]>::to_vec));
        if range.is_empty() {
            return None;
        }
        let from_base = self.first_visible_base(min, max);
        let from_puts = self
            .writes
            .puts()
            .range::<[u8], _>(range.bounds())
            .next()
            .map(|(k, v)| KVPair::new(k.clone(), v.clone()));
        match (from_base, from_puts) {
            (Some(base), Some(put)) if base.key < put.key => Some(base),
            (_, Some(put)) => Some(put),
            (base, None) => base,
        }
    }

    fn last_at_most(&self, max: &[u8], min: Option<&[u8]>) -> Option<KVPair> {
        let range = KeyRange::new(min.unwrap_or_default(), Some(max.to_vec()));
        if range.is_empty() {
            return None;
        }
        let from_base = self.last_visible_base(max, min.unwrap_or_default());
        let from_puts = self
            .writes
            .puts()
            .range::<[u8], _>(range.bounds())
            .next_back()
            .map(|(k, v)| KVPair::new(k.clone(), v.clone()));
        match (from_base, from_puts) {
            (Some(base), Some(put)) if base.key > put.key => Some(base),
            (_, Some(put)) => Some(put),
            (base, None) => base,
        }
    }

    /// First base entry in `[min, max)` not hidden by a buffered removal, jumping over
    /// whole removed ranges
    fn first_visible_base(&self, min: &[u8], max: Option<&[u8]>) -> Option<KVPair> {
        let mut cursor = min.to_vec();
        loop {
            let range = KeyRange::new(cursor, max.map(<[u8]>::to_vec));
            if range.is_empty() {
                return None;
            }
            let (key, value) = self.base.range::<[u8], _>(range.bounds()).next()?;
            match self.writes.removes().containing(key) {
                None => return Some(KVPair::new(key.clone(), value.clone())),
                Some(removed) => match &removed.max {
                    Some(end) => cursor = end.clone(),
                    None => return None,
                },
            }
        }
    }

    fn last_visible_base(&self, max: &[u8], min: &[u8]) -> Option<KVPair> {
        let mut cursor = max.to_vec();
        loop {
            let range = KeyRange::new(min, Some(cursor));
            if range.is_empty() {
                return None;
            }
            let (key, value) = self.base.range::<[u8], _>(range.bounds()).next_back()?;
            match self.writes.removes().containing(key) {
                None => return Some(KVPair::new(key.clone(), value.clone())),
                Some(removed) => cursor = removed.min.clone(),
            }
        }
    }
}
