//! Half-open key ranges and sorted sets of them

use std::ops::Bound;

use serde::{Deserialize, Serialize};

/// The smallest key strictly greater than `key`
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0x00);
    next
}

/// The smallest key that does not start with `prefix`, or `None` if there is none
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// `[min, max)`. An empty `min` is unbounded below, `max == None` is unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: Vec<u8>,
    pub max: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(min: impl Into<Vec<u8>>, max: Option<Vec<u8>>) -> Self {
        Self {
            min: min.into(),
            max,
        }
    }

    /// Every key
    pub fn full() -> Self {
        Self::new(Vec::new(), None)
    }

    /// Exactly one key
    pub fn single(key: &[u8]) -> Self {
        Self::new(key, Some(key_after(key)))
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: &[u8]) -> Self {
        Self::new(prefix, prefix_end(prefix))
    }

    pub fn is_full(&self) -> bool {
        self.min.is_empty() && self.max.is_none()
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.max, Some(max) if *max <= self.min)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.min.as_slice() && self.below_max(key)
    }

    fn below_max(&self, key: &[u8]) -> bool {
        match &self.max {
            Some(max) => key < max.as_slice(),
            None => true,
        }
    }

    /// True if some key lies in both ranges
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.below_max(&other.min)
            && other.below_max(&self.min)
    }

    /// True if the ranges overlap or abut, so their union is a single range
    fn touches(&self, other: &KeyRange) -> bool {
        let at_or_before = |a: &KeyRange, b: &KeyRange| match &a.max {
            Some(max) => b.min <= *max,
            None => true,
        };
        at_or_before(self, other) && at_or_before(other, self)
    }

    fn union(&self, other: &KeyRange) -> KeyRange {
        let min = self.min.clone().min(other.min.clone());
        let max = match (&self.max, &other.max) {
            (Some(a), Some(b)) => Some(a.clone().max(b.clone())),
            _ => None,
        };
        KeyRange { min, max }
    }

    /// Bounds suitable for `BTreeMap::range`
    pub fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let upper = match &self.max {
            Some(max) => Bound::Excluded(max.as_slice()),
            None => Bound::Unbounded,
        };
        (Bound::Included(self.min.as_slice()), upper)
    }
}

/// A sorted set of disjoint, non-adjacent key ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRanges {
    ranges: Vec<KeyRange>,
}

impl KeyRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            ranges: vec![KeyRange::full()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    /// Add a range, merging it with any range it overlaps or abuts
    pub fn add(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.touches(&merged) {
                merged = merged.union(&existing);
            } else {
                kept.push(existing);
            }
        }
        let pos = kept.partition_point(|r| r.min < merged.min);
        kept.insert(pos, merged);
        self.ranges = kept;
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.add(KeyRange::single(key));
    }

    pub fn add_all(&mut self, other: &KeyRanges) {
        for range in &other.ranges {
            self.add(range.clone());
        }
    }

    /// The range containing `key`, if any
    pub fn containing(&self, key: &[u8]) -> Option<&KeyRange> {
        let pos = self.ranges.partition_point(|r| r.min.as_slice() <= key);
        pos.checked_sub(1)
            .map(|i| &self.ranges[i])
            .filter(|r| r.contains(key))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.containing(key).is_some()
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    pub fn intersects_any(&self, other: &KeyRanges) -> bool {
        other.ranges.iter().any(|r| self.intersects(r))
    }
}

impl FromIterator<KeyRange> for KeyRanges {
    fn from_iter<I: IntoIterator<Item = KeyRange>>(iter: I) -> Self {
        let mut ranges = KeyRanges::new();
        for range in iter {
            ranges.add(range);
        }
        ranges
    }
}
