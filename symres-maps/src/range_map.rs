use std::ops::Range;
use std::slice;

/// A map of disjoint address ranges with attached entries.
///
/// Ranges are half-open (`start..end`) and must not intersect each other.
/// Point lookups return the unique range containing an address, or via
/// [`get_nearest`](RangeMap::get_nearest) the range with the greatest start at
/// or below an address even if the address lies outside of it. The latter is
/// what allows a resolver to tell whether a public symbol is shadowed by a
/// function ending below the queried address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeMap<A, E> {
    /// Entries sorted by `range.end`. Since ranges are disjoint, they are
    /// sorted by `range.start` as well.
    inner: Vec<(Range<A>, E)>,
}

impl<A: Ord + Copy, E> RangeMap<A, E> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a range into the map.
    ///
    /// The range must be non-empty and disjoint from all ranges that are
    /// already present. Returns `true` if the insertion was successful.
    pub fn insert(&mut self, range: Range<A>, entry: E) -> bool {
        if range.start >= range.end {
            return false;
        }

        if let Some(index) = self.free_slot(&range) {
            self.inner.insert(index, (range, entry));
            true
        } else {
            false
        }
    }

    /// Returns the position at which the given range can be inserted without
    /// intersecting an existing range, if there is one.
    fn free_slot(&self, range: &Range<A>) -> Option<usize> {
        let index = match self.inner.binary_search_by_key(&range.end, |e| e.0.end) {
            Ok(_) => return None,
            Err(index) => index,
        };

        if index > 0 {
            let before = &self.inner[index - 1];
            if before.0.end > range.start {
                return None;
            }
        }

        match self.inner.get(index) {
            Some(after) if after.0.start < range.end => None,
            _ => Some(index),
        }
    }

    /// Retrieves the range covering the given address and its entry.
    pub fn get(&self, address: A) -> Option<&(Range<A>, E)> {
        let entry = match self.inner.binary_search_by_key(&address, |e| e.0.end) {
            // inner[index].end == address, so the next range is the only one
            // that can still contain the address.
            Ok(index) => self.inner.get(index + 1)?,
            // inner[index].end > address, so this could be the one.
            Err(index) => self.inner.get(index)?,
        };

        (entry.0.start <= address).then_some(entry)
    }

    /// Retrieves the range with the greatest start at or below the given
    /// address, regardless of whether the address lies within it.
    pub fn get_nearest(&self, address: A) -> Option<&(Range<A>, E)> {
        match self.inner.binary_search_by_key(&address, |e| e.0.start) {
            Ok(index) => self.inner.get(index),
            Err(index) => self.inner.get(index.checked_sub(1)?),
        }
    }

    /// Returns an iterator over all entries, ordered by range.
    pub fn iter(&self) -> slice::Iter<'_, (Range<A>, E)> {
        self.inner.iter()
    }

    /// Returns the number of stored ranges.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the map contains no ranges.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<A, E> Default for RangeMap<A, E> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<'a, A: Ord + Copy, E> IntoIterator for &'a RangeMap<A, E> {
    type Item = &'a (Range<A>, E);
    type IntoIter = slice::Iter<'a, (Range<A>, E)>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
