//! Sorted, merged lists of inclusive address ranges
//!
//! Addresses are stored as `u128` values (see `net::ip_to_int`). A list
//! never holds overlapping or adjacent ranges, so lookups are a binary search.

/// Sorted list of disjoint, non-adjacent inclusive ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRangeList {
    ranges: Vec<(u128, u128)>,
}

impl IpRangeList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// List holding a single range; empty when `start > end`.
    pub fn from_range(start: u128, end: u128) -> Self {
        let mut list = Self::new();
        list.insert(start, end);
        list
    }

    /// Index of the range containing `value`, if any.
    fn find(&self, value: u128) -> Option<usize> {
        let idx = self.ranges.partition_point(|&(_, end)| end < value);
        (idx < self.ranges.len() && self.ranges[idx].0 <= value).then_some(idx)
    }

    /// Whether `value` is inside any range.
    pub fn contains(&self, value: u128) -> bool {
        self.find(value).is_some()
    }

    /// Adds `[start, end]`, merging with overlapping and adjacent ranges.
    pub fn insert(&mut self, start: u128, end: u128) {
        if start > end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        // First range that could touch the new one
        let lo = self
            .ranges
            .partition_point(|&(_, e)| e.saturating_add(1) < start);
        let mut hi = lo;
        while hi < self.ranges.len() && self.ranges[hi].0 <= end.saturating_add(1) {
            new_start = new_start.min(self.ranges[hi].0);
            new_end = new_end.max(self.ranges[hi].1);
            hi += 1;
        }
        self.ranges.splice(lo..hi, [(new_start, new_end)]);
    }

    /// Removes `[start, end]`, splitting ranges that straddle it.
    pub fn remove(&mut self, start: u128, end: u128) {
        if start > end {
            return;
        }
        let lo = self.ranges.partition_point(|&(_, e)| e < start);
        let mut hi = lo;
        let mut keep = Vec::with_capacity(2);
        while hi < self.ranges.len() && self.ranges[hi].0 <= end {
            let (s, e) = self.ranges[hi];
            if s < start {
                keep.push((s, start - 1));
            }
            if e > end {
                keep.push((end + 1, e));
            }
            hi += 1;
        }
        self.ranges.splice(lo..hi, keep);
    }

    /// Removes a single value; returns whether it was present.
    pub fn remove_one(&mut self, value: u128) -> bool {
        if self.contains(value) {
            self.remove(value, value);
            true
        } else {
            false
        }
    }

    /// Lowest value in the list.
    pub fn first(&self) -> Option<u128> {
        self.ranges.first().map(|&(start, _)| start)
    }

    /// Total number of values covered, saturating at `u128::MAX`.
    pub fn count(&self) -> u128 {
        self.ranges
            .iter()
            .map(|&(s, e)| (e - s).saturating_add(1))
            .fold(0u128, u128::saturating_add)
    }

    /// Whether the list covers nothing.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates the ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u128, u128)> + '_ {
        self.ranges.iter().copied()
    }
}
