//! Inclusive instruction index ranges

use std::cmp::Ordering;
use std::fmt;

/// Inclusive range `[start, end]` of instruction indices
///
/// Ordering treats overlapping ranges as equal: a range is less than another
/// when it ends before the other starts. Inside a `BTreeSet` of disjoint
/// ranges, looking up `IndexRange::point(i)` finds the range containing `i`.
/// A range with `start > end` is empty.
#[derive(Debug, Clone, Copy, Hash)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub fn new(start: usize, end: usize) -> Self {
        IndexRange { start, end }
    }

    /// The single-index range `[index, index]`
    pub fn point(index: usize) -> Self {
        IndexRange { start: index, end: index }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Number of indices covered
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    /// Whether `target` is a legal branch destination from inside the range:
    /// an index in the range or the one right after it
    pub fn admits_target(&self, target: usize) -> bool {
        self.start <= target && target <= self.end + 1
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }

    /// Exact equality of bounds (the `Eq` impl means "overlaps")
    pub fn same_bounds(&self, other: &IndexRange) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl PartialEq for IndexRange {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexRange {}

impl PartialOrd for IndexRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexRange {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.end < other.start {
            Ordering::Less
        } else if other.end < self.start {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
