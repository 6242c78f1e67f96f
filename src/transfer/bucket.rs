//! Bucket boundary arithmetic.
//!
//! Every place that needs to know where a bucket starts or ends (the receive
//! accumulators, the hash request, the flush request, the tree request) goes
//! through [`SegmentRange`] so they cannot disagree.

use crate::protocol::{BUCKET_SHIFT, BUCKET_SIZE};
use serde::Serialize;

/// Bucket number of the bucket containing the last byte before `end`.
pub fn last_bucket_number(end: u64) -> u64 {
    let n = end >> BUCKET_SHIFT;
    if end % BUCKET_SIZE == 0 {
        n.saturating_sub(1)
    } else {
        n
    }
}

/// Length of the final bucket of a range of `length` bytes.
pub fn last_bucket_size(length: u64) -> u64 {
    match length % BUCKET_SIZE {
        0 => BUCKET_SIZE,
        rem => rem,
    }
}

pub fn bucket_number_of(offset: u64) -> u64 {
    offset >> BUCKET_SHIFT
}

/// A half-open byte range `[start, end)` with its derived bucket parameters.
///
/// Setting either end recomputes everything; an end before the start clamps
/// to an empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SegmentRange {
    start: u64,
    end: u64,
    length: u64,
    last_bucket_number: u64,
    last_bucket_size: u64,
}

impl SegmentRange {
    pub fn new(start: u64, end: u64) -> Self {
        let mut range = Self::default();
        range.set_start(start);
        range.set_end(end);
        range
    }

    /// The whole file as one range.
    pub fn file(size: u64) -> Self {
        Self::new(0, size)
    }

    pub fn set_start(&mut self, start: u64) {
        self.start = start;
        self.length = self.end.saturating_sub(self.start);
        self.recalculate();
    }

    pub fn set_end(&mut self, end: u64) {
        if end > self.start {
            self.end = end;
            self.length = end - self.start;
        } else {
            self.end = self.start;
            self.length = 0;
        }
        self.recalculate();
    }

    fn recalculate(&mut self) {
        self.last_bucket_number = last_bucket_number(self.end);
        self.last_bucket_size = last_bucket_size(self.length);
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn first_bucket_number(&self) -> u64 {
        bucket_number_of(self.start)
    }

    pub fn last_bucket_number(&self) -> u64 {
        self.last_bucket_number
    }

    pub fn last_bucket_size(&self) -> u64 {
        self.last_bucket_size
    }

    pub fn bucket_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.last_bucket_number - self.first_bucket_number() + 1
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Byte bounds of `bucket` within this range. Assumes a bucket-aligned
    /// start, which every download range has.
    pub fn bucket_bounds(&self, bucket: u64) -> Option<(u64, u64)> {
        if self.is_empty()
            || bucket < self.first_bucket_number()
            || bucket > self.last_bucket_number
        {
            return None;
        }
        let start = bucket << BUCKET_SHIFT;
        let len = if bucket == self.last_bucket_number {
            self.last_bucket_size
        } else {
            BUCKET_SIZE
        };
        Some((start, start + len))
    }

    pub fn bucket_len(&self, bucket: u64) -> Option<u64> {
        self.bucket_bounds(bucket).map(|(s, e)| e - s)
    }

    pub fn buckets(&self) -> impl Iterator<Item = u64> {
        let first = self.first_bucket_number();
        let count = self.bucket_count();
        first..first + count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = BUCKET_SIZE;

    #[test]
    fn boundary_end_belongs_to_previous_bucket() {
        assert_eq!(last_bucket_number(3 * MB), 2);
        assert_eq!(last_bucket_number(3 * MB + 1), 3);
        assert_eq!(last_bucket_number(0), 0);
        assert_eq!(last_bucket_size(0), MB);
        assert_eq!(last_bucket_size(MB + 10), 10);
    }

    #[test]
    fn start_and_end_order_does_not_matter() {
        let mut a = SegmentRange::default();
        a.set_start(2 * MB);
        a.set_end(5 * MB + 7);

        let mut b = SegmentRange::default();
        b.set_end(5 * MB + 7);
        b.set_start(2 * MB);

        assert_eq!(a, b);
        assert_eq!(a.len(), 3 * MB + 7);
        assert_eq!(a.last_bucket_number(), 5);
        assert_eq!(a.last_bucket_size(), 7);
        assert_eq!(a.bucket_count(), 4);
    }

    #[test]
    fn end_before_start_is_empty_not_negative() {
        let mut r = SegmentRange::default();
        r.set_start(10 * MB);
        r.set_end(4 * MB);
        assert!(r.is_empty());
        assert_eq!(r.end(), 10 * MB);
        assert_eq!(r.bucket_count(), 0);
        assert_eq!(r.buckets().count(), 0);
        assert_eq!(r.bucket_bounds(9), None);
    }

    #[test]
    fn last_bucket_params_hold_for_many_ranges() {
        let ends = [1, 1000, MB - 1, MB, MB + 1, 7 * MB, 7 * MB + 513, 100 * MB - 3];
        for start_bucket in 0..4u64 {
            let start = start_bucket * MB;
            for &end in &ends {
                let r = SegmentRange::new(start, end);
                assert!(r.last_bucket_number() * MB <= r.end());
                if !r.is_empty() {
                    assert_eq!(
                        r.last_bucket_size(),
                        r.end() - r.last_bucket_number() * MB,
                        "start={start} end={end}"
                    );
                }
                if start == 0 {
                    assert_eq!(
                        r.last_bucket_size(),
                        r.end() - r.start() - r.last_bucket_number() * MB
                    );
                }
            }
        }
    }

    #[test]
    fn bucket_bounds_tile_the_range() {
        let r = SegmentRange::new(MB, 4 * MB + 100);
        let bounds: Vec<_> = r.buckets().filter_map(|b| r.bucket_bounds(b)).collect();
        assert_eq!(
            bounds,
            vec![(MB, 2 * MB), (2 * MB, 3 * MB), (3 * MB, 4 * MB), (4 * MB, 4 * MB + 100)]
        );
        assert_eq!(r.bucket_len(4), Some(100));
        assert_eq!(r.bucket_bounds(0), None);
    }
}
