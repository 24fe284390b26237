//! Static partitioning of the search space for pipe mode.

use std::fmt;
use std::ops::RangeInclusive;

/// Inclusive bounds of a unit of work. `1 <= start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    start: u32,
    end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("invalid range {start}..={end}: bounds must satisfy 1 <= start <= end")]
    InvalidRange { start: u32, end: u32 },
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("cannot split {limit} integers across {nprocs} workers")]
    TooManyWorkers { limit: u32, nprocs: u32 },
}

impl WorkRange {
    pub fn new(start: u32, end: u32) -> Result<Self, PartitionError> {
        if start == 0 || end < start {
            return Err(PartitionError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of integers in the range.
    pub fn count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn iter(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }
}

impl fmt::Display for WorkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Split `[1, limit]` into `nprocs` contiguous ranges.
///
/// The remainder of an inexact division goes to the first range.
pub fn partition(limit: u32, nprocs: u32) -> Result<Vec<WorkRange>, PartitionError> {
    if nprocs == 0 {
        return Err(PartitionError::NoWorkers);
    }
    if limit < nprocs {
        return Err(PartitionError::TooManyWorkers { limit, nprocs });
    }

    let per_worker = limit / nprocs;
    let remainder = limit % nprocs;

    let mut ranges = Vec::with_capacity(nprocs as usize);
    let mut end = 0;
    for i in 0..nprocs {
        let start = end + 1;
        end = if i == 0 {
            per_worker + remainder
        } else {
            start + per_worker - 1
        };
        ranges.push(WorkRange::new(start, end)?);
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(ranges: &[WorkRange], limit: u32) {
        assert_eq!(ranges.first().map(WorkRange::start), Some(1));
        assert_eq!(ranges.last().map(WorkRange::end), Some(limit));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end() + 1, pair[1].start());
        }
        assert_eq!(ranges.iter().map(WorkRange::count).sum::<u32>(), limit);
    }

    #[test]
    fn remainder_goes_to_first_range() {
        let ranges = partition(100, 3).unwrap();
        let sizes: Vec<u32> = ranges.iter().map(WorkRange::count).collect();
        assert_eq!(sizes, vec![34, 33, 33]);
        assert_eq!(ranges[0], WorkRange::new(1, 34).unwrap());
        assert_eq!(ranges[1], WorkRange::new(35, 67).unwrap());
        assert_eq!(ranges[2], WorkRange::new(68, 100).unwrap());
        assert_covers(&ranges, 100);
    }

    #[test]
    fn exact_division() {
        let ranges = partition(12, 4).unwrap();
        assert!(ranges.iter().all(|r| r.count() == 3));
        assert_covers(&ranges, 12);
    }

    #[test]
    fn single_worker_takes_everything() {
        let ranges = partition(8128, 1).unwrap();
        assert_eq!(ranges, vec![WorkRange::new(1, 8128).unwrap()]);
    }

    #[test]
    fn large_remainder() {
        let ranges = partition(10, 6).unwrap();
        let sizes: Vec<u32> = ranges.iter().map(WorkRange::count).collect();
        assert_eq!(sizes, vec![5, 1, 1, 1, 1, 1]);
        assert_covers(&ranges, 10);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert_eq!(partition(10, 0), Err(PartitionError::NoWorkers));
        assert_eq!(
            partition(2, 3),
            Err(PartitionError::TooManyWorkers { limit: 2, nprocs: 3 })
        );
        assert!(WorkRange::new(0, 5).is_err());
        assert!(WorkRange::new(9, 5).is_err());
    }
}
