//! A fake [`SegmentHost`] backed by atomics, so segment-level tests (and
//! integration tests under `tests/`) can exercise a `Segment` without
//! building the rest of a write-ahead log.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::host::SegmentHost;
use crate::lsn::Lsn;

const NO_LSN: u64 = u64::MAX;

/// Records every LSN publication and the cache-overflow counter so tests
/// can assert on them directly.
#[derive(Debug, Default)]
pub struct FakeHost {
    commit_delay_ms: AtomicU64,
    written_segment: AtomicU64,
    written_position: AtomicU64,
    flushed_segment: AtomicU64,
    flushed_position: AtomicU64,
    cache_overflow_count: AtomicUsize,
    free_space_checks: AtomicUsize,
}

impl FakeHost {
    pub fn new(commit_delay_ms: u64) -> Self {
        Self {
            commit_delay_ms: AtomicU64::new(commit_delay_ms),
            written_segment: AtomicU64::new(NO_LSN),
            written_position: AtomicU64::new(0),
            flushed_segment: AtomicU64::new(NO_LSN),
            flushed_position: AtomicU64::new(0),
            cache_overflow_count: AtomicUsize::new(0),
            free_space_checks: AtomicUsize::new(0),
        }
    }

    pub fn cache_overflow_count(&self) -> usize {
        self.cache_overflow_count.load(Ordering::Acquire)
    }

    pub fn free_space_check_count(&self) -> usize {
        self.free_space_checks.load(Ordering::Acquire)
    }
}

impl SegmentHost for FakeHost {
    fn commit_delay_ms(&self) -> u64 {
        self.commit_delay_ms.load(Ordering::Acquire)
    }

    fn check_free_space(&self) {
        self.free_space_checks.fetch_add(1, Ordering::AcqRel);
    }

    fn written_lsn(&self) -> Option<Lsn> {
        let segment = self.written_segment.load(Ordering::Acquire);
        if segment == NO_LSN {
            None
        } else {
            Some(Lsn::new(segment, self.written_position.load(Ordering::Acquire)))
        }
    }

    fn set_written_lsn(&self, lsn: Lsn) {
        self.written_segment.store(lsn.segment, Ordering::Release);
        self.written_position.store(lsn.position, Ordering::Release);
    }

    fn flushed_lsn(&self) -> Option<Lsn> {
        let segment = self.flushed_segment.load(Ordering::Acquire);
        if segment == NO_LSN {
            None
        } else {
            Some(Lsn::new(segment, self.flushed_position.load(Ordering::Acquire)))
        }
    }

    fn set_flushed_lsn(&self, lsn: Lsn) {
        self.flushed_segment.store(lsn.segment, Ordering::Release);
        self.flushed_position.store(lsn.position, Ordering::Release);
    }

    fn increment_cache_overflow_count(&self) {
        self.cache_overflow_count.fetch_add(1, Ordering::AcqRel);
    }
}
