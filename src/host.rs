//! The capability boundary a segment consumes from the outer `WriteAheadLog`
//! object that owns the full segment set, checkpoint policy, and free-space
//! accounting. Expressed as a trait so a segment can be exercised in
//! isolation against a fake implementation.

use crate::lsn::Lsn;

/// Collaborator interface a segment calls back into: commit-delay policy,
/// free-space housekeeping, and publication points for the durable
/// watermarks the rest of the WAL tracks.
pub trait SegmentHost: Send + Sync {
    /// Milliseconds between background flush ticks; 0 disables the
    /// periodic flusher (callers must flush explicitly).
    fn commit_delay_ms(&self) -> u64;

    /// Called once after every completed flush, successful or not, so the
    /// outer WAL can run free-space housekeeping.
    fn check_free_space(&self);

    fn written_lsn(&self) -> Option<Lsn>;
    fn set_written_lsn(&self, lsn: Lsn);
    fn flushed_lsn(&self) -> Option<Lsn>;
    fn set_flushed_lsn(&self, lsn: Lsn);

    /// Called whenever an append synchronously triggers a flush because the
    /// append buffer exceeded its configured page-cache budget.
    fn increment_cache_overflow_count(&self);
}
