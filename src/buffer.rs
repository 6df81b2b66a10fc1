//! In-memory queue of not-yet-flushed records.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::layout::{self, Placement};
use crate::lsn::Lsn;

/// One queued, not-yet-durable record.
#[derive(Debug, Clone)]
pub struct Entry {
    pub lsn: Lsn,
    pub payload: Vec<u8>,
    pub write_from: u64,
    pub write_to: u64,
}

struct Inner {
    queue: VecDeque<Entry>,
    filled_up_to: u64,
    last: Option<Lsn>,
    flush_dirty: bool,
}

pub struct AppendBuffer {
    segment_order: u64,
    inner: Mutex<Inner>,
}

impl AppendBuffer {
    pub fn new(segment_order: u64, filled_up_to: u64, last: Option<Lsn>) -> Self {
        Self {
            segment_order,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                filled_up_to,
                last,
                flush_dirty: false,
            }),
        }
    }

    /// Plan and enqueue `payload`, returning its assigned LSN and the
    /// placement the flusher will later use to page it.
    pub fn append(&self, payload: Vec<u8>) -> (Lsn, Placement) {
        let mut inner = self.inner.lock();
        let placement = layout::plan(inner.filled_up_to, payload.len() as u64);
        let lsn = Lsn::new(self.segment_order, placement.write_from);
        inner.filled_up_to = placement.write_to;
        inner.last = Some(lsn);
        inner.flush_dirty = true;
        inner.queue.push_back(Entry {
            lsn,
            payload,
            write_from: placement.write_from,
            write_to: placement.write_to,
        });
        (lsn, placement)
    }

    /// Atomically swap out the queued entries, leaving the buffer empty.
    /// Called only by the flusher.
    pub fn drain(&self) -> Vec<Entry> {
        let mut inner = self.inner.lock();
        inner.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn filled_up_to(&self) -> u64 {
        self.inner.lock().filled_up_to
    }

    pub fn last(&self) -> Option<Lsn> {
        self.inner.lock().last
    }

    /// Record the LSN of the most recently appended record discovered
    /// during recovery. Used only by `Segment::init` after scanning an
    /// already-populated file; never called once appends are flowing.
    pub fn set_last(&self, lsn: Option<Lsn>) {
        self.inner.lock().last = lsn;
    }

    /// Roll the filled-up-to watermark back to `position`. Used only by
    /// `Segment::init` when the recovery scan finds that the optimistic
    /// watermark computed from the last page overshoots an actually broken
    /// chunk chain (the writer crashed after starting a page but before
    /// completing the chain it referenced).
    pub fn set_filled_up_to(&self, position: u64) {
        self.inner.lock().filled_up_to = position;
    }

    /// Clear the dirty flag, returning whatever it was before clearing.
    /// Called once per flush tick before draining.
    pub fn take_dirty(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.flush_dirty, false)
    }

    /// Number of whole pages of not-yet-flushed data ahead of `written_pos`.
    pub fn pages_ahead_of(&self, written_pos: u64) -> u64 {
        let filled_up_to = self.inner.lock().filled_up_to;
        filled_up_to.saturating_sub(written_pos) / crate::page::PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_monotonic_lsns() {
        let buf = AppendBuffer::new(0, crate::page::RECORDS_OFFSET as u64, None);
        let (lsn1, _) = buf.append(b"first".to_vec());
        let (lsn2, _) = buf.append(b"second".to_vec());
        assert!(lsn2 > lsn1);
        assert_eq!(buf.last(), Some(lsn2));
    }

    #[test]
    fn drain_empties_queue() {
        let buf = AppendBuffer::new(0, crate::page::RECORDS_OFFSET as u64, None);
        buf.append(b"x".to_vec());
        assert!(!buf.is_empty());
        let entries = buf.drain();
        assert_eq!(entries.len(), 1);
        assert!(buf.is_empty());
    }
}
