//! Reassembles records that may span multiple pages, verifying each page's
//! CRC as it goes, and caches the last decoded record by LSN.

use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::AppendBuffer;
use crate::error::{Result, SegmentError};
use crate::file_handle::FileHandleManager;
use crate::flusher::Flusher;
use crate::layout;
use crate::lsn::Lsn;
use crate::page::{self, MIN_RECORD_SIZE, PAGE_SIZE, RECORDS_OFFSET};

pub struct Reader {
    segment_order: u64,
    file: Arc<FileHandleManager>,
    buffer: Arc<AppendBuffer>,
    flusher: Arc<Flusher>,
    last_read: Mutex<Option<(Lsn, Weak<Vec<u8>>)>>,
}

impl Reader {
    pub fn new(
        segment_order: u64,
        file: Arc<FileHandleManager>,
        buffer: Arc<AppendBuffer>,
        flusher: Arc<Flusher>,
    ) -> Self {
        Self {
            segment_order,
            file,
            buffer,
            flusher,
            last_read: Mutex::new(None),
        }
    }

    /// Read the record starting at `lsn`, or `None` if `lsn` is past the
    /// segment's filled watermark.
    pub async fn read_record(&self, lsn: Lsn) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self.locate(lsn).await?.map(|(bytes, _)| bytes))
    }

    /// The LSN immediately following the record at `lsn`, or `None` if
    /// `lsn` is the last record in the segment.
    pub async fn next_lsn(&self, lsn: Lsn) -> Result<Option<Lsn>> {
        match self.locate(lsn).await? {
            Some((_, next_position)) => {
                if next_position < self.buffer.filled_up_to() {
                    Ok(Some(Lsn::new(self.segment_order, next_position)))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// The logical position immediately following the record at `lsn`,
    /// without consulting (or being bounded by) `filled_up_to`. Used only
    /// by `Segment::init`'s recovery scan, which must be able to detect
    /// that the optimistically-computed watermark overshoots an actually
    /// broken chain.
    pub(crate) async fn record_end(&self, lsn: Lsn) -> Result<u64> {
        self.locate(lsn)
            .await?
            .map(|(_, end)| end)
            .ok_or(SegmentError::RecordNotFound(lsn))
    }

    /// The first readable LSN in the segment, if anything has been written.
    pub fn begin(&self) -> Result<Option<Lsn>> {
        if !self.buffer.is_empty() {
            return Ok(Some(Lsn::new(self.segment_order, RECORDS_OFFSET as u64)));
        }
        let len = self.file.with_file(|f| f.metadata().map(|m| m.len()))?;
        if len > 0 {
            Ok(Some(Lsn::new(self.segment_order, RECORDS_OFFSET as u64)))
        } else {
            Ok(None)
        }
    }

    /// LSN of the most recently appended record.
    pub fn end(&self) -> Option<Lsn> {
        self.buffer.last()
    }

    async fn locate(&self, lsn: Lsn) -> Result<Option<(Arc<Vec<u8>>, u64)>> {
        if lsn.segment != self.segment_order {
            return Ok(None);
        }

        if let Some((cached_lsn, weak)) = self.last_read.lock().clone() {
            if cached_lsn == lsn {
                if let Some(strong) = weak.upgrade() {
                    let next_position = self.end_of_cached(&strong, lsn);
                    return Ok(Some((strong, next_position)));
                }
            }
        }

        let filled_up_to = self.buffer.filled_up_to();
        if lsn.position >= filled_up_to {
            return Ok(None);
        }

        if !self.buffer.is_empty() {
            self.flusher.flush().await?;
        }

        let page_size = PAGE_SIZE as u64;
        let page_count = (filled_up_to + page_size - 1) / page_size;
        let mut page_index = lsn.position / page_size;
        let mut page_offset = (lsn.position % page_size) as usize;

        let mut accumulated = Vec::new();
        let next_position;

        loop {
            let mut page_buf = page::new_page();
            self.file.with_file(|f| {
                f.seek(SeekFrom::Start(page_index * page_size))?;
                f.read_exact(&mut page_buf)
            })?;
            page::verify_page_at(&page_buf, page_index)?;

            let header = page::read_chunk_header(&page_buf, page_offset);
            let payload_start = page_offset + 6;
            let payload_end = payload_start + header.content_length as usize;
            accumulated.extend_from_slice(&page_buf[payload_start..payload_end]);

            if header.continues_next_page {
                if page_index + 1 >= page_count {
                    return Err(SegmentError::PageBroken(page_index));
                }
                page_index += 1;
                page_offset = RECORDS_OFFSET;
                continue;
            }

            let is_final_page = page_index + 1 == page_count;
            let free = page::free_space(&page_buf) as u64;
            if free >= MIN_RECORD_SIZE && !is_final_page {
                return Err(SegmentError::PageBroken(page_index));
            }

            next_position = layout::advance_past_record(page_index * page_size + payload_end as u64);
            break;
        }

        let result = Arc::new(accumulated);
        *self.last_read.lock() = Some((lsn, Arc::downgrade(&result)));
        Ok(Some((result, next_position)))
    }

    fn end_of_cached(&self, bytes: &Arc<Vec<u8>>, lsn: Lsn) -> u64 {
        // Re-derive the placement of an already-decoded record rather than
        // re-reading pages: its on-disk footprint is deterministic given
        // its start position and length. `plan`'s `write_to` is the raw
        // end; `locate`'s page-walk applies the same
        // not-enough-room-for-a-minimal-chunk bump, so this has to as well,
        // or a record ending on (or within `MIN_RECORD_SIZE` of) a page
        // boundary would resolve to a position no record actually starts
        // at.
        let placement = layout::plan(lsn.position, bytes.len() as u64);
        layout::advance_past_record(placement.write_to)
    }
}
