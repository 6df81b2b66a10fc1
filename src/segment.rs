//! Ties the page codec, layout planner, append buffer, flusher, file handle
//! manager, and reader together into the single externally-facing type:
//! one write-ahead-log segment.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::buffer::AppendBuffer;
use crate::config::SegmentConfig;
use crate::error::{Result, SegmentError};
use crate::file_handle::FileHandleManager;
use crate::flusher::Flusher;
use crate::host::SegmentHost;
use crate::identity::{self, parse_segment_order};
use crate::lsn::Lsn;
use crate::page::{self, PAGE_SIZE, RECORDS_OFFSET};
use crate::reader::Reader;

struct SegmentState {
    buffer: Arc<AppendBuffer>,
    flusher: Arc<Flusher>,
    reader: Reader,
}

/// A single WAL segment file.
///
/// Construct with [`Segment::open`], then call [`Segment::init`] once
/// before any append or read — `init` performs the torn-tail self-check
/// and recovery scan, and starts the background flush task.
pub struct Segment {
    order: u64,
    path: PathBuf,
    config: SegmentConfig,
    host: Arc<dyn SegmentHost>,
    file: Arc<FileHandleManager>,
    state: OnceLock<SegmentState>,
    closed: AtomicBool,
    flush_stopped: AtomicBool,
}

impl Segment {
    /// Construct a segment bound to `path`. Does no I/O; call `init` before
    /// using it.
    pub fn open(path: impl Into<PathBuf>, config: SegmentConfig, host: Arc<dyn SegmentHost>) -> Result<Self> {
        let path = path.into();
        let order = parse_segment_order(&path)?;
        let file = FileHandleManager::new(path.clone(), config.file_ttl);
        Ok(Self {
            order,
            path,
            config,
            host,
            file,
            state: OnceLock::new(),
            closed: AtomicBool::new(false),
            flush_stopped: AtomicBool::new(false),
        })
    }

    /// Build the file name for a segment with the given ordinal under
    /// `prefix` (e.g. `"wal"` yields `wal.<order>.wal`).
    pub fn file_name(prefix: &str, order: u64) -> String {
        identity::segment_file_name(prefix, order)
    }

    /// Truncate any torn tail left by a crash, compute `filled_up_to` from
    /// the last whole page, scan forward to recover the last appended LSN,
    /// and start the background flusher. Must be called exactly once.
    pub async fn init(&self) -> Result<()> {
        if self.state.get().is_some() {
            return Err(SegmentError::InvalidState(
                "init() called more than once".into(),
            ));
        }

        let truncated_len = self.self_check()?;
        let page_size = PAGE_SIZE as u64;
        let pages = truncated_len / page_size;

        let filled_up_to = if pages == 0 {
            RECORDS_OFFSET as u64
        } else {
            let mut last_page = page::new_page();
            self.file.with_file(|f| {
                use std::io::{Read, Seek, SeekFrom};
                f.seek(SeekFrom::Start((pages - 1) * page_size))?;
                f.read_exact(&mut last_page)
            })?;
            if page::verify_page(&last_page) {
                (pages - 1) * page_size + (page_size - page::free_space(&last_page) as u64)
            } else {
                pages * page_size + RECORDS_OFFSET as u64
            }
        };

        let buffer = Arc::new(AppendBuffer::new(self.order, filled_up_to, None));
        let flusher = Arc::new(Flusher::start(
            buffer.clone(),
            self.file.clone(),
            self.host.clone(),
            self.config.clone(),
        ));
        let reader = Reader::new(self.order, self.file.clone(), buffer.clone(), flusher.clone());

        if filled_up_to > RECORDS_OFFSET as u64 {
            let mut last_seen: Option<Lsn> = None;
            let mut trusted_end = RECORDS_OFFSET as u64;
            let mut cursor = reader.begin()?;

            while let Some(lsn) = cursor {
                match reader.record_end(lsn).await {
                    Ok(end) => {
                        last_seen = Some(lsn);
                        trusted_end = end;
                        cursor = (end < filled_up_to).then(|| Lsn::new(self.order, end));
                    }
                    Err(SegmentError::PageBroken(page_index)) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            page = page_index,
                            "recovery scan stopped at first unreadable record; \
                             truncating filled_up_to to the last known-good record"
                        );
                        buffer.set_filled_up_to(trusted_end);
                        cursor = None;
                    }
                    Err(err) => return Err(err),
                }
            }
            buffer.set_last(last_seen);
        }

        self.file.set_active(true);

        self.state
            .set(SegmentState {
                buffer,
                flusher,
                reader,
            })
            .map_err(|_| SegmentError::InvalidState("init() raced with itself".into()))?;

        Ok(())
    }

    /// Truncate a torn tail (a partial final page left by a crash) to the
    /// last whole page. Returns the resulting file length.
    fn self_check(&self) -> Result<u64> {
        let len = self.file.with_file(|f| f.metadata().map(|m| m.len()))?;
        let page_size = PAGE_SIZE as u64;
        let remainder = len % page_size;
        if remainder != 0 {
            let truncated = len - remainder;
            tracing::warn!(
                path = %self.path.display(),
                from = len,
                to = truncated,
                "truncating torn tail left by a prior crash"
            );
            self.file.with_file(|f| {
                f.set_len(truncated)?;
                Ok(())
            })?;
            Ok(truncated)
        } else {
            Ok(len)
        }
    }

    fn state(&self) -> Result<&SegmentState> {
        self.state.get().ok_or_else(|| {
            SegmentError::InvalidState("segment not initialized; call init() first".into())
        })
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filled_up_to(&self) -> Result<u64> {
        Ok(self.state()?.buffer.filled_up_to())
    }

    /// Append `payload`, returning its assigned LSN. Synchronously flushes
    /// if the append buffer has grown beyond `max_pages_cached` pages ahead
    /// of the last durably-written position.
    pub async fn append(&self, payload: Vec<u8>) -> Result<Lsn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SegmentError::InvalidState("segment is closed".into()));
        }
        if payload.len() > u32::MAX as usize {
            return Err(SegmentError::InvalidArgument(
                "record payload exceeds the maximum representable chunk length".into(),
            ));
        }

        let state = self.state()?;
        let (lsn, _placement) = state.buffer.append(payload);

        let written_pos = self.host.written_lsn().map(|l| l.position).unwrap_or(0);
        let pages_ahead = state.buffer.pages_ahead_of(written_pos);
        if pages_ahead as usize > self.config.max_pages_cached {
            state.flusher.flush().await?;
            self.host.increment_cache_overflow_count();
        }

        Ok(lsn)
    }

    /// Force a flush of every record appended so far.
    pub async fn flush(&self) -> Result<()> {
        if self.flush_stopped.load(Ordering::Acquire) {
            return Err(SegmentError::InvalidState(
                "flush executor has been stopped".into(),
            ));
        }
        self.state()?.flusher.flush().await
    }

    pub async fn read_record(&self, lsn: Lsn) -> Result<Option<Arc<Vec<u8>>>> {
        self.state()?.reader.read_record(lsn).await
    }

    pub async fn next_lsn(&self, lsn: Lsn) -> Result<Option<Lsn>> {
        self.state()?.reader.next_lsn(lsn).await
    }

    pub fn begin(&self) -> Result<Option<Lsn>> {
        self.state()?.reader.begin()
    }

    pub fn end(&self) -> Result<Option<Lsn>> {
        Ok(self.state()?.reader.end())
    }

    pub fn read_flushed_lsn(&self) -> Option<Lsn> {
        self.host.flushed_lsn()
    }

    /// The background flusher is started by `init`; calling this again is
    /// a harmless no-op unless it was previously stopped, in which case it
    /// errors — restarting a stopped flusher is not supported.
    pub fn start_flush(&self) -> Result<()> {
        self.state()?;
        if self.flush_stopped.load(Ordering::Acquire) {
            return Err(SegmentError::InvalidState(
                "flush executor was stopped and cannot be restarted".into(),
            ));
        }
        Ok(())
    }

    /// Stop the background flush executor, optionally running one final
    /// flush first.
    pub async fn stop_flush(&self, flush: bool) -> Result<()> {
        let state = self.state()?;
        state.flusher.stop(flush).await?;
        self.flush_stopped.store(true, Ordering::Release);
        self.file.set_active(false);
        Ok(())
    }

    /// Close the segment: stop the flusher (optionally flushing first) and
    /// release the backing file handle. Idempotent.
    pub async fn close(&self, flush: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.flush_stopped.load(Ordering::Acquire) {
            self.stop_flush(flush).await?;
        }
        self.file.close();
        Ok(())
    }

    /// Close and unlink the segment file, retrying the unlink a few times
    /// on transient failures.
    pub async fn delete(&self, flush: bool) -> Result<()> {
        self.close(flush).await?;
        let mut last_err = None;
        for attempt in 0..3 {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt < 2 {
                        tokio::time::sleep(std::time::Duration::from_millis(20 * (attempt + 1))).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop always sets last_err before exhausting retries").into())
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}
impl Eq for Segment {}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order.cmp(&other.order)
    }
}
