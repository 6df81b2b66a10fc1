//! Background flush pipeline: drains the append buffer, materializes
//! fixed-size pages, and writes them through the file handle manager.
//!
//! A single-consumer task processes both the periodic tick and any
//! synchronously-submitted flush requests, strictly in the order they are
//! observed, so pages are always written in increasing page-index order
//! with no locking needed around the file cursor during a flush.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::AppendBuffer;
use crate::config::SegmentConfig;
use crate::error::{Result, SegmentError};
use crate::file_handle::FileHandleManager;
use crate::host::SegmentHost;
use crate::lsn::Lsn;
use crate::page::{self, MIN_RECORD_SIZE, PAGE_SIZE, RECORDS_OFFSET};

type FlushReply = oneshot::Sender<Result<()>>;

pub struct Flusher {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<FlushReply>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: std::time::Duration,
}

impl Flusher {
    /// Start the background task. `commit_delay` of zero disables the
    /// periodic tick; only explicit `flush()` calls will drain the buffer.
    pub fn start(
        buffer: Arc<AppendBuffer>,
        file: Arc<FileHandleManager>,
        host: Arc<dyn SegmentHost>,
        config: SegmentConfig,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<FlushReply>();
        let shutdown_timeout = config.shutdown_timeout;
        let commit_delay = std::time::Duration::from_millis(host.commit_delay_ms());

        let task = tokio::spawn(async move {
            let mut pending_lsn_to_flush: Option<Lsn> = None;
            let mut ticker = (!commit_delay.is_zero()).then(|| tokio::time::interval(commit_delay));

            loop {
                tokio::select! {
                    biased;
                    maybe_req = rx.recv() => {
                        match maybe_req {
                            Some(reply) => {
                                let result = run_flush(&buffer, &file, host.as_ref(), &config, &mut pending_lsn_to_flush).await;
                                let _ = reply.send(result);
                            }
                            None => break,
                        }
                    }
                    _ = async {
                        match ticker.as_mut() {
                            Some(t) => { t.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        if let Err(err) = run_flush(&buffer, &file, host.as_ref(), &config, &mut pending_lsn_to_flush).await {
                            tracing::error!(error = %err, "background flush tick failed");
                        }
                    }
                }
            }
        });

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
            shutdown_timeout,
        }
    }

    /// Submit a flush request and wait for it to complete. Guarantees that
    /// every entry appended before this call returns is durable (to the
    /// segment's `sync_on_page_flush` policy) once this call returns.
    pub async fn flush(&self) -> Result<()> {
        let sender = self.tx.lock().clone();
        let sender = sender.ok_or(SegmentError::Interrupted)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender.send(reply_tx).map_err(|_| SegmentError::Interrupted)?;
        reply_rx.await.map_err(|_| SegmentError::Interrupted)?
    }

    /// Shut the background task down, optionally running one last flush
    /// first. Fails with `ShutdownTimeout` if the task does not stop within
    /// the configured bound.
    pub async fn stop(&self, final_flush: bool) -> Result<()> {
        if final_flush {
            // Ignore failure here; we still want to proceed with shutdown.
            let _ = self.flush().await;
        }
        // Drop the last sender so the task's `rx.recv()` observes channel
        // closure and exits its loop.
        self.tx.lock().take();
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Ok(()), // task panicked; nothing more we can do
                Err(_) => Err(SegmentError::ShutdownTimeout),
            }
        } else {
            Ok(())
        }
    }
}

async fn run_flush(
    buffer: &AppendBuffer,
    file: &Arc<FileHandleManager>,
    host: &dyn SegmentHost,
    config: &SegmentConfig,
    pending_lsn_to_flush: &mut Option<Lsn>,
) -> Result<()> {
    if !buffer.take_dirty() {
        return Ok(());
    }
    let entries = buffer.drain();
    if entries.is_empty() {
        return Ok(());
    }

    let first = &entries[0];
    let page_size = PAGE_SIZE as u64;
    let mut cur_page_index = first.write_from / page_size;

    let mut page_buf = page::new_page();
    let file_length = file.with_file(|f| f.metadata().map(|m| m.len()))?;
    if file_length / page_size > cur_page_index {
        file.with_file(|f| {
            f.seek(SeekFrom::Start(cur_page_index * page_size))?;
            f.read_exact(&mut page_buf)
        })?;
    }

    let mut last_to_flush = false;

    for entry in &entries {
        cur_page_index = entry.write_from / page_size;
        let mut pos = (entry.write_from % page_size) as usize;
        let mut written = 0usize;

        while written < entry.payload.len() {
            let free = page_size as usize - pos;
            let chunk_cap = page::calculate_record_size(free as u64) as usize;
            let chunk_len = chunk_cap.min(entry.payload.len() - written);
            let from = written;
            written += chunk_len;
            let is_last = written == entry.payload.len();

            pos = page::write_chunk_header(
                &mut page_buf,
                pos,
                !is_last,
                is_last,
                &entry.payload[from..written],
            );
            last_to_flush = true;

            if PAGE_SIZE - pos < MIN_RECORD_SIZE as usize {
                page::finalize_page(&mut page_buf);
                file.with_file(|f| {
                    f.seek(SeekFrom::Start(cur_page_index * page_size))?;
                    f.write_all(&page_buf)
                })?;
                if let Some(pending) = pending_lsn_to_flush.take() {
                    host.set_written_lsn(pending);
                }
                *pending_lsn_to_flush = Some(entry.lsn);
                last_to_flush = false;
                cur_page_index += 1;
                pos = RECORDS_OFFSET;
                page_buf = page::new_page();
            }
        }
    }

    if last_to_flush {
        page::finalize_page(&mut page_buf);
        file.with_file(|f| {
            f.seek(SeekFrom::Start(cur_page_index * page_size))?;
            f.write_all(&page_buf)
        })?;
    }

    if config.sync_on_page_flush {
        file.with_file(|f| f.sync_all())?;
    }

    let last_lsn = entries.last().expect("checked non-empty above").lsn;
    host.set_flushed_lsn(last_lsn);
    host.set_written_lsn(last_lsn);
    host.check_free_space();

    Ok(())
}
