//! Lazily-opened backing file with an idle-TTL auto-closer.
//!
//! The file is opened on first access and held across calls so appenders
//! and the reader don't pay an open() per operation. A background task
//! closes the handle again after a period of inactivity using a two-tick
//! heuristic: a handle survives one full TTL window with no access before
//! the *next* tick closes it. This tolerates scheduling jitter better than
//! a single one-shot timer re-armed on every access.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct FileSlot {
    file: Option<File>,
}

pub struct FileHandleManager {
    path: PathBuf,
    ttl: Duration,
    slot: Mutex<FileSlot>,
    prevent_auto_close: AtomicBool,
    close_next_time: AtomicBool,
    auto_close_in_progress: AtomicBool,
    closer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileHandleManager {
    pub fn new(path: PathBuf, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            path,
            ttl,
            slot: Mutex::new(FileSlot { file: None }),
            prevent_auto_close: AtomicBool::new(false),
            close_next_time: AtomicBool::new(false),
            auto_close_in_progress: AtomicBool::new(false),
            closer_handle: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the segment as actively being appended to (or not). While
    /// active, the closer task fires but takes no action.
    pub fn set_active(&self, active: bool) {
        self.prevent_auto_close.store(active, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().file.is_some()
    }

    /// Run `op` against the backing file, opening it first if necessary.
    /// Callers must not hold the file mutex across an `.await` of their
    /// own — this call is itself the critical section.
    pub fn with_file<R>(
        self: &Arc<Self>,
        op: impl FnOnce(&mut File) -> std::io::Result<R>,
    ) -> std::io::Result<R> {
        let mut guard = self.slot.lock();
        let freshly_opened = guard.file.is_none();
        if freshly_opened {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)?;
            guard.file = Some(file);
        }
        self.close_next_time.store(false, Ordering::Release);
        let result = op(guard.file.as_mut().expect("file just ensured open"));
        drop(guard);
        if freshly_opened {
            self.arm_closer();
        }
        result
    }

    pub fn close(&self) {
        let mut guard = self.slot.lock();
        guard.file = None;
        if let Some(handle) = self.closer_handle.lock().take() {
            handle.abort();
        }
        self.auto_close_in_progress.store(false, Ordering::Release);
    }

    fn arm_closer(self: &Arc<Self>) {
        if self
            .auto_close_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A closer is already scheduled for this handle.
            return;
        }
        self.close_next_time.store(true, Ordering::Release);
        let weak = Arc::downgrade(self);
        let ttl = self.ttl;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                let Some(this) = weak.upgrade() else {
                    return;
                };
                if this.prevent_auto_close.load(Ordering::Acquire) {
                    continue;
                }
                let was_idle_last_tick = this.close_next_time.swap(true, Ordering::AcqRel);
                if was_idle_last_tick {
                    let mut guard = this.slot.lock();
                    if guard.file.take().is_some() {
                        tracing::debug!(path = %this.path.display(), "auto-closed idle segment file handle");
                    }
                    this.auto_close_in_progress.store(false, Ordering::Release);
                    return;
                }
            }
        });
        *self.closer_handle.lock() = Some(handle);
    }
}

impl Drop for FileHandleManager {
    fn drop(&mut self) {
        if let Some(handle) = self.closer_handle.lock().take() {
            handle.abort();
        }
    }
}
