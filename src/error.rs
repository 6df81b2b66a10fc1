use thiserror::Error;

use crate::lsn::Lsn;

/// Errors produced by a WAL segment.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("page {0} failed verification (bad magic or CRC)")]
    PageBroken(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("segment is in an invalid state for this operation: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("flush executor did not stop within its shutdown timeout")]
    ShutdownTimeout,

    #[error("flush request was interrupted before completing")]
    Interrupted,

    #[error("record with LSN {0} not found in this segment")]
    RecordNotFound(Lsn),
}

pub type Result<T> = std::result::Result<T, SegmentError>;
