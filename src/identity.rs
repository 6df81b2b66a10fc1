//! Segment identity: parsing the ordinal out of a segment's file name.
//!
//! File names follow `*.<N>.wal`; `N` is the segment's ordinal, a decimal
//! `u64`. Parsed by direct string manipulation rather than a regex engine —
//! the grammar is simple enough that pulling in a regex dependency isn't
//! warranted.

use std::path::Path;

use crate::error::{Result, SegmentError};

pub fn parse_segment_order(path: &Path) -> Result<u64> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid(path))?;

    let without_ext = file_name
        .strip_suffix(".wal")
        .ok_or_else(|| invalid(path))?;

    let ordinal_str = without_ext
        .rsplit_once('.')
        .map(|(_, ordinal)| ordinal)
        .ok_or_else(|| invalid(path))?;

    ordinal_str
        .parse::<u64>()
        .map_err(|_| invalid(path))
}

pub fn segment_file_name(prefix: &str, order: u64) -> String {
    format!("{prefix}.{order}.wal")
}

fn invalid(path: &Path) -> SegmentError {
    SegmentError::InvalidArgument(format!(
        "segment file name `{}` does not match `*.<N>.wal`",
        path.display()
    ))
}
