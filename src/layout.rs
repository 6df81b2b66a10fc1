//! Pure arithmetic that maps a record's logical start position and byte
//! length onto the positions it will occupy once paged, accounting for the
//! page-header bytes consumed whenever a record crosses a page boundary.
//!
//! This is the sole authority on "logical position" math; the flusher's
//! page-filling loop and the reader's forward-walk both rely on a record's
//! `write_from`/`write_to` pair computed here.

use crate::page::{
    calculate_record_size, calculate_serialized_size, MAX_ENTRY_SIZE, MIN_RECORD_SIZE, PAGE_SIZE,
    RECORDS_OFFSET,
};

/// The logical byte range `[write_from, write_to)` a record will occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub write_from: u64,
    pub write_to: u64,
}

/// Plan where a record of `payload_len` bytes lands, given the segment's
/// current logical write cursor `starting`.
pub fn plan(starting: u64, payload_len: u64) -> Placement {
    let page_size = PAGE_SIZE as u64;
    let records_offset = RECORDS_OFFSET as u64;

    let offset_in_page = (starting % page_size).max(records_offset);
    let free_page_space = page_size - offset_in_page;
    let in_page = calculate_record_size(free_page_space);

    let at_page_boundary = starting % page_size == 0;

    if in_page >= payload_len {
        let result_size = calculate_serialized_size(payload_len);
        let write_from = if at_page_boundary {
            starting + records_offset
        } else {
            starting
        };
        return Placement {
            write_from,
            write_to: write_from + result_size,
        };
    }

    // Spans one or more page boundaries.
    let per_page_capacity = calculate_record_size(MAX_ENTRY_SIZE);
    let (write_from, length, mut result_size): (u64, u64, i64) = if in_page > 0 {
        let write_from = if at_page_boundary {
            starting + records_offset
        } else {
            starting
        };
        (write_from, payload_len - in_page, free_page_space as i64)
    } else {
        // No room for even a minimal chunk in the current page: skip straight
        // to the next page's records region.
        let write_from = starting + free_page_space + records_offset;
        (write_from, payload_len, -(records_offset as i64))
    };

    result_size += (length / per_page_capacity) as i64 * page_size as i64;

    let leftover = length % per_page_capacity;
    if leftover > 0 {
        result_size += records_offset as i64 + calculate_serialized_size(leftover) as i64;
    }

    debug_assert!(result_size >= 0);
    Placement {
        write_from,
        write_to: write_from + result_size as u64,
    }
}

/// The logical position immediately following a record whose raw end is
/// `write_to`, applying the reader's "not enough room for even a minimal
/// chunk" rule: a record ending within `MIN_RECORD_SIZE` bytes of (or
/// exactly on) a page boundary advances to the next page's
/// `RECORDS_OFFSET` rather than sitting in the dead space the writer would
/// never have started a new chunk in.
///
/// `plan`'s own `write_to` is the raw end and does not apply this bump —
/// callers that need the true successor position (the reader's forward
/// walk, and anything reasoning about an already-decoded record's
/// successor) must go through this function instead.
pub fn advance_past_record(write_to: u64) -> u64 {
    let page_size = PAGE_SIZE as u64;
    let rem = write_to % page_size;
    let payload_end = if rem == 0 { page_size } else { rem };
    let page_start = write_to - payload_end;
    if page_size - payload_end < MIN_RECORD_SIZE {
        page_start + page_size + RECORDS_OFFSET as u64
    } else {
        write_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_record_fits_in_first_page() {
        let p = plan(0, 5);
        assert_eq!(p.write_from, RECORDS_OFFSET as u64);
        assert_eq!(p.write_to, RECORDS_OFFSET as u64 + 5 + 6);
    }

    #[test]
    fn second_small_record_follows_first() {
        let first = plan(0, 5);
        let second = plan(first.write_to, 5);
        assert_eq!(second.write_from, first.write_to);
        assert!(second.write_to > second.write_from);
    }

    #[test]
    fn record_spanning_two_pages() {
        let page_size = PAGE_SIZE as u64;
        // Start near the end of a page, leave little room for a chunk.
        let starting = page_size - 20;
        let payload_len = 40;
        let p = plan(starting, payload_len);
        assert_eq!(p.write_from, starting);
        assert!(p.write_to > page_size);
    }

    #[test]
    fn record_filling_many_pages() {
        let per_page = calculate_record_size(MAX_ENTRY_SIZE);
        let payload_len = per_page * 3 + 10;
        let p = plan(RECORDS_OFFSET as u64, payload_len);
        // 3 full pages of framing + a small tail chunk's framing.
        assert!(p.write_to - p.write_from > payload_len);
    }

    #[test]
    fn no_room_for_minimal_chunk_skips_to_next_page() {
        let page_size = PAGE_SIZE as u64;
        // free_page_space will compute to exactly MIN_RECORD_SIZE - 1 so
        // calculate_record_size returns 0.
        let starting = page_size - 6; // records_offset math leaves free_page_space = 6
        let p = plan(starting, 20);
        assert_eq!(p.write_from, page_size + RECORDS_OFFSET as u64);
    }

    #[test]
    fn advance_past_record_mid_page_is_unchanged() {
        let write_to = RECORDS_OFFSET as u64 + 20;
        assert_eq!(advance_past_record(write_to), write_to);
    }

    #[test]
    fn advance_past_record_exactly_on_boundary_bumps_to_next_page() {
        let page_size = PAGE_SIZE as u64;
        assert_eq!(advance_past_record(page_size), page_size + RECORDS_OFFSET as u64);
    }

    #[test]
    fn advance_past_record_within_min_record_size_of_boundary_bumps() {
        let page_size = PAGE_SIZE as u64;
        let write_to = page_size - (MIN_RECORD_SIZE - 1);
        assert_eq!(advance_past_record(write_to), page_size + RECORDS_OFFSET as u64);
    }

    #[test]
    fn advance_past_record_with_room_to_spare_is_unchanged() {
        let page_size = PAGE_SIZE as u64;
        let write_to = page_size - MIN_RECORD_SIZE;
        assert_eq!(advance_past_record(write_to), write_to);
    }
}
