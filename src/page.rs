//! On-disk page format: a fixed-size, CRC-protected frame holding one or
//! more record chunks.
//!
//! Layout (all multi-byte integers little-endian):
//!
//! ```text
//! offset  bytes  field
//! 0       4      crc32 of bytes [4..PAGE_SIZE)
//! 4       8      magic
//! 12      4      free_space
//! 16      ..     record chunks
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, SegmentError};

/// Fixed page size in bytes. 64 KiB matches the host crate's block-file
/// page size (see `storage/block/file.rs`).
pub const PAGE_SIZE: usize = 64 * 1024;

pub const MAGIC: u64 = 0x57414c5f50475f31; // "WAL_PG_1"

pub const CRC_OFFSET: usize = 0;
pub const MAGIC_OFFSET: usize = 4;
pub const FREE_SPACE_OFFSET: usize = 12;
pub const RECORDS_OFFSET: usize = 16;

/// Bytes consumed by the smallest possible chunk header plus one payload
/// byte: 1 (continues_next_page) + 1 (is_last_chunk) + 4 (content_length) + 1.
pub const MIN_RECORD_SIZE: u64 = 7;

/// Bytes of chunk-header framing (not counting payload).
pub const CHUNK_HEADER_SIZE: u64 = 6;

/// Largest payload a single page could hold if it were entirely records.
pub const MAX_ENTRY_SIZE: u64 = (PAGE_SIZE - RECORDS_OFFSET) as u64;

/// Logical payload capacity of `free_bytes` worth of page space once a
/// chunk header is accounted for. Non-positive (represented as 0 here)
/// means no payload fits at all.
pub fn calculate_record_size(free_bytes: u64) -> u64 {
    free_bytes.saturating_sub(CHUNK_HEADER_SIZE)
}

/// Bytes a chunk carrying `payload_len` bytes of payload occupies on page,
/// header included.
pub fn calculate_serialized_size(payload_len: u64) -> u64 {
    payload_len + CHUNK_HEADER_SIZE
}

/// Decoded view of one record chunk's header, as stored at some offset
/// inside a page buffer.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub continues_next_page: bool,
    pub is_last_chunk: bool,
    pub content_length: u32,
}

/// Write a chunk (header + payload) into `page` starting at `pos`.
/// Returns the cursor just past the written chunk.
pub fn write_chunk_header(
    page: &mut [u8],
    pos: usize,
    continues_next_page: bool,
    is_last_chunk: bool,
    payload: &[u8],
) -> usize {
    page[pos] = continues_next_page as u8;
    page[pos + 1] = is_last_chunk as u8;
    LittleEndian::write_u32(&mut page[pos + 2..pos + 6], payload.len() as u32);
    let payload_start = pos + CHUNK_HEADER_SIZE as usize;
    page[payload_start..payload_start + payload.len()].copy_from_slice(payload);
    let new_pos = payload_start + payload.len();
    set_free_space(page, (PAGE_SIZE - new_pos) as u32);
    new_pos
}

/// Read the chunk header at `pos`, without copying the payload.
pub fn read_chunk_header(page: &[u8], pos: usize) -> ChunkHeader {
    ChunkHeader {
        continues_next_page: page[pos] != 0,
        is_last_chunk: page[pos + 1] != 0,
        content_length: LittleEndian::read_u32(&page[pos + 2..pos + 6]),
    }
}

pub fn set_free_space(page: &mut [u8], free_space: u32) {
    LittleEndian::write_u32(&mut page[FREE_SPACE_OFFSET..FREE_SPACE_OFFSET + 4], free_space);
}

pub fn free_space(page: &[u8]) -> u32 {
    LittleEndian::read_u32(&page[FREE_SPACE_OFFSET..FREE_SPACE_OFFSET + 4])
}

/// Write the magic number and compute/write the CRC over the remainder of
/// the page. Idempotent: may be called again after further in-place edits.
pub fn finalize_page(page: &mut [u8]) {
    LittleEndian::write_u64(&mut page[MAGIC_OFFSET..MAGIC_OFFSET + 8], MAGIC);
    let crc = crc32(&page[4..PAGE_SIZE]);
    LittleEndian::write_u32(&mut page[CRC_OFFSET..CRC_OFFSET + 4], crc);
}

/// Verify a page's magic number and CRC32 checksum.
pub fn verify_page(page: &[u8]) -> bool {
    if page.len() != PAGE_SIZE {
        return false;
    }
    let magic = LittleEndian::read_u64(&page[MAGIC_OFFSET..MAGIC_OFFSET + 8]);
    if magic != MAGIC {
        return false;
    }
    let stored_crc = LittleEndian::read_u32(&page[CRC_OFFSET..CRC_OFFSET + 4]);
    stored_crc == crc32(&page[4..PAGE_SIZE])
}

/// Verify a page, returning a typed error naming the offending page index
/// on failure.
pub fn verify_page_at(page: &[u8], page_index: u64) -> Result<()> {
    if verify_page(page) {
        Ok(())
    } else {
        Err(SegmentError::PageBroken(page_index))
    }
}

/// CRC32 (IEEE / ISO 3309 / ITU-T V.42 polynomial) over `bytes`, stored and
/// compared as an unsigned 32-bit value.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// A freshly-zeroed page buffer with `free_space` initialized to the whole
/// records region.
pub fn new_page() -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    set_free_space(&mut page, (PAGE_SIZE - RECORDS_OFFSET) as u32);
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrip() {
        let mut page = new_page();
        let payload = b"hello world";
        let pos = write_chunk_header(&mut page, RECORDS_OFFSET, false, true, payload);
        finalize_page(&mut page);
        assert!(verify_page(&page));
        let header = read_chunk_header(&page, RECORDS_OFFSET);
        assert!(!header.continues_next_page);
        assert!(header.is_last_chunk);
        assert_eq!(header.content_length as usize, payload.len());
        assert_eq!(
            &page[RECORDS_OFFSET + 6..pos],
            payload
        );
    }

    #[test]
    fn corrupt_magic_fails_verification() {
        let mut page = new_page();
        write_chunk_header(&mut page, RECORDS_OFFSET, false, true, b"x");
        finalize_page(&mut page);
        page[MAGIC_OFFSET] ^= 0xFF;
        assert!(!verify_page(&page));
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let mut page = new_page();
        write_chunk_header(&mut page, RECORDS_OFFSET, false, true, b"payload-bytes");
        finalize_page(&mut page);
        page[RECORDS_OFFSET + 10] ^= 0xFF;
        assert!(!verify_page(&page));
    }

    #[test]
    fn record_size_math() {
        assert_eq!(calculate_record_size(MIN_RECORD_SIZE), 1);
        assert_eq!(calculate_record_size(MIN_RECORD_SIZE - 1), 0);
        assert_eq!(calculate_serialized_size(10), 16);
    }
}
