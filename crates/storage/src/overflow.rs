//! Overflow page chains for values too large to fit inline in a B+tree
//! leaf slot (§4.1, §4.5).
//!
//! A leaf slot holding an oversized value stores only the first overflow
//! page's id; the value's bytes are spread across a singly-linked chain
//! of [`PageKind::Overflow`] pages, each carrying a 4-byte next-page
//! pointer ([`NONE_PAGE`] terminates the chain) followed by as much of
//! the value as fits.

use crate::bufferpool::BufferPool;
use crate::page::{Page, PageId, PageKind};
use crate::pagefile::NONE_PAGE;
use lauradb_core::Result;
use lauradb_durability::TxId;

/// Values at or above this size are pushed out to an overflow chain
/// instead of living inline in a leaf slot, so a handful of oversized
/// documents can't starve a leaf page of room for its other entries.
pub const OVERFLOW_THRESHOLD: usize = 512;

const NEXT_PTR_SIZE: usize = 4;

/// Write `data` across a new chain of overflow pages, returning the
/// first page id.
pub fn write_overflow(pool: &BufferPool, tx_id: TxId, data: &[u8]) -> Result<PageId> {
    let chunk_cap = pool.page_size() - crate::page::PAGE_HEADER_SIZE - NEXT_PTR_SIZE;
    let mut chunks: Vec<&[u8]> = data.chunks(chunk_cap).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let mut page_ids = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        page_ids.push(pool.allocate_page(tx_id, PageKind::Overflow)?);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let next = page_ids.get(i + 1).copied().unwrap_or(NONE_PAGE);
        let page_id = page_ids[i];
        pool.pin(page_id)?;
        pool.write_page(tx_id, page_id, |page: &mut Page| {
            page.body[0..4].copy_from_slice(&next.to_be_bytes());
            page.body[4..4 + chunk.len()].copy_from_slice(chunk);
            page.body[4 + chunk.len()..].fill(0);
        })?;
        pool.unpin(page_id, true);
    }

    Ok(page_ids[0])
}

/// Read back a full overflow chain starting at `head`.
pub fn read_overflow(pool: &BufferPool, head: PageId, total_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len);
    let mut current = head;
    while current != NONE_PAGE && out.len() < total_len {
        let page = pool.pin(current)?;
        pool.unpin(current, false);
        let next = u32::from_be_bytes(page.body[0..4].try_into().unwrap());
        let remaining = total_len - out.len();
        let available = page.body.len() - NEXT_PTR_SIZE;
        let take = remaining.min(available);
        out.extend_from_slice(&page.body[4..4 + take]);
        current = next;
    }
    Ok(out)
}

/// Free every page in an overflow chain starting at `head`.
pub fn free_overflow(pool: &BufferPool, tx_id: TxId, head: PageId) -> Result<()> {
    let mut current = head;
    while current != NONE_PAGE {
        let page = pool.pin(current)?;
        let next = u32::from_be_bytes(page.body[0..4].try_into().unwrap());
        pool.unpin(current, false);
        pool.free_page(tx_id, current)?;
        current = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_durability::{DurabilityMode, WalWriter};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn new_pool(dir: &std::path::Path) -> BufferPool {
        let pf = crate::pagefile::PageFile::create(&dir.join("pages.db"), crate::pagefile::PAGE_SIZE).unwrap();
        let wal = Arc::new(WalWriter::open(dir.join("wal"), DurabilityMode::Sync).unwrap());
        BufferPool::new(pf, wal, 32)
    }

    #[test]
    fn round_trips_value_spanning_multiple_pages() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let head = write_overflow(&pool, 1, &data).unwrap();
        let back = read_overflow(&pool, head, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn round_trips_value_within_single_page() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let data = b"small overflow payload".to_vec();
        let head = write_overflow(&pool, 1, &data).unwrap();
        let back = read_overflow(&pool, head, data.len()).unwrap();
        assert_eq!(back, data);
    }
}
