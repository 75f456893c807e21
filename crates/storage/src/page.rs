//! Fixed-size pages: the unit of I/O, caching, and checksum (§3, §4.1).

use crc32fast::Hasher;

/// Page identifier: a 32-bit offset into the page file.
pub type PageId = u32;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Fixed-size header stored at the start of every page body.
pub const PAGE_HEADER_SIZE: usize = 24;

/// The page holding id 0 in every page file: schema version, catalog
/// root, free-list head, high-water mark, last checkpoint LSN.
pub const META_PAGE_ID: PageId = 0;

/// What a page currently holds. Read paths use this to reject
/// type-confused accesses (e.g. reading a freed page as user data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// The single meta page (id 0).
    Meta = 0,
    /// On the free list; body is meaningless and never read as data.
    Free = 1,
    /// B+tree internal (non-leaf) node.
    BTreeInternal = 2,
    /// B+tree leaf node.
    BTreeLeaf = 3,
    /// Overflow page for values exceeding the inline threshold.
    Overflow = 4,
    /// Reserved for oplog-adjacent bookkeeping pages.
    Oplog = 5,
}

impl PageKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(PageKind::Meta),
            1 => Some(PageKind::Free),
            2 => Some(PageKind::BTreeInternal),
            3 => Some(PageKind::BTreeLeaf),
            4 => Some(PageKind::Overflow),
            5 => Some(PageKind::Oplog),
            _ => None,
        }
    }
}

/// One fixed-size page: header plus body. The header's `lsn` records the
/// WAL position of the last write to this page, used by the buffer pool
/// to enforce WAL-ahead-of-data (§4.2) and by recovery.
#[derive(Debug, Clone)]
pub struct Page {
    /// This page's id, redundantly stored for self-describing integrity
    /// checks.
    pub page_id: PageId,
    /// What this page currently holds.
    pub kind: PageKind,
    /// LSN of the WAL record that produced this page's current bytes.
    pub lsn: u64,
    /// Page body, always exactly `page_size - PAGE_HEADER_SIZE` bytes.
    pub body: Vec<u8>,
}

impl Page {
    /// Construct a new, zeroed page of the given kind.
    pub fn new(page_id: PageId, kind: PageKind, page_size: usize) -> Self {
        Page {
            page_id,
            kind,
            lsn: 0,
            body: vec![0u8; page_size - PAGE_HEADER_SIZE],
        }
    }

    /// Serialize this page (header + body + checksum) into exactly
    /// `page_size` bytes.
    pub fn to_bytes(&self, page_size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(page_size);
        out.extend_from_slice(&self.page_id.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&[0u8; 3]); // padding, keeps header word-aligned
        out.extend_from_slice(&self.lsn.to_be_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        debug_assert_eq!(out.len(), PAGE_HEADER_SIZE - 4);
        out.extend_from_slice(&self.body);
        out.resize(page_size - 4, 0);

        let mut hasher = Hasher::new();
        hasher.update(&out);
        let checksum = hasher.finalize();
        out.extend_from_slice(&checksum.to_be_bytes());
        out
    }

    /// Parse a page from exactly `page_size` bytes, verifying its
    /// checksum. Returns `Err` (surfaced by callers as `Corruption`) on
    /// mismatch.
    pub fn from_bytes(bytes: &[u8], page_size: usize) -> Result<Self, String> {
        if bytes.len() != page_size {
            return Err(format!(
                "page buffer has {} bytes, expected {page_size}",
                bytes.len()
            ));
        }
        let (body_and_header, checksum_bytes) = bytes.split_at(page_size - 4);
        let stored_checksum = u32::from_be_bytes(checksum_bytes.try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(body_and_header);
        if hasher.finalize() != stored_checksum {
            return Err(format!("checksum mismatch on page"));
        }

        let page_id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let kind = PageKind::from_u8(bytes[4]).ok_or("unknown page kind byte")?;
        let lsn = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let body_len = u32::from_be_bytes(bytes[16..20].try_into().unwrap()) as usize;
        let body = bytes[20..20 + body_len].to_vec();

        Ok(Page {
            page_id,
            kind,
            lsn,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut page = Page::new(7, PageKind::BTreeLeaf, DEFAULT_PAGE_SIZE);
        page.body[0] = 0xAB;
        page.lsn = 99;
        let bytes = page.to_bytes(DEFAULT_PAGE_SIZE);
        let parsed = Page::from_bytes(&bytes, DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(parsed.page_id, 7);
        assert_eq!(parsed.kind, PageKind::BTreeLeaf);
        assert_eq!(parsed.lsn, 99);
        assert_eq!(parsed.body[0], 0xAB);
    }

    #[test]
    fn detects_bit_flip_corruption() {
        let page = Page::new(1, PageKind::Meta, DEFAULT_PAGE_SIZE);
        let mut bytes = page.to_bytes(DEFAULT_PAGE_SIZE);
        bytes[21] ^= 0xFF;
        assert!(Page::from_bytes(&bytes, DEFAULT_PAGE_SIZE).is_err());
    }
}
