//! Raw page file I/O: a sparse array of fixed-size pages addressed by
//! page id (§3, §4.1). This layer knows nothing about the WAL or the
//! buffer pool; [`crate::bufferpool::BufferPool`] is the layer that
//! enforces WAL-ahead-of-data and owns allocation bookkeeping.

use crate::page::{Page, PageId, PageKind, DEFAULT_PAGE_SIZE, META_PAGE_ID};
use lauradb_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Sentinel meaning "no page" for free-list links and an unset catalog
/// root.
pub const NONE_PAGE: PageId = u32::MAX;

/// The meta page's logical contents (§3): schema version, catalog root,
/// free-list head, next-page-id high-water mark, last checkpoint LSN.
#[derive(Debug, Clone, Copy)]
pub struct MetaPage {
    /// On-disk schema version, bumped on incompatible format changes.
    pub schema_version: u32,
    /// Root page of the catalog B+tree, or [`NONE_PAGE`] before the
    /// first collection is created.
    pub catalog_root: PageId,
    /// Head of the intrusive free-page list, or [`NONE_PAGE`] if empty.
    pub free_list_head: PageId,
    /// Next never-yet-allocated page id.
    pub next_page_id: PageId,
    /// LSN of the most recent checkpoint.
    pub last_checkpoint_lsn: u64,
}

impl MetaPage {
    fn fresh() -> Self {
        MetaPage {
            schema_version: 1,
            catalog_root: NONE_PAGE,
            free_list_head: NONE_PAGE,
            next_page_id: META_PAGE_ID + 1,
            last_checkpoint_lsn: 0,
        }
    }

    fn encode(&self, body: &mut [u8]) {
        body[0..4].copy_from_slice(&self.schema_version.to_be_bytes());
        body[4..8].copy_from_slice(&self.catalog_root.to_be_bytes());
        body[8..12].copy_from_slice(&self.free_list_head.to_be_bytes());
        body[12..16].copy_from_slice(&self.next_page_id.to_be_bytes());
        body[16..24].copy_from_slice(&self.last_checkpoint_lsn.to_be_bytes());
    }

    fn decode(body: &[u8]) -> Self {
        MetaPage {
            schema_version: u32::from_be_bytes(body[0..4].try_into().unwrap()),
            catalog_root: u32::from_be_bytes(body[4..8].try_into().unwrap()),
            free_list_head: u32::from_be_bytes(body[8..12].try_into().unwrap()),
            next_page_id: u32::from_be_bytes(body[12..16].try_into().unwrap()),
            last_checkpoint_lsn: u64::from_be_bytes(body[16..24].try_into().unwrap()),
        }
    }

    /// Render this meta page's logical contents as a full [`Page`].
    pub fn to_page(&self, page_size: usize) -> Page {
        let mut page = Page::new(META_PAGE_ID, PageKind::Meta, page_size);
        self.encode(&mut page.body);
        page
    }

    /// Parse the logical contents out of a loaded meta [`Page`].
    pub fn from_page(page: &Page) -> Self {
        MetaPage::decode(&page.body)
    }
}

/// A sparse, page-addressed file.
pub struct PageFile {
    file: File,
    page_size: usize,
}

impl PageFile {
    /// Create a fresh page file with an initialized meta page.
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        let mut pf = PageFile { file, page_size };
        let meta = MetaPage::fresh();
        pf.write(META_PAGE_ID, &meta.to_page(page_size))?;
        Ok(pf)
    }

    /// Open an existing page file.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(PageFile { file, page_size })
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Read and checksum-verify a page.
    pub fn read(&mut self, page_id: PageId) -> Result<Page> {
        let mut buf = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        self.file.read_exact(&mut buf)?;
        Page::from_bytes(&buf, self.page_size).map_err(Error::corruption)
    }

    /// Write a page's full contents at its slot, extending the file if
    /// the slot does not yet exist (sparse growth).
    pub fn write(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        let offset = page_id as u64 * self.page_size as u64;
        let min_len = offset + self.page_size as u64;
        if self.file.metadata()?.len() < min_len {
            self.file.set_len(min_len)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&page.to_bytes(self.page_size))?;
        Ok(())
    }

    /// Write already-serialized page bytes (as captured in a WAL update
    /// record's `after` image) directly at `page_id`'s slot, extending
    /// the file if needed. Used by crash recovery, which replays raw
    /// page images rather than re-deriving them through [`Page`].
    pub fn write_raw(&mut self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        let offset = page_id as u64 * self.page_size as u64;
        let min_len = offset + self.page_size as u64;
        if self.file.metadata()?.len() < min_len {
            self.file.set_len(min_len)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// fsync the underlying file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Read and decode the meta page.
    pub fn read_meta(&mut self) -> Result<MetaPage> {
        self.read(META_PAGE_ID).map(|p| MetaPage::from_page(&p))
    }

    /// Encode and write the meta page.
    pub fn write_meta(&mut self, meta: &MetaPage) -> Result<()> {
        self.write(META_PAGE_ID, &meta.to_page(self.page_size))
    }
}

/// Default page size re-exported for config defaults.
pub const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_file_has_sane_meta_defaults() {
        let dir = tempdir().unwrap();
        let mut pf = PageFile::create(&dir.path().join("pages.db"), PAGE_SIZE).unwrap();
        let meta = pf.read_meta().unwrap();
        assert_eq!(meta.catalog_root, NONE_PAGE);
        assert_eq!(meta.free_list_head, NONE_PAGE);
        assert_eq!(meta.next_page_id, META_PAGE_ID + 1);
    }

    #[test]
    fn write_then_read_round_trips_and_extends_file() {
        let dir = tempdir().unwrap();
        let mut pf = PageFile::create(&dir.path().join("pages.db"), PAGE_SIZE).unwrap();
        let mut page = Page::new(5, PageKind::BTreeLeaf, PAGE_SIZE);
        page.body[0] = 42;
        pf.write(5, &page).unwrap();
        let read_back = pf.read(5).unwrap();
        assert_eq!(read_back.body[0], 42);
    }

    #[test]
    fn reopen_preserves_meta_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let mut pf = PageFile::create(&path, PAGE_SIZE).unwrap();
            let mut meta = pf.read_meta().unwrap();
            meta.catalog_root = 3;
            pf.write_meta(&meta).unwrap();
        }
        let mut pf = PageFile::open(&path, PAGE_SIZE).unwrap();
        assert_eq!(pf.read_meta().unwrap().catalog_root, 3);
    }
}
