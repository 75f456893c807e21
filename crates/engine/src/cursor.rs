//! Cursor manager (§4.11): tracks open query results so a client can
//! page through them with `next_batch`/`close` instead of returning an
//! unbounded result set in one call.
//!
//! [`lauradb_storage::btree::BTree::scan`] already materializes its
//! range into a sorted `Vec`, so a cursor's "resumable position" is
//! just an index into that buffered result rather than a literal
//! `(page_id, slot_index)` pair re-derived from the tree on every
//! batch; the tree has already done the page-chasing once by the time
//! a cursor exists.

use lauradb_core::value::Document;
use lauradb_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct CursorState {
    documents: Vec<Document>,
    position: usize,
    last_touched: Instant,
    timeout: Duration,
}

impl CursorState {
    fn is_expired(&self) -> bool {
        self.last_touched.elapsed() > self.timeout
    }
}

/// Process-wide registry of open cursors, keyed by cursor id.
pub struct CursorManager {
    next_id: AtomicU64,
    cursors: Mutex<HashMap<u64, CursorState>>,
}

impl Default for CursorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorManager {
    pub fn new() -> Self {
        CursorManager {
            next_id: AtomicU64::new(1),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fully materialized result set under a fresh cursor id.
    pub fn create(&self, documents: Vec<Document>, timeout: Duration) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().insert(
            id,
            CursorState { documents, position: 0, last_touched: Instant::now(), timeout },
        );
        id
    }

    /// Fetch up to `batch_size` more documents. An empty result means
    /// the cursor is exhausted; the caller should still `close` it.
    pub fn next_batch(&self, cursor_id: u64, batch_size: usize) -> Result<Vec<Document>> {
        let mut cursors = self.cursors.lock();
        let state = cursors
            .get_mut(&cursor_id)
            .ok_or_else(|| Error::not_found(format!("no such cursor: {cursor_id}")))?;
        if state.is_expired() {
            cursors.remove(&cursor_id);
            return Err(Error::not_found(format!("cursor {cursor_id} timed out")));
        }
        let end = (state.position + batch_size).min(state.documents.len());
        let batch = state.documents[state.position..end].to_vec();
        state.position = end;
        state.last_touched = Instant::now();
        Ok(batch)
    }

    pub fn close(&self, cursor_id: u64) {
        self.cursors.lock().remove(&cursor_id);
    }

    /// Remove any cursor that has gone unused past its timeout. Intended
    /// to be called periodically by a background sweeper.
    pub fn sweep_expired(&self) -> usize {
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|_, state| !state.is_expired());
        before - cursors.len()
    }

    pub fn is_exhausted(&self, cursor_id: u64) -> Result<bool> {
        let cursors = self.cursors.lock();
        let state = cursors
            .get(&cursor_id)
            .ok_or_else(|| Error::not_found(format!("no such cursor: {cursor_id}")))?;
        Ok(state.position >= state.documents.len())
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(n: i64) -> Document {
        let mut d = Document::new();
        d.set("n", lauradb_core::Value::Int64(n));
        d
    }

    #[test]
    fn batches_page_through_in_order() {
        let mgr = CursorManager::new();
        let id = mgr.create(vec![doc(1), doc(2), doc(3)], Duration::from_secs(60));
        let first = mgr.next_batch(id, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = mgr.next_batch(id, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert!(mgr.is_exhausted(id).unwrap());
    }

    #[test]
    fn close_forgets_the_cursor() {
        let mgr = CursorManager::new();
        let id = mgr.create(vec![doc(1)], Duration::from_secs(60));
        mgr.close(id);
        assert!(mgr.next_batch(id, 1).is_err());
    }

    #[test]
    fn expired_cursor_is_rejected_and_swept() {
        let mgr = CursorManager::new();
        let id = mgr.create(vec![doc(1)], Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(mgr.next_batch(id, 1).is_err());
        assert_eq!(mgr.len(), 0);
    }
}
