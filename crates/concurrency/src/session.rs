//! A client session: at most one active transaction at a time (§4.6).

use crate::transaction::TransactionContext;
use dashmap::DashMap;
use lauradb_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Holds the single in-flight transaction (if any) for one logical
/// client connection. Cursor lifetime is tracked one layer up, in the
/// engine's cursor manager, since a cursor can outlive the transaction
/// that created it.
pub struct Session {
    pub session_id: u64,
    active_tx: Option<TransactionContext>,
}

impl Session {
    pub fn new(session_id: u64) -> Self {
        Session {
            session_id,
            active_tx: None,
        }
    }

    /// Start a session-scoped transaction. Fails if one is already open.
    pub fn begin(&mut self, tx: TransactionContext) -> Result<()> {
        if self.active_tx.is_some() {
            return Err(Error::invalid_argument(
                "a transaction is already active on this session",
            ));
        }
        self.active_tx = Some(tx);
        Ok(())
    }

    /// The session's active transaction, if any.
    pub fn active(&mut self) -> Result<&mut TransactionContext> {
        self.active_tx
            .as_mut()
            .ok_or_else(|| Error::invalid_argument("no transaction is active on this session"))
    }

    /// Whether a transaction is currently open.
    pub fn has_active_transaction(&self) -> bool {
        self.active_tx.is_some()
    }

    /// Clear the active transaction after it has been committed or
    /// aborted by the caller.
    pub fn end(&mut self) -> Option<TransactionContext> {
        self.active_tx.take()
    }
}

/// Registry of live sessions, keyed by session id. Sharded internally
/// (via [`DashMap`]) so concurrent clients opening/closing unrelated
/// sessions don't serialize on one global lock, the same reasoning the
/// storage layer uses for its own per-key sharding.
pub struct SessionManager {
    next_id: AtomicU64,
    sessions: DashMap<u64, Arc<Mutex<Session>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            next_id: AtomicU64::new(1),
            sessions: DashMap::new(),
        }
    }

    /// Create a new session and register it, returning a shared handle.
    pub fn open(&self) -> Arc<Mutex<Session>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Mutex::new(Session::new(id)));
        self.sessions.insert(id, session.clone());
        session
    }

    /// Look up a previously opened session by id.
    pub fn get(&self, session_id: u64) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("no such session: {session_id}")))
    }

    /// Drop a session from the registry. Does not end any transaction
    /// it may still have open; callers must abort it first.
    pub fn close(&self, session_id: u64) {
        self.sessions.remove(&session_id);
    }

    /// Number of currently registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Snapshot;

    #[test]
    fn cannot_begin_a_second_transaction_while_one_is_active() {
        let mut session = Session::new(1);
        session.begin(TransactionContext::new(1, Snapshot::new(0))).unwrap();
        let err = session.begin(TransactionContext::new(2, Snapshot::new(0))).unwrap_err();
        assert_eq!(err.kind, lauradb_core::ErrorKind::InvalidArgument);
    }

    #[test]
    fn end_clears_the_active_transaction() {
        let mut session = Session::new(1);
        session.begin(TransactionContext::new(1, Snapshot::new(0))).unwrap();
        assert!(session.has_active_transaction());
        session.end();
        assert!(!session.has_active_transaction());
    }

    #[test]
    fn manager_issues_distinct_ids_and_forgets_closed_sessions() {
        let mgr = SessionManager::new();
        let a = mgr.open();
        let b = mgr.open();
        assert_ne!(a.lock().session_id, b.lock().session_id);
        assert_eq!(mgr.len(), 2);

        let id = a.lock().session_id;
        mgr.close(id);
        assert!(mgr.get(id).is_err());
        assert_eq!(mgr.len(), 1);
    }
}
