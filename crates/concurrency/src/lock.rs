//! Exclusive-lock manager with wait-for-graph deadlock detection (§4.6).
//!
//! Writers take an exclusive lock on the documents they touch before
//! writing; readers go through MVCC snapshots instead and never wait
//! here. When a lock is contended, the acquiring transaction records a
//! wait-for edge and blocks on a condition variable (the same
//! leader/follower shape as [`lauradb_durability::WalWriter`]'s group
//! commit). Before blocking it walks the wait-for chain looking for a
//! cycle back to itself; if one exists, the youngest transaction in the
//! cycle is the deadlock victim and aborts immediately rather than
//! waiting. A bounded wait timeout backstops any cycle this
//! transaction's view can't see.

use lauradb_core::{Error, Result};
use lauradb_durability::TxId;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// A lockable resource: a single key within a single collection (or
/// index), addressed by its encoded key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub collection: String,
    pub key: Vec<u8>,
}

impl ResourceKey {
    pub fn new(collection: impl Into<String>, key: Vec<u8>) -> Self {
        ResourceKey {
            collection: collection.into(),
            key,
        }
    }
}

struct LockState {
    owners: FxHashMap<ResourceKey, TxId>,
    waiting_for: FxHashMap<TxId, TxId>,
}

/// Exclusive lock table shared by every open transaction.
pub struct LockManager {
    state: Mutex<LockState>,
    cv: Condvar,
    wait_timeout: Duration,
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        LockManager {
            state: Mutex::new(LockState {
                owners: FxHashMap::default(),
                waiting_for: FxHashMap::default(),
            }),
            cv: Condvar::new(),
            wait_timeout,
        }
    }

    /// Acquire an exclusive lock on `resource` for `tx_id`, blocking if
    /// another transaction holds it. Re-entrant: a transaction that
    /// already owns the lock returns immediately.
    pub fn acquire(&self, tx_id: TxId, resource: &ResourceKey) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match state.owners.get(resource) {
                None => {
                    state.owners.insert(resource.clone(), tx_id);
                    state.waiting_for.remove(&tx_id);
                    return Ok(());
                }
                Some(&holder) if holder == tx_id => {
                    state.waiting_for.remove(&tx_id);
                    return Ok(());
                }
                Some(&holder) => {
                    state.waiting_for.insert(tx_id, holder);
                    if let Some(cycle) = find_cycle(&state.waiting_for, tx_id) {
                        let victim = *cycle.iter().max().unwrap();
                        if victim == tx_id {
                            state.waiting_for.remove(&tx_id);
                            warn!(target: "lauradb::lock", tx_id, cycle = ?cycle, "deadlock detected, aborting youngest transaction");
                            return Err(Error::conflict(
                                "deadlock detected; aborting the youngest transaction in the cycle",
                            ));
                        }
                        // Not the victim: fall through and wait. The
                        // actual victim resolves the cycle either by
                        // hitting this same check on its own next
                        // acquire, or by timing out below.
                    }
                }
            }

            let deadline = Instant::now() + self.wait_timeout;
            let timed_out = self.cv.wait_until(&mut state, deadline).timed_out();
            if timed_out {
                state.waiting_for.remove(&tx_id);
                return Err(Error::timeout(format!(
                    "timed out waiting for lock on {:?}",
                    resource.key
                )));
            }
        }
    }

    /// Release every lock held by `tx_id` (called on commit or abort).
    pub fn release_all(&self, tx_id: TxId) {
        let mut state = self.state.lock();
        state.owners.retain(|_, &mut owner| owner != tx_id);
        state.waiting_for.remove(&tx_id);
        self.cv.notify_all();
    }
}

/// Walk `waiting_for` starting at `start`; if it loops back to `start`,
/// return the full cycle (including `start`).
fn find_cycle(waiting_for: &FxHashMap<TxId, TxId>, start: TxId) -> Option<Vec<TxId>> {
    let mut path = vec![start];
    let mut current = start;
    loop {
        match waiting_for.get(&current) {
            Some(&next) if next == start => return Some(path),
            Some(&next) if path.contains(&next) => return None, // cycle not involving start
            Some(&next) => {
                path.push(next);
                current = next;
            }
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(k: u8) -> ResourceKey {
        ResourceKey::new("docs", vec![k])
    }

    #[test]
    fn second_acquirer_blocks_until_release() {
        let lm = LockManager::new(Duration::from_millis(200));
        lm.acquire(1, &res(1)).unwrap();
        lm.release_all(1);
        lm.acquire(2, &res(1)).unwrap(); // would have blocked forever pre-release
    }

    #[test]
    fn same_tx_can_reacquire_its_own_lock() {
        let lm = LockManager::new(Duration::from_millis(200));
        lm.acquire(1, &res(1)).unwrap();
        lm.acquire(1, &res(1)).unwrap();
    }

    #[test]
    fn deadlock_cycle_aborts_the_younger_transaction() {
        let lm = LockManager::new(Duration::from_millis(200));
        lm.acquire(1, &res(1)).unwrap();
        lm.acquire(2, &res(2)).unwrap();
        {
            let mut state = lm.state.lock();
            state.waiting_for.insert(1, 2);
        }
        let err = lm.acquire(2, &res(1)).unwrap_err();
        assert_eq!(err.kind, lauradb_core::ErrorKind::Conflict);
    }

    #[test]
    fn contended_lock_times_out() {
        let lm = LockManager::new(Duration::from_millis(30));
        lm.acquire(1, &res(1)).unwrap();
        let err = lm.acquire(2, &res(1)).unwrap_err();
        assert_eq!(err.kind, lauradb_core::ErrorKind::Timeout);
    }
}
