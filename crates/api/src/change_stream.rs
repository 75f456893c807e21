//! Change-stream subscriptions (§4.12, §6): `watch`/`next_event`/`close`.

use lauradb_core::Result;
use lauradb_engine::{ChangeEvent, ChangeStream};
use std::time::{Duration, Instant};

/// A live subscription returned by [`crate::Database::watch`].
pub struct Subscription {
    stream: ChangeStream,
    pending: std::collections::VecDeque<ChangeEvent>,
}

impl Subscription {
    pub(crate) fn new(stream: ChangeStream) -> Self {
        Subscription { stream, pending: std::collections::VecDeque::new() }
    }

    /// The resume token to hand back to `watch` after this subscription
    /// is closed, to pick up exactly where it left off.
    pub fn resume_token(&self) -> Option<lauradb_durability::oplog::ResumeToken> {
        self.stream.resume_token()
    }

    /// Block (polling the oplog) until the next matching event arrives
    /// or `timeout` elapses, whichever comes first. A `None` return
    /// means the deadline passed with nothing new — callers that want
    /// `Timeout` semantics per §5's cancellation contract can map that
    /// themselves; a `poll`-based subscription has no pinned resources
    /// to release on expiry, so there is nothing to surface as an error.
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<ChangeEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.stream.poll()?;
            if !batch.is_empty() {
                self.pending.extend(batch);
                return Ok(self.pending.pop_front());
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(20).min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// A subscription holds no pinned resources beyond its own state,
    /// so closing it is just dropping it; kept as an explicit method to
    /// match the §6 contract shape (`close(subscription)`).
    pub fn close(self) {}
}
