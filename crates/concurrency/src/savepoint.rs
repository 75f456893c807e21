//! Nested savepoint stack (§4.7).
//!
//! A savepoint just remembers how far into the transaction's undo log it
//! was created; rolling back means replaying everything recorded after
//! that mark. Savepoints nest: rolling back to an outer one also
//! discards every savepoint created inside it.

use lauradb_core::{Error, Result};

/// One entry on the stack: an optional name and the undo-log length at
/// the moment it was created.
#[derive(Debug, Clone)]
struct SavepointMark {
    name: String,
    undo_len: usize,
}

/// Stack of active savepoints for one transaction.
#[derive(Debug, Default)]
pub struct SavepointStack {
    marks: Vec<SavepointMark>,
}

impl SavepointStack {
    pub fn new() -> Self {
        SavepointStack { marks: Vec::new() }
    }

    /// Push a new savepoint recording the current undo-log length.
    pub fn create(&mut self, name: String, undo_len: usize) {
        self.marks.push(SavepointMark { name, undo_len });
    }

    /// Find `name`, pop it and everything created after it, and return
    /// the undo-log length to truncate back to.
    pub fn rollback_to(&mut self, name: &str) -> Result<usize> {
        let idx = self.position(name)?;
        let mark = self.marks[idx].clone();
        self.marks.truncate(idx);
        Ok(mark.undo_len)
    }

    /// Find `name` and drop it (and anything nested inside it) from the
    /// stack without returning an undo mark; the caller keeps those
    /// writes, they just fold into the enclosing scope.
    pub fn release(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        self.marks.truncate(idx);
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.marks
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| Error::not_found(format!("no such savepoint: {name}")))
    }

    /// Number of active savepoints, for diagnostics.
    pub fn depth(&self) -> usize {
        self.marks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_to_outer_savepoint_drops_nested_ones() {
        let mut stack = SavepointStack::new();
        stack.create("outer".into(), 0);
        stack.create("inner".into(), 3);
        let mark = stack.rollback_to("outer").unwrap();
        assert_eq!(mark, 0);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn release_keeps_undo_entries_but_drops_the_marker() {
        let mut stack = SavepointStack::new();
        stack.create("a".into(), 0);
        stack.release("a").unwrap();
        assert_eq!(stack.depth(), 0);
        assert!(stack.rollback_to("a").is_err());
    }

    #[test]
    fn unknown_savepoint_name_is_not_found() {
        let mut stack = SavepointStack::new();
        assert!(stack.rollback_to("nope").is_err());
    }
}
