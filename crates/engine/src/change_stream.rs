//! Change streams (§4.12): subscribe to a collection's committed
//! mutations, optionally filtered, resumable from any previously
//! observed [`ResumeToken`].
//!
//! Built directly on [`lauradb_durability::oplog`]; a stream is really
//! just a cursor over the oplog file scoped to one collection plus a
//! residual filter, so there is no separate in-memory fan-out queue to
//! keep consistent with the file on disk.

use crate::json::document_to_json;
use lauradb_core::{ObjectId, Result};
use lauradb_durability::oplog::{OpType, OplogEntry, OplogReader, ResumeToken};
use serde_json::Value as Json;
use std::path::PathBuf;

/// One change delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub resume_token: ResumeToken,
    pub op: OpType,
    pub collection: String,
    pub doc_id: Option<ObjectId>,
    pub document: Option<Json>,
}

fn to_event(entry: OplogEntry) -> ChangeEvent {
    ChangeEvent {
        resume_token: ResumeToken(entry.lsn),
        op: entry.op,
        collection: entry.collection,
        doc_id: entry.doc_id,
        document: entry.document.as_ref().map(document_to_json),
    }
}

/// A live subscription over one collection's oplog entries.
pub struct ChangeStream {
    oplog_path: PathBuf,
    collection: String,
    filter: Option<Json>,
    last_seen: Option<ResumeToken>,
}

impl ChangeStream {
    pub fn new(oplog_path: PathBuf, collection: impl Into<String>, filter: Option<Json>, resume_from: Option<ResumeToken>) -> Self {
        ChangeStream {
            oplog_path,
            collection: collection.into(),
            filter,
            last_seen: resume_from,
        }
    }

    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.last_seen
    }

    /// Pull every event appended since the last call (or since the
    /// stream's initial resume point), in LSN order. Advances the
    /// stream's resume position past every entry it even *considered*,
    /// matching for this collection or not, so a heartbeat position can
    /// always move forward even during a run with nothing to deliver.
    pub fn poll(&mut self) -> Result<Vec<ChangeEvent>> {
        let mut reader = OplogReader::open(&self.oplog_path)?;
        let entries = reader.read_from(self.last_seen)?;
        let mut out = Vec::new();
        for entry in entries {
            self.last_seen = Some(ResumeToken(entry.lsn));
            if entry.collection != self.collection {
                continue;
            }
            if let Some(filter) = &self.filter {
                let matched = match &entry.document {
                    Some(doc) => crate::query::filter::matches(filter, doc).unwrap_or(false),
                    None => true,
                };
                if !matched {
                    continue;
                }
            }
            out.push(to_event(entry));
        }
        Ok(out)
    }
}
