//! Durable append-only operation log, consumed by change streams (§4.12).
//!
//! The oplog is a file distinct from the WAL: it exists purely so that
//! change-stream subscribers can tail committed mutations without taking
//! a dependency on the WAL's crash-recovery bookkeeping (checkpoints,
//! segment truncation). Every committed mutation of user data appends
//! exactly one [`OplogEntry`] here.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use lauradb_core::{Document, ObjectId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The kind of mutation an oplog entry records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OpType {
    /// A new document was inserted.
    Insert,
    /// An existing document was modified.
    Update,
    /// A document was removed.
    Delete,
    /// A secondary index was created.
    CreateIndex,
    /// A secondary index was dropped.
    DropIndex,
    /// A collection was created.
    CreateCollection,
    /// A collection, and all its data, was dropped.
    DropCollection,
}

/// One durable, ordered mutation event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OplogEntry {
    /// LSN of the WAL commit record this entry corresponds to; entries
    /// are delivered to subscribers in this order (§5).
    pub lsn: u64,
    /// Wall-clock milliseconds since epoch when the entry was appended.
    pub timestamp_ms: i64,
    /// What kind of mutation this is.
    pub op: OpType,
    /// Logical database name (LauraDB is single-database per `open()`,
    /// kept for forward compatibility with the external façade).
    pub database: String,
    /// Collection the mutation applied to.
    pub collection: String,
    /// Affected document id, when the entry concerns a single document.
    pub doc_id: Option<ObjectId>,
    /// Full post-image for inserts; `None` otherwise.
    pub document: Option<Document>,
    /// Pre-image for updates/deletes, letting a validator or audit log
    /// reconstruct what changed.
    pub pre_image: Option<Document>,
}

/// An opaque, totally ordered position in the oplog. `lsn` alone is
/// sufficient to resume a change stream with no gaps (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResumeToken(pub u64);

/// Append-only oplog writer.
pub struct OplogWriter {
    file: File,
}

impl OplogWriter {
    /// Open (or create) `oplog.bin` under `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(OplogWriter { file })
    }

    /// Append one entry, returning its resume token.
    pub fn append(&mut self, entry: &OplogEntry) -> io::Result<ResumeToken> {
        let body = serde_json::to_vec(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        self.file.write_u32::<BigEndian>(body.len() as u32)?;
        self.file.write_all(&body)?;
        self.file.write_u32::<BigEndian>(crc)?;
        self.file.sync_data()?;
        Ok(ResumeToken(entry.lsn))
    }
}

/// Forward-only reader over the oplog, used both by recovery-time replay
/// of pending subscribers and by live tailing.
pub struct OplogReader {
    reader: BufReader<File>,
}

impl OplogReader {
    /// Open the oplog for reading from its start.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(OplogReader {
            reader: BufReader::new(file),
        })
    }

    /// Read every entry, used to seek to a resume point. Returns entries
    /// with `lsn > after.0`, or all entries if `after` is `None`.
    pub fn read_from(&mut self, after: Option<ResumeToken>) -> io::Result<Vec<OplogEntry>> {
        self.reader.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        loop {
            let len = match self.reader.read_u32::<BigEndian>() {
                Ok(l) => l,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let mut body = vec![0u8; len as usize];
            self.reader.read_exact(&mut body)?;
            let stored_crc = self.reader.read_u32::<BigEndian>()?;
            let mut hasher = Hasher::new();
            hasher.update(&body);
            if hasher.finalize() != stored_crc {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "oplog entry checksum mismatch"));
            }
            let entry: OplogEntry = serde_json::from_slice(&body)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if after.map_or(true, |tok| entry.lsn > tok.0) {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

/// Default file name for the oplog under `data_dir`.
pub fn oplog_path(data_dir: &Path) -> PathBuf {
    data_dir.join("oplog.bin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(lsn: u64) -> OplogEntry {
        OplogEntry {
            lsn,
            timestamp_ms: 0,
            op: OpType::Insert,
            database: "db".into(),
            collection: "users".into(),
            doc_id: Some(ObjectId::new()),
            document: None,
            pre_image: None,
        }
    }

    #[test]
    fn resume_from_token_yields_only_later_entries() {
        let dir = tempdir().unwrap();
        let path = oplog_path(dir.path());
        {
            let mut w = OplogWriter::open(&path).unwrap();
            w.append(&sample(1)).unwrap();
            let tok = w.append(&sample(2)).unwrap();
            w.append(&sample(3)).unwrap();
            w.append(&sample(4)).unwrap();
            let mut r = OplogReader::open(&path).unwrap();
            let entries = r.read_from(Some(tok)).unwrap();
            assert_eq!(entries.iter().map(|e| e.lsn).collect::<Vec<_>>(), vec![3, 4]);
        }
    }

    #[test]
    fn read_from_none_returns_everything() {
        let dir = tempdir().unwrap();
        let path = oplog_path(dir.path());
        let mut w = OplogWriter::open(&path).unwrap();
        w.append(&sample(1)).unwrap();
        w.append(&sample(2)).unwrap();
        let mut r = OplogReader::open(&path).unwrap();
        assert_eq!(r.read_from(None).unwrap().len(), 2);
    }
}
