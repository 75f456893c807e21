//! Byte encoding for [`WalRecord`]s.
//!
//! Layout: `[len:u32][lsn:u64][tx_id:u64][kind_tag:u8][kind payload][crc32:u32]`.
//! `len` covers everything between itself and the CRC (exclusive of both).

use crate::record::{RecordKind, TxId, WalRecord};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{self, Cursor, Read, Write};

/// Encode a record to its on-disk byte representation.
pub fn encode_record(record: &WalRecord) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u64::<BigEndian>(record.lsn).unwrap();
    body.write_u64::<BigEndian>(record.tx_id).unwrap();
    body.write_u8(record.kind.tag()).unwrap();
    match &record.kind {
        RecordKind::Begin | RecordKind::Commit | RecordKind::Abort => {}
        RecordKind::Update {
            page_id,
            before,
            after,
        } => {
            body.write_u32::<BigEndian>(*page_id).unwrap();
            body.write_u32::<BigEndian>(before.len() as u32).unwrap();
            body.extend_from_slice(before);
            body.write_u32::<BigEndian>(after.len() as u32).unwrap();
            body.extend_from_slice(after);
        }
        RecordKind::IndexOp { description } => {
            let bytes = description.as_bytes();
            body.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
            body.extend_from_slice(bytes);
        }
        RecordKind::Checkpoint { up_to_lsn } => {
            body.write_u64::<BigEndian>(*up_to_lsn).unwrap();
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + body.len() + 4);
    out.write_u32::<BigEndian>(body.len() as u32).unwrap();
    out.extend_from_slice(&body);
    out.write_u32::<BigEndian>(crc).unwrap();
    out
}

/// Decode a single record from a reader, positioned at the start of a
/// record frame. Returns `Ok(None)` at a clean end-of-stream boundary.
pub fn decode_record<R: Read>(reader: &mut R) -> io::Result<Option<WalRecord>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(l) => l,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    let stored_crc = reader.read_u32::<BigEndian>()?;

    let mut hasher = Hasher::new();
    hasher.update(&body);
    if hasher.finalize() != stored_crc {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "WAL record checksum mismatch",
        ));
    }

    let mut cur = Cursor::new(body);
    let lsn = cur.read_u64::<BigEndian>()?;
    let tx_id: TxId = cur.read_u64::<BigEndian>()?;
    let tag = cur.read_u8()?;
    let kind = match tag {
        1 => RecordKind::Begin,
        2 => {
            let page_id = cur.read_u32::<BigEndian>()?;
            let before_len = cur.read_u32::<BigEndian>()? as usize;
            let mut before = vec![0u8; before_len];
            cur.read_exact(&mut before)?;
            let after_len = cur.read_u32::<BigEndian>()? as usize;
            let mut after = vec![0u8; after_len];
            cur.read_exact(&mut after)?;
            RecordKind::Update {
                page_id,
                before,
                after,
            }
        }
        3 => {
            let dlen = cur.read_u32::<BigEndian>()? as usize;
            let mut buf = vec![0u8; dlen];
            cur.read_exact(&mut buf)?;
            let description = String::from_utf8(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            RecordKind::IndexOp { description }
        }
        4 => RecordKind::Commit,
        5 => RecordKind::Abort,
        6 => {
            let up_to_lsn = cur.read_u64::<BigEndian>()?;
            RecordKind::Checkpoint { up_to_lsn }
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown WAL record tag {other}"),
            ))
        }
    };

    Ok(Some(WalRecord { lsn, tx_id, kind }))
}

/// Write a record and flush the writer's internal buffering (not fsync).
pub fn write_record<W: Write>(writer: &mut W, record: &WalRecord) -> io::Result<usize> {
    let bytes = encode_record(record);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_record_kind() {
        let records = vec![
            WalRecord {
                lsn: 1,
                tx_id: 7,
                kind: RecordKind::Begin,
            },
            WalRecord {
                lsn: 2,
                tx_id: 7,
                kind: RecordKind::Update {
                    page_id: 42,
                    before: vec![1, 2, 3],
                    after: vec![4, 5, 6],
                },
            },
            WalRecord {
                lsn: 3,
                tx_id: 7,
                kind: RecordKind::IndexOp {
                    description: "create_index:email_1".into(),
                },
            },
            WalRecord {
                lsn: 4,
                tx_id: 7,
                kind: RecordKind::Commit,
            },
            WalRecord {
                lsn: 5,
                tx_id: 0,
                kind: RecordKind::Checkpoint { up_to_lsn: 4 },
            },
        ];

        let mut buf = Vec::new();
        for r in &records {
            write_record(&mut buf, r).unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for expected in &records {
            let got = decode_record(&mut cursor).unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(decode_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let record = WalRecord {
            lsn: 1,
            tx_id: 1,
            kind: RecordKind::Commit,
        };
        let mut bytes = encode_record(&record);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut cursor = Cursor::new(bytes);
        assert!(decode_record(&mut cursor).is_err());
    }
}
