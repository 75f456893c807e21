//! A single WAL segment file.
//!
//! Segments are named `wal-{number:06}.seg`. Only the active (highest
//! numbered) segment is writable; closed segments are immutable and are
//! eligible for truncation once a checkpoint has passed them.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"LWAL";
/// Current on-disk segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;
/// Size of the fixed segment header, in bytes.
pub const SEGMENT_HEADER_SIZE: u64 = 16;

fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("wal-{number:06}.seg"))
}

/// An open, append-only segment file.
pub struct WalSegment {
    file: File,
    /// Segment number, used to order segments during recovery.
    pub number: u64,
    path: PathBuf,
    write_position: u64,
}

impl WalSegment {
    /// Create a new segment, writing its header.
    pub fn create(dir: &Path, number: u64) -> io::Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        file.write_u32::<BigEndian>(u32::from_be_bytes(SEGMENT_MAGIC))?;
        file.write_u32::<BigEndian>(SEGMENT_FORMAT_VERSION)?;
        file.write_u64::<BigEndian>(number)?;
        file.sync_all()?;
        Ok(WalSegment {
            file,
            number,
            path,
            write_position: SEGMENT_HEADER_SIZE,
        })
    }

    /// Open an existing segment for appending, seeking to end-of-file.
    pub fn open_append(dir: &Path, number: u64) -> io::Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(WalSegment {
            file,
            number,
            path,
            write_position: len,
        })
    }

    /// Open an existing segment read-only, for recovery replay or
    /// truncation scans.
    pub fn open_read(dir: &Path, number: u64) -> io::Result<BufReader<File>> {
        let path = segment_path(dir, number);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
        Ok(BufReader::new(file))
    }

    /// Append raw bytes (an encoded WAL record) to this segment.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.write_position += bytes.len() as u64;
        Ok(())
    }

    /// Durably persist everything written so far.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Current size of the segment in bytes, header included.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// Remove the underlying file. Only safe once a checkpoint has
    /// passed this segment's highest LSN.
    pub fn delete(dir: &Path, number: u64) -> io::Result<()> {
        std::fs::remove_file(segment_path(dir, number))
    }

    /// List segment numbers present in `dir`, ascending.
    pub fn list(dir: &Path) -> io::Result<Vec<u64>> {
        let mut numbers = Vec::new();
        if !dir.exists() {
            return Ok(numbers);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("wal-").and_then(|s| s.strip_suffix(".seg")) {
                if let Ok(n) = rest.parse::<u64>() {
                    numbers.push(n);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

/// Validate a segment's header, returning its declared segment number.
pub fn read_header<R: Read>(reader: &mut R) -> io::Result<u64> {
    let magic = reader.read_u32::<BigEndian>()?;
    if magic != u32::from_be_bytes(SEGMENT_MAGIC) {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad segment magic"));
    }
    let _version = reader.read_u32::<BigEndian>()?;
    reader.read_u64::<BigEndian>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_for_append() {
        let dir = tempdir().unwrap();
        {
            let mut seg = WalSegment::create(dir.path(), 1).unwrap();
            seg.append(b"hello").unwrap();
            seg.sync().unwrap();
        }
        let seg = WalSegment::open_append(dir.path(), 1).unwrap();
        assert_eq!(seg.size(), SEGMENT_HEADER_SIZE + 5);
    }

    #[test]
    fn list_returns_sorted_segment_numbers() {
        let dir = tempdir().unwrap();
        WalSegment::create(dir.path(), 3).unwrap();
        WalSegment::create(dir.path(), 1).unwrap();
        WalSegment::create(dir.path(), 2).unwrap();
        assert_eq!(WalSegment::list(dir.path()).unwrap(), vec![1, 2, 3]);
    }
}
