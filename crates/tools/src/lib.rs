//! Offline maintenance tooling for LauraDB (§6, §9): JSON backup/restore
//! and the repair crate's index validator, fixer, and defragmenter.
//!
//! Everything here goes through [`lauradb_api::Database`]'s public
//! surface rather than touching pages directly, so a restored or
//! repaired database is byte-for-byte whatever the normal write path
//! would have produced.

pub mod backup;
pub mod repair;
pub mod restore;

pub use backup::{export, BackupCollection, BackupDocument, BackupFile, BackupIndex, BACKUP_VERSION};
pub use repair::{defragment_collection, repair as repair_index, validate, validate_and_repair, DefragReport, IndexIssue, ValidationReport};
pub use restore::import;
