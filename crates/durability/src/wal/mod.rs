//! Write-ahead log: segmented storage, group-commit writer, forward
//! reader for recovery.

pub mod mode;
pub mod reader;
pub mod segment;
pub mod writer;

pub use mode::DurabilityMode;
pub use reader::WalReader;
pub use segment::WalSegment;
pub use writer::WalWriter;
