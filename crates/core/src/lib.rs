//! Core types shared across every LauraDB crate.
//!
//! - [`Value`] / [`Document`]: the dynamic document model.
//! - [`ObjectId`]: 12-byte document identifiers.
//! - `key`: byte-ordered key encoding for the B+tree.
//! - [`Error`] / [`ErrorKind`]: the unified error taxonomy.
//! - [`Limits`]: configurable document/key size ceilings.

#![warn(clippy::all)]

pub mod error;
pub mod key;
pub mod limits;
pub mod object_id;
pub mod value;

pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use limits::Limits;
pub use object_id::ObjectId;
pub use value::{Document, TypeTag, Value};
