//! Error taxonomy shared by every layer of the database.
//!
//! All public operations return [`Error`], which carries a [`ErrorKind`]
//! plus structured context (collection, operator, key excerpt) so callers
//! can build good diagnostics without string-parsing messages.

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate family.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification. Matches the taxonomy in the system design:
/// each kind has a distinct retry/propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed filter/update spec, bad config, unknown operator.
    InvalidArgument,
    /// Collection/index/cursor/document absent where required.
    NotFound,
    /// Unique-key violation, deadlock, or write-write conflict.
    Conflict,
    /// Cursor expired or lock wait exceeded.
    Timeout,
    /// Buffer pool out of frames, or disk full.
    Exhausted,
    /// Checksum mismatch, unreachable page, or WAL invariant violation.
    Corruption,
    /// Underlying storage I/O failure.
    Io,
    /// Operator/feature not implemented in the requested context.
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Exhausted => "Exhausted",
            ErrorKind::Corruption => "Corruption",
            ErrorKind::Io => "Io",
            ErrorKind::Unsupported => "Unsupported",
        };
        f.write_str(s)
    }
}

/// Structured context attached to an [`Error`]. Every field is optional:
/// callers fill in whatever they know at the point of failure.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Collection the failing operation targeted, if any.
    pub collection: Option<String>,
    /// Operator name (`$set`, `$regex`, ...) implicated in the failure.
    pub operator: Option<String>,
    /// Short excerpt of the key involved, truncated for log safety.
    pub key_excerpt: Option<String>,
}

impl ErrorContext {
    /// Start building context for a given collection.
    pub fn for_collection(name: impl Into<String>) -> Self {
        ErrorContext {
            collection: Some(name.into()),
            ..Default::default()
        }
    }

    /// Attach an operator name.
    pub fn with_operator(mut self, op: impl Into<String>) -> Self {
        self.operator = Some(op.into());
        self
    }

    /// Attach a key excerpt, truncating to keep error messages bounded.
    pub fn with_key(mut self, key: impl fmt::Debug) -> Self {
        let mut s = format!("{:?}", key);
        s.truncate(80);
        self.key_excerpt = Some(s);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(c) = &self.collection {
            parts.push(format!("collection={c}"));
        }
        if let Some(o) = &self.operator {
            parts.push(format!("operator={o}"));
        }
        if let Some(k) = &self.key_excerpt {
            parts.push(format!("key={k}"));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// The unified error type returned by every public LauraDB API.
#[derive(Debug, Error)]
#[error("{kind}: {message}{}", context_suffix(.context))]
pub struct Error {
    /// Coarse classification; drives retry policy.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Structured context for diagnostics.
    pub context: ErrorContext,
}

fn context_suffix(ctx: &ErrorContext) -> String {
    if ctx.collection.is_none() && ctx.operator.is_none() && ctx.key_excerpt.is_none() {
        String::new()
    } else {
        format!(" ({ctx})")
    }
}

impl Error {
    /// Build an error of the given kind with a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Attach context to this error, returning the modified error.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Shorthand constructors, one per kind.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    /// Shorthand for [`ErrorKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for [`ErrorKind::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Conflict, message)
    }

    /// Shorthand for [`ErrorKind::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, message)
    }

    /// Shorthand for [`ErrorKind::Exhausted`].
    pub fn exhausted(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Exhausted, message)
    }

    /// Shorthand for [`ErrorKind::Corruption`].
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Corruption, message)
    }

    /// Shorthand for [`ErrorKind::Unsupported`].
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unsupported, message)
    }

    /// `Conflict` and `Deadlock` (a `Conflict`) are always safe to retry
    /// after a randomized backoff; `Timeout` is safe to retry directly.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Conflict | ErrorKind::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::InvalidArgument, format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::conflict("dup").is_retryable());
        assert!(Error::timeout("cursor").is_retryable());
        assert!(!Error::corruption("bad checksum").is_retryable());
    }

    #[test]
    fn context_renders_in_display() {
        let err = Error::not_found("no such document").with_context(
            ErrorContext::for_collection("users").with_operator("find_one"),
        );
        let s = err.to_string();
        assert!(s.contains("collection=users"));
        assert!(s.contains("operator=find_one"));
    }
}
