//! The error taxonomy shared by the repository store, the mutable tree,
//! fsck, and the signature envelope.
//!
//! Library code returns this enum (or wraps it in [`anyhow::Error`] once
//! a caller no longer needs to match on the variant) rather than a bare
//! `anyhow::Error`, so callers can distinguish "this object doesn't
//! exist" from "the store is corrupt" without string matching.

use std::fmt;

/// The taxonomy of failures a conforming implementation can surface.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// An object or ref that was looked up does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The on-disk encoding of an object was malformed: a length exceeded
    /// the remaining buffer, a required field was missing, or a sequence
    /// contained duplicate names.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// A stored object's content does not hash to its filename.
    #[error("corruption detected in object {checksum}: {detail}")]
    Corruption {
        /// The checksum under which the corrupt object is stored.
        checksum: String,
        /// A human-readable description of the mismatch.
        detail: String,
    },
    /// A commit is marked partial, or a traversal found a reachable
    /// object that is missing from the store.
    #[error("incomplete: {0}")]
    Incomplete(String),
    /// No signature in a commitmeta verified against the trust set.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    /// A configuration combination is not permitted (e.g. `transient` and
    /// `transient-ro` both set, or `composefs.enabled=signed` with no
    /// public key configured).
    #[error("policy violation: {0}")]
    Policy(String),
    /// An underlying syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A cooperative cancellation token was tripped mid-walk.
    #[error("cancelled")]
    Cancelled,
    /// prepare-root's sole user-visible failure mode: any error found
    /// while composing the boot root is fatal and carries one message.
    #[error("fatal boot error: {0}")]
    Fatal(String),
}

/// Our generic catchall result type for fallible operations that don't
/// need to distinguish [`CoreError`] variants at the call site.
pub type Result<T> = anyhow::Result<T>;

/// Result type for operations whose callers branch on the failure kind.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Construct a [`CoreError::NotFound`] from a displayable description.
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    /// Construct a [`CoreError::InvalidFormat`] from a displayable description.
    pub fn invalid_format(what: impl fmt::Display) -> Self {
        Self::InvalidFormat(what.to_string())
    }

    /// True if this is the variant produced when a traversal or fsck pass
    /// was aborted by a cancellation token rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(CoreError::not_found("abc123").to_string(), "not found: abc123");
        assert!(CoreError::Cancelled.is_cancelled());
        assert!(!CoreError::not_found("x").is_cancelled());
    }
}
