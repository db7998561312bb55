//! Error types for `fieldcrypt` operations.

use std::fmt;

use crate::key_id::KeyReference;
use crate::request::State;

/// Main error type for `fieldcrypt` operations.
///
/// Callers surface the `Display` message and branch on [`Error::kind`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid option at context creation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Schema is malformed or does not fit the command
    #[error("schema error: {0}")]
    Schema(String),

    /// Command or document buffer could not be parsed
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A supplied key record was rejected
    #[error("invalid key record ({applied} record(s) applied): {reason}")]
    KeyValidation {
        /// Records from the same batch that were applied successfully
        applied: usize,
        /// Why the first rejected record was rejected
        reason: String,
    },

    /// Field encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Authentication failure or malformed envelope
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// `finish` was called while key queries are outstanding
    #[error("request not ready: {} key reference(s) outstanding", .outstanding.len())]
    NotReady {
        /// References that still have no key
        outstanding: Vec<KeyReference>,
    },

    /// The request has already completed or failed
    #[error("operation not valid in state {0}")]
    InvalidState(State),
}

/// Machine-checkable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Config`].
    Config,
    /// See [`Error::Schema`].
    Schema,
    /// See [`Error::InvalidDocument`].
    InvalidDocument,
    /// See [`Error::KeyValidation`].
    KeyValidation,
    /// See [`Error::Encryption`].
    Encryption,
    /// See [`Error::Decryption`].
    Decryption,
    /// See [`Error::NotReady`].
    NotReady,
    /// See [`Error::InvalidState`].
    InvalidState,
}

impl Error {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Schema(_) => ErrorKind::Schema,
            Self::InvalidDocument(_) => ErrorKind::InvalidDocument,
            Self::KeyValidation { .. } => ErrorKind::KeyValidation,
            Self::Encryption(_) => ErrorKind::Encryption,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

/// Errors raised while unwrapping a data key with a KMS provider.
#[derive(Debug)]
pub enum KmsError {
    /// No provider registered for the record's master key
    ProviderNotRegistered(String),

    /// Provider credentials are unusable
    InvalidCredentials(String),

    /// Wrapping failed
    WrapFailed(String),

    /// Unwrapping failed
    UnwrapFailed(String),
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotRegistered(kind) => {
                write!(f, "no KMS provider registered for '{kind}'")
            }
            Self::InvalidCredentials(msg) => write!(f, "invalid KMS credentials: {msg}"),
            Self::WrapFailed(msg) => write!(f, "data key wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "data key unwrap failed: {msg}"),
        }
    }
}

impl std::error::Error for KmsError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_id::KeyId;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(
            Error::KeyValidation { applied: 1, reason: "bad".into() }.kind(),
            ErrorKind::KeyValidation
        );
        assert_eq!(Error::InvalidState(State::Completed).kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_not_ready_message_counts_references() {
        let err = Error::NotReady {
            outstanding: vec![
                KeyReference::Id(KeyId::parse("K1").unwrap()),
                KeyReference::AltName("payroll".into()),
            ],
        };
        assert_eq!(err.to_string(), "request not ready: 2 key reference(s) outstanding");
    }

    #[test]
    fn test_kms_error_display() {
        let err = KmsError::ProviderNotRegistered("aws".into());
        assert_eq!(err.to_string(), "no KMS provider registered for 'aws'");
    }
}
