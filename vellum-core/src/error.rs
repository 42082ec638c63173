//! Error types for Vellum operations.

use std::io;
use thiserror::Error;

/// The main error type for Vellum operations.
#[derive(Debug, Error)]
pub enum VellumError {
    /// Connection-related errors (network failures, disconnections).
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol-related errors (malformed frames, unknown enum values).
    ///
    /// An unrecognized wire value is a programming-bug signal and aborts
    /// the operation instead of silently defaulting.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request could not be completed within its timeout budget.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Invalid caller-supplied argument (bad expiry, empty key, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request was cancelled before it could complete.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// The document already exists or the cas token no longer matches.
    #[error("document '{key}' exists or cas mismatch")]
    DocumentExists {
        /// The document key.
        key: String,
    },

    /// The document was not found.
    #[error("document '{key}' not found")]
    DocumentNotFound {
        /// The document key.
        key: String,
    },

    /// The value was too large to be stored.
    #[error("value for document '{key}' is too large")]
    ValueTooLarge {
        /// The document key.
        key: String,
    },

    /// The server reported a temporary failure; safe to retry.
    #[error("temporary failure on document '{key}'")]
    TemporaryFailure {
        /// The document key.
        key: String,
    },

    /// The server is out of memory; safe to retry.
    #[error("server out of memory handling document '{key}'")]
    ServerOutOfMemory {
        /// The document key.
        key: String,
    },

    /// The server is busy; safe to retry.
    #[error("server busy handling document '{key}'")]
    ServerBusy {
        /// The document key.
        key: String,
    },

    /// A status with no specific mapping; surfaced generically.
    #[error("server returned status {status:#06x} for document '{key}'")]
    UnexpectedStatus {
        /// The raw wire status.
        status: u16,
        /// The document key.
        key: String,
    },

    /// A sub-document (path-level) error.
    #[error(transparent)]
    Subdoc(#[from] SubdocError),

    /// Durability could not be confirmed before the timeout; the mutation
    /// itself may still have succeeded.
    #[error("durability ambiguous: {0}")]
    DurabilityAmbiguous(String),

    /// The requested durability exceeds what the cluster topology can
    /// ever satisfy.
    #[error("durability impossible: {0}")]
    DurabilityImpossible(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Path-level errors raised by the sub-document protocol.
#[derive(Debug, Error)]
pub enum SubdocError {
    /// The requested path does not exist in the document.
    #[error("subdoc path '{path}' not found in document '{key}'")]
    PathNotFound {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The path exists but its type does not match the operation.
    #[error("subdoc path '{path}' mismatch in document '{key}'")]
    PathMismatch {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The path is not syntactically valid.
    #[error("subdoc path '{path}' is invalid in document '{key}'")]
    PathInvalid {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The path is deeper than the server allows.
    #[error("subdoc path '{path}' too deep in document '{key}'")]
    PathTooDeep {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The path already exists and the operation required it not to.
    #[error("subdoc path '{path}' already exists in document '{key}'")]
    PathExists {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The value cannot be inserted at the given path.
    #[error("subdoc value cannot be inserted at '{path}' in document '{key}'")]
    CannotInsertValue {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// Inserting the value would make the document too deep.
    #[error("subdoc value at '{path}' would nest document '{key}' too deep")]
    ValueTooDeep {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The number at the path is out of range for a counter operation.
    #[error("subdoc number at '{path}' out of range in document '{key}'")]
    NumberTooBig {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The counter delta is zero or out of range.
    #[error("subdoc delta invalid at '{path}' in document '{key}'")]
    DeltaInvalid {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },

    /// The document is not JSON, so no sub-document operation can apply.
    #[error("document '{key}' is not JSON")]
    DocumentNotJson {
        /// The document key.
        key: String,
    },

    /// The document is nested deeper than the server allows.
    #[error("document '{key}' is too deep")]
    DocumentTooDeep {
        /// The document key.
        key: String,
    },

    /// An xattr-specific failure on the given path.
    #[error("subdoc xattr failure at '{path}' in document '{key}'")]
    XattrFailure {
        /// The offending path.
        path: String,
        /// The document key.
        key: String,
    },
}

/// A specialized `Result` type for Vellum operations.
pub type Result<T> = std::result::Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_not_found_display() {
        let err = VellumError::DocumentNotFound {
            key: "airline_10".to_string(),
        };
        assert_eq!(err.to_string(), "document 'airline_10' not found");
    }

    #[test]
    fn test_subdoc_error_display() {
        let err = SubdocError::PathNotFound {
            path: "geo.lat".to_string(),
            key: "airport_1254".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "subdoc path 'geo.lat' not found in document 'airport_1254'"
        );
    }

    #[test]
    fn test_subdoc_error_converts() {
        let err: VellumError = SubdocError::DocumentNotJson {
            key: "k".to_string(),
        }
        .into();
        assert!(matches!(err, VellumError::Subdoc(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err: VellumError = io_err.into();
        assert!(matches!(err, VellumError::Io(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_durability_errors_are_distinct() {
        let ambiguous = VellumError::DurabilityAmbiguous("unconfirmed".to_string());
        let impossible = VellumError::DurabilityImpossible("3 replicas requested".to_string());
        assert!(ambiguous.to_string().starts_with("durability ambiguous"));
        assert!(impossible.to_string().starts_with("durability impossible"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VellumError>();
        assert_send_sync::<SubdocError>();
    }
}
