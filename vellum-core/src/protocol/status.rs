//! Response status codes and their mapping to typed errors.

use crate::error::{SubdocError, VellumError};

/// The closed set of wire status codes this core understands.
///
/// Decoding an unlisted value fails loudly via [`Status::from_raw`]; a new
/// server status must be added here before it can be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The key does not exist.
    KeyNotFound,
    /// The key exists (or the supplied cas token is stale).
    KeyExists,
    /// The value exceeds the server's size limit.
    TooBig,
    /// The arguments were rejected by the server.
    InvalidArguments,
    /// The item was not stored (append/prepend on a missing document).
    NotStored,
    /// A counter delta was rejected.
    DeltaBadValue,
    /// The partition is not owned by the receiving node.
    NotMyPartition,
    /// The server did not recognize the opcode.
    UnknownCommand,
    /// The server is out of memory; transient.
    OutOfMemory,
    /// The operation is not supported by this server.
    NotSupported,
    /// An internal server error.
    InternalError,
    /// The server is busy; transient.
    ServerBusy,
    /// A temporary failure; transient.
    TemporaryFailure,
    /// Sub-document: the path does not exist.
    SubdocPathNotFound,
    /// Sub-document: the path type does not match the operation.
    SubdocPathMismatch,
    /// Sub-document: the path is malformed.
    SubdocPathInvalid,
    /// Sub-document: the path is too deep.
    SubdocPathTooBig,
    /// Sub-document: the document is nested too deeply.
    SubdocDocTooDeep,
    /// Sub-document: the value cannot be inserted at the path.
    SubdocValueCannotInsert,
    /// Sub-document: the document is not JSON.
    SubdocDocNotJson,
    /// Sub-document: the number at the path is out of range.
    SubdocNumberTooBig,
    /// Sub-document: the delta is invalid.
    SubdocDeltaInvalid,
    /// Sub-document: the path already exists.
    SubdocPathExists,
    /// Sub-document: inserting the value would nest too deeply.
    SubdocValueTooDeep,
    /// Sub-document: the command combination is invalid.
    ///
    /// Deliberately never mapped to a typed error: it signals a
    /// caller-side programming defect and is passed through untouched.
    SubdocInvalidCombo,
    /// Sub-document: at least one command in a multi operation failed.
    SubdocMultiPathFailure,
    /// Sub-document: a failure specific to an xattr path.
    SubdocXattrFailure,
}

impl Status {
    /// Decodes a raw wire status.
    ///
    /// Returns a protocol error for values outside the closed set; callers
    /// must abort the operation rather than guess.
    pub fn from_raw(raw: u16) -> Result<Status, VellumError> {
        let status = match raw {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x04 => Status::InvalidArguments,
            0x05 => Status::NotStored,
            0x06 => Status::DeltaBadValue,
            0x07 => Status::NotMyPartition,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::ServerBusy,
            0x86 => Status::TemporaryFailure,
            0xc0 => Status::SubdocPathNotFound,
            0xc1 => Status::SubdocPathMismatch,
            0xc2 => Status::SubdocPathInvalid,
            0xc3 => Status::SubdocPathTooBig,
            0xc4 => Status::SubdocDocTooDeep,
            0xc5 => Status::SubdocValueCannotInsert,
            0xc6 => Status::SubdocDocNotJson,
            0xc7 => Status::SubdocNumberTooBig,
            0xc8 => Status::SubdocDeltaInvalid,
            0xc9 => Status::SubdocPathExists,
            0xca => Status::SubdocValueTooDeep,
            0xcb => Status::SubdocInvalidCombo,
            0xcc => Status::SubdocMultiPathFailure,
            0xd0 => Status::SubdocXattrFailure,
            other => {
                return Err(VellumError::Protocol(format!(
                    "unknown response status {:#06x}, this is a bug",
                    other
                )))
            }
        };
        Ok(status)
    }

    /// Returns the raw wire value of this status.
    pub fn raw(self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::TooBig => 0x03,
            Status::InvalidArguments => 0x04,
            Status::NotStored => 0x05,
            Status::DeltaBadValue => 0x06,
            Status::NotMyPartition => 0x07,
            Status::UnknownCommand => 0x81,
            Status::OutOfMemory => 0x82,
            Status::NotSupported => 0x83,
            Status::InternalError => 0x84,
            Status::ServerBusy => 0x85,
            Status::TemporaryFailure => 0x86,
            Status::SubdocPathNotFound => 0xc0,
            Status::SubdocPathMismatch => 0xc1,
            Status::SubdocPathInvalid => 0xc2,
            Status::SubdocPathTooBig => 0xc3,
            Status::SubdocDocTooDeep => 0xc4,
            Status::SubdocValueCannotInsert => 0xc5,
            Status::SubdocDocNotJson => 0xc6,
            Status::SubdocNumberTooBig => 0xc7,
            Status::SubdocDeltaInvalid => 0xc8,
            Status::SubdocPathExists => 0xc9,
            Status::SubdocValueTooDeep => 0xca,
            Status::SubdocInvalidCombo => 0xcb,
            Status::SubdocMultiPathFailure => 0xcc,
            Status::SubdocXattrFailure => 0xd0,
        }
    }

    /// Returns true if the operation succeeded.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Returns true for statuses that are retried by policy rather than
    /// surfaced to the caller.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::TemporaryFailure
                | Status::ServerBusy
                | Status::OutOfMemory
                | Status::NotMyPartition
        )
    }

    /// Maps a non-success, non-transient status to its typed error.
    ///
    /// Returns `None` for `Success` and for statuses without a 1:1 typed
    /// mapping; those surface generically via `UnexpectedStatus`.
    pub fn as_error(self, key: &str) -> Option<VellumError> {
        let key = key.to_string();
        let err = match self {
            Status::Success => return None,
            Status::KeyNotFound => VellumError::DocumentNotFound { key },
            Status::KeyExists => VellumError::DocumentExists { key },
            Status::TooBig => VellumError::ValueTooLarge { key },
            Status::TemporaryFailure => VellumError::TemporaryFailure { key },
            Status::OutOfMemory => VellumError::ServerOutOfMemory { key },
            Status::ServerBusy => VellumError::ServerBusy { key },
            other => VellumError::UnexpectedStatus {
                status: other.raw(),
                key,
            },
        };
        Some(err)
    }

    /// Maps a sub-document status to its path-level error.
    ///
    /// `SubdocInvalidCombo` intentionally has no mapping and falls back to
    /// a generic status error, as does any non-subdoc status.
    pub fn as_subdoc_error(self, path: &str, key: &str) -> Option<SubdocError> {
        let path = path.to_string();
        let key = key.to_string();
        let err = match self {
            Status::SubdocPathNotFound => SubdocError::PathNotFound { path, key },
            Status::SubdocPathMismatch => SubdocError::PathMismatch { path, key },
            Status::SubdocPathInvalid => SubdocError::PathInvalid { path, key },
            Status::SubdocPathTooBig => SubdocError::PathTooDeep { path, key },
            Status::SubdocDocTooDeep => SubdocError::DocumentTooDeep { key },
            Status::SubdocValueCannotInsert => SubdocError::CannotInsertValue { path, key },
            Status::SubdocDocNotJson => SubdocError::DocumentNotJson { key },
            Status::SubdocNumberTooBig => SubdocError::NumberTooBig { path, key },
            Status::SubdocDeltaInvalid => SubdocError::DeltaInvalid { path, key },
            Status::SubdocPathExists => SubdocError::PathExists { path, key },
            Status::SubdocValueTooDeep => SubdocError::ValueTooDeep { path, key },
            Status::SubdocXattrFailure => SubdocError::XattrFailure { path, key },
            _ => return None,
        };
        Some(err)
    }
}
