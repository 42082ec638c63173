//! Sub-document multi-command encoding and decoding.
//!
//! A multi lookup or mutation packs an ordered list of path-level commands
//! into one request body. The response carries one entry per command in
//! the same order, so decoding walks the original command list and the
//! body in lockstep; positions never shift.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::{
    SUBDOC_FLAG_CREATE_PARENTS, SUBDOC_FLAG_EXPAND_MACROS, SUBDOC_FLAG_XATTR_PATH,
};
use super::status::Status;
use crate::error::{Result, SubdocError, VellumError};

/// The kind of a single sub-document command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubdocCommandType {
    /// Fetch the value at a path.
    Get = 0xc5,
    /// Check whether a path exists.
    Exists = 0xc6,
    /// Add a dictionary entry; fails if the path exists.
    DictAdd = 0xc7,
    /// Add or replace a dictionary entry.
    DictUpsert = 0xc8,
    /// Remove the value at a path.
    Delete = 0xc9,
    /// Replace the value at a path; fails if absent.
    Replace = 0xca,
    /// Append to the array at a path.
    ArrayPushLast = 0xcb,
    /// Prepend to the array at a path.
    ArrayPushFirst = 0xcc,
    /// Insert into the array at a path position.
    ArrayInsert = 0xcd,
    /// Append to the array only if the value is not present.
    ArrayAddUnique = 0xce,
    /// Adjust the counter at a path by a delta.
    Counter = 0xcf,
    /// Count the members of the array or dictionary at a path.
    Count = 0xd2,
}

impl SubdocCommandType {
    /// Returns the raw wire opcode of this command.
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Returns true if this command mutates the document.
    pub fn is_mutation(self) -> bool {
        !matches!(
            self,
            SubdocCommandType::Get | SubdocCommandType::Exists | SubdocCommandType::Count
        )
    }
}

/// One path-level command inside a multi operation.
///
/// Commands form an ordered sequence; the order given at construction is
/// the order on the wire and the order of the decoded results.
#[derive(Debug, Clone)]
pub struct SubdocCommand {
    command_type: SubdocCommandType,
    path: String,
    xattr: bool,
    create_parents: bool,
    expand_macros: bool,
    value: Option<Bytes>,
}

impl SubdocCommand {
    /// Creates a lookup command (get/exists/count) for a path.
    pub fn lookup(command_type: SubdocCommandType, path: impl Into<String>) -> Self {
        Self {
            command_type,
            path: path.into(),
            xattr: false,
            create_parents: false,
            expand_macros: false,
            value: None,
        }
    }

    /// Creates a mutation command carrying a value payload.
    pub fn mutation(
        command_type: SubdocCommandType,
        path: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            command_type,
            path: path.into(),
            xattr: false,
            create_parents: false,
            expand_macros: false,
            value: Some(value.into()),
        }
    }

    /// Addresses an extended attribute instead of the document body.
    pub fn xattr(mut self, xattr: bool) -> Self {
        self.xattr = xattr;
        self
    }

    /// Creates missing intermediate path components on mutation.
    pub fn create_parents(mut self, create: bool) -> Self {
        self.create_parents = create;
        self
    }

    /// Expands server-side macros in the value.
    pub fn expand_macros(mut self, expand: bool) -> Self {
        self.expand_macros = expand;
        self
    }

    /// Returns the command kind.
    pub fn command_type(&self) -> SubdocCommandType {
        self.command_type
    }

    /// Returns the path this command addresses.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn path_flags(&self) -> u8 {
        let mut flags = 0;
        if self.create_parents {
            flags |= SUBDOC_FLAG_CREATE_PARENTS;
        }
        if self.xattr {
            flags |= SUBDOC_FLAG_XATTR_PATH;
        }
        if self.expand_macros {
            flags |= SUBDOC_FLAG_EXPAND_MACROS;
        }
        flags
    }

    fn encode_into(&self, out: &mut BytesMut) {
        let path = self.path.as_bytes();
        out.put_u8(self.command_type.raw());
        out.put_u8(self.path_flags());
        out.put_u16(path.len() as u16);
        out.put_slice(path);
        if self.command_type.is_mutation() {
            let value = self.value.as_deref().unwrap_or(&[]);
            out.put_u32(value.len() as u32);
            out.put_slice(value);
        }
    }
}

/// Encodes an ordered command list into one request body.
pub fn encode_commands(commands: &[SubdocCommand]) -> BytesMut {
    let mut body = BytesMut::new();
    for command in commands {
        command.encode_into(&mut body);
    }
    body
}

/// The decoded outcome of one command, in request order.
#[derive(Debug)]
pub struct SubdocField {
    /// Per-command status.
    pub status: Status,
    /// The typed error for a failed command, if one maps.
    pub error: Option<SubdocError>,
    /// The value returned for this command (empty for most mutations).
    pub value: Bytes,
    /// The path the command addressed.
    pub path: String,
    /// The command kind.
    pub command_type: SubdocCommandType,
}

/// The decoded and resolved outcome of a whole multi operation.
#[derive(Debug)]
pub struct SubdocReply {
    /// The resolved top-level status.
    pub status: Status,
    /// The resolved top-level error, when one command's failure (or a
    /// document-level condition) is surfaced as the overall outcome.
    pub error: Option<SubdocError>,
    /// Per-command outcomes, positionally matching the request commands.
    pub fields: Vec<SubdocField>,
}

/// Decodes a multi response body against the original command list.
///
/// The decoded field count always equals the command count; a body too
/// short to cover every command is a protocol error.
pub fn decode_multi(
    body: Option<&Bytes>,
    raw_status: Status,
    commands: &[SubdocCommand],
    key: &str,
) -> Result<SubdocReply> {
    let mut fields = Vec::with_capacity(commands.len());
    let mut failures: Vec<usize> = Vec::new();

    if let Some(body) = body {
        let mut buf = body.clone();
        for (index, command) in commands.iter().enumerate() {
            if buf.remaining() < 6 {
                return Err(VellumError::Protocol(format!(
                    "subdoc response body exhausted after {} of {} commands",
                    index,
                    commands.len()
                )));
            }
            let status = Status::from_raw(buf.get_u16())?;
            let value_len = buf.get_u32() as usize;
            if buf.remaining() < value_len {
                return Err(VellumError::Protocol(format!(
                    "subdoc value of {} bytes exceeds remaining body",
                    value_len
                )));
            }
            let value = buf.copy_to_bytes(value_len);

            let error = if status.is_success() {
                None
            } else {
                failures.push(index);
                status.as_subdoc_error(command.path(), key)
            };
            fields.push(SubdocField {
                status,
                error,
                value,
                path: command.path().to_string(),
                command_type: command.command_type(),
            });
        }
    }

    let mut status = raw_status;
    let mut error = None;

    match raw_status {
        Status::SubdocMultiPathFailure => {
            if commands.len() == 1 && failures.len() == 1 {
                // A single command was tried and failed; surface it directly.
                error = fields[failures[0]].error.take();
            } else {
                // Partial success; the caller inspects individual fields.
                status = Status::Success;
            }
        }
        Status::SubdocDocNotJson => {
            error = Some(SubdocError::DocumentNotJson {
                key: key.to_string(),
            });
        }
        Status::SubdocDocTooDeep => {
            error = Some(SubdocError::DocumentTooDeep {
                key: key.to_string(),
            });
        }
        // SubdocInvalidCombo stays untyped: it flags a caller-side defect
        // and is passed through as the generic status.
        _ => {
            if commands.len() == 1 && failures.len() == 1 {
                error = fields[failures[0]].error.take();
            }
        }
    }

    Ok(SubdocReply {
        status,
        error,
        fields,
    })
}
