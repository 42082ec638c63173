//! Wire-level constants for the Vellum key-value binary protocol.

/// Magic byte for a plain request packet.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Magic byte for a plain response packet.
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Magic byte for a request carrying flexible framing extras.
pub const MAGIC_FLEXIBLE_REQUEST: u8 = 0x08;
/// Magic byte for a response carrying flexible framing extras.
pub const MAGIC_FLEXIBLE_RESPONSE: u8 = 0x18;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Byte offset of the total-body-length field within the header.
pub const TOTAL_BODY_OFFSET: usize = 8;
/// Byte offset of the opaque (correlation id) field within the header.
pub const OPAQUE_OFFSET: usize = 12;
/// Byte offset of the cas field within the header.
pub const CAS_OFFSET: usize = 16;

/// Data-type bit: the value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;
/// Data-type bit: the value is compressed.
pub const DATATYPE_COMPRESSED: u8 = 0x02;

/// Flexible framing extra identifier for synchronous durability (high nibble).
pub const FRAMING_ID_DURABILITY: u8 = 0x01;

/// Sub-document path flag: create intermediate path components.
pub const SUBDOC_FLAG_CREATE_PARENTS: u8 = 0x01;
/// Sub-document path flag: the path addresses an extended attribute.
pub const SUBDOC_FLAG_XATTR_PATH: u8 = 0x04;
/// Sub-document path flag: expand server-side macros in the value.
pub const SUBDOC_FLAG_EXPAND_MACROS: u8 = 0x10;

/// Request opcodes understood by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch a document.
    Get = 0x00,
    /// Store a document unconditionally (or by cas).
    Set = 0x01,
    /// Delete a document.
    Delete = 0x04,
    /// Append raw bytes to a document.
    Append = 0x0e,
    /// Prepend raw bytes to a document.
    Prepend = 0x0f,
    /// Observe the persistence/replication state of a key.
    Observe = 0x92,
    /// Multi-command sub-document lookup.
    SubdocMultiLookup = 0xd0,
    /// Multi-command sub-document mutation.
    SubdocMultiMutation = 0xd1,
}

impl Opcode {
    /// Returns the raw wire value of this opcode.
    pub fn raw(self) -> u8 {
        self as u8
    }
}
