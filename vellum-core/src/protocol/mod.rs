//! The Vellum key-value binary wire protocol.
//!
//! Everything in this module is stateless: encode functions turn a logical
//! operation into bytes, decode functions turn bytes back into typed
//! results, and neither keeps anything between calls.

pub mod codec;
pub mod compression;
pub mod constants;
pub mod expiry;
pub mod frame;
pub mod status;
pub mod subdoc;

pub use codec::PacketCodec;
pub use constants::Opcode;
pub use expiry::Expiry;
pub use frame::MutationToken;
pub use status::Status;
pub use subdoc::{SubdocCommand, SubdocCommandType, SubdocField, SubdocReply};
