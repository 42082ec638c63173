//! Core wire-protocol types and codecs for the Vellum database client.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;

pub use error::{Result, SubdocError, VellumError};
pub use protocol::{Expiry, MutationToken, Opcode, Status};
