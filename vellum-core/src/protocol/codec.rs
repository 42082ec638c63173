//! Codec splitting a byte stream into whole key-value packets.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::constants::{HEADER_SIZE, TOTAL_BODY_OFFSET};
use crate::error::{Result, VellumError};

/// Codec for framing key-value packets over a byte stream.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. Encoding passes through packets already built
/// by the pure frame functions; decoding waits for the fixed header, reads
/// the total body length, and yields one complete packet at a time.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = VellumError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() < HEADER_SIZE {
            return Err(VellumError::Protocol(format!(
                "cannot encode {}-byte packet, shorter than the header",
                item.len()
            )));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = VellumError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let total_body = u32::from_be_bytes([
            src[TOTAL_BODY_OFFSET],
            src[TOTAL_BODY_OFFSET + 1],
            src[TOTAL_BODY_OFFSET + 2],
            src[TOTAL_BODY_OFFSET + 3],
        ]) as usize;
        let packet_size = HEADER_SIZE + total_body;

        if src.len() < packet_size {
            src.reserve(packet_size - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(packet_size).freeze()))
    }
}
