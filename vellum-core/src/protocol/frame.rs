//! Pure encode/decode helpers for the fixed 24-byte packet layout.
//!
//! Every function here is a pure transformation over byte slices: identical
//! inputs always produce identical bytes, and nothing retains state. They
//! can be called concurrently from any I/O task.
//!
//! Plain layout: magic, opcode, key length (u16), extras length, data-type,
//! partition (request) / status (response) (u16), total body length (u32),
//! opaque (u32), cas (u64), then extras, key, value. The flexible layout
//! replaces the u16 key length with a u8 framing-extras length followed by
//! a u8 key length, and prepends the framing extras to the body. All
//! integers are big-endian.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use crate::error::{Result, VellumError};

/// An ordering/freshness marker produced by a successful mutation.
///
/// Consumed by the durability poller to detect whether an observed state
/// refers to this mutation or to a stale or newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationToken {
    /// The partition the document maps to.
    pub partition: u16,
    /// The epoch of the partition at mutation time.
    pub partition_uuid: u64,
    /// The sequence number assigned to the mutation.
    pub sequence_number: u64,
    /// The bucket the mutation was performed against.
    pub bucket: String,
}

/// Encodes a plain request packet.
pub fn request(
    opcode: Opcode,
    datatype: u8,
    partition: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    body: &[u8],
) -> BytesMut {
    let total_body = extras.len() + key.len() + body.len();
    let mut packet = BytesMut::with_capacity(HEADER_SIZE + total_body);
    packet.put_u8(MAGIC_REQUEST);
    packet.put_u8(opcode.raw());
    packet.put_u16(key.len() as u16);
    packet.put_u8(extras.len() as u8);
    packet.put_u8(datatype);
    packet.put_u16(partition);
    packet.put_u32(total_body as u32);
    packet.put_u32(opaque);
    packet.put_u64(cas);
    packet.put_slice(extras);
    packet.put_slice(key);
    packet.put_slice(body);
    packet
}

/// Encodes a request packet carrying flexible framing extras.
///
/// The key length field narrows to a single byte in this layout, so keys
/// longer than 255 bytes (after collection prefixing) are rejected.
pub fn flexible_request(
    opcode: Opcode,
    datatype: u8,
    partition: u16,
    opaque: u32,
    cas: u64,
    framing_extras: &[u8],
    extras: &[u8],
    key: &[u8],
    body: &[u8],
) -> Result<BytesMut> {
    if key.len() > u8::MAX as usize {
        return Err(VellumError::InvalidArgument(format!(
            "key of {} bytes does not fit the flexible framing layout",
            key.len()
        )));
    }
    let total_body = framing_extras.len() + extras.len() + key.len() + body.len();
    let mut packet = BytesMut::with_capacity(HEADER_SIZE + total_body);
    packet.put_u8(MAGIC_FLEXIBLE_REQUEST);
    packet.put_u8(opcode.raw());
    packet.put_u8(framing_extras.len() as u8);
    packet.put_u8(key.len() as u8);
    packet.put_u8(extras.len() as u8);
    packet.put_u8(datatype);
    packet.put_u16(partition);
    packet.put_u32(total_body as u32);
    packet.put_u32(opaque);
    packet.put_u64(cas);
    packet.put_slice(framing_extras);
    packet.put_slice(extras);
    packet.put_slice(key);
    packet.put_slice(body);
    Ok(packet)
}

/// Builds the flexible framing extras section for synchronous durability.
///
/// Carries the durability level and a derived server-side ack timeout of
/// 90% of the request timeout, clamped to at least 1ms and at most u16 ms,
/// leaving the client slack to receive the ambiguity response.
pub fn durability_framing_extras(level: u8, timeout: Duration) -> BytesMut {
    let server_timeout = ((timeout.as_millis() as u64).saturating_mul(9) / 10)
        .clamp(1, u16::MAX as u64) as u16;
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u8((FRAMING_ID_DURABILITY << 4) | 0x03);
    extras.put_u8(level);
    extras.put_u16(server_timeout);
    extras
}

/// Returns the magic byte of a packet.
pub fn magic(packet: &[u8]) -> u8 {
    packet[0]
}

/// Returns the data-type bits of a packet.
pub fn datatype(packet: &[u8]) -> u8 {
    packet[5]
}

/// Returns the raw status field of a response packet.
pub fn status_raw(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[6], packet[7]])
}

/// Returns the opaque (correlation id) of a packet.
pub fn opaque(packet: &[u8]) -> u32 {
    u32::from_be_bytes([
        packet[OPAQUE_OFFSET],
        packet[OPAQUE_OFFSET + 1],
        packet[OPAQUE_OFFSET + 2],
        packet[OPAQUE_OFFSET + 3],
    ])
}

/// Returns the cas of a packet.
pub fn cas(packet: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&packet[CAS_OFFSET..CAS_OFFSET + 8]);
    u64::from_be_bytes(raw)
}

/// Returns the total body length (extras + key + value) of a packet.
pub fn total_body_length(packet: &[u8]) -> u32 {
    u32::from_be_bytes([
        packet[TOTAL_BODY_OFFSET],
        packet[TOTAL_BODY_OFFSET + 1],
        packet[TOTAL_BODY_OFFSET + 2],
        packet[TOTAL_BODY_OFFSET + 3],
    ])
}

fn framing_extras_length(packet: &[u8]) -> usize {
    match magic(packet) {
        MAGIC_FLEXIBLE_REQUEST | MAGIC_FLEXIBLE_RESPONSE => packet[2] as usize,
        _ => 0,
    }
}

fn key_length(packet: &[u8]) -> usize {
    match magic(packet) {
        MAGIC_FLEXIBLE_REQUEST | MAGIC_FLEXIBLE_RESPONSE => packet[3] as usize,
        _ => u16::from_be_bytes([packet[2], packet[3]]) as usize,
    }
}

fn extras_length(packet: &[u8]) -> usize {
    packet[4] as usize
}

/// Verifies that a packet is a well-formed response of the expected length.
pub fn verify_response(packet: &[u8]) -> Result<()> {
    if packet.len() < HEADER_SIZE {
        return Err(VellumError::Protocol(format!(
            "response packet of {} bytes is shorter than the header",
            packet.len()
        )));
    }
    let m = magic(packet);
    if m != MAGIC_RESPONSE && m != MAGIC_FLEXIBLE_RESPONSE {
        return Err(VellumError::Protocol(format!(
            "unexpected response magic {:#04x}, this is a bug",
            m
        )));
    }
    let expected = HEADER_SIZE + total_body_length(packet) as usize;
    if packet.len() != expected {
        return Err(VellumError::Protocol(format!(
            "response packet length {} does not match header ({} expected)",
            packet.len(),
            expected
        )));
    }
    let sections = framing_extras_length(packet) + extras_length(packet) + key_length(packet);
    if sections > total_body_length(packet) as usize {
        return Err(VellumError::Protocol(format!(
            "response section lengths ({} bytes) overrun the body ({} bytes)",
            sections,
            total_body_length(packet)
        )));
    }
    Ok(())
}

/// Returns the extras section of a packet, if non-empty.
pub fn extras(packet: &Bytes) -> Option<Bytes> {
    let len = extras_length(packet);
    if len == 0 {
        return None;
    }
    let start = HEADER_SIZE + framing_extras_length(packet);
    Some(packet.slice(start..start + len))
}

/// Returns the value section of a packet, if non-empty.
pub fn body(packet: &Bytes) -> Option<Bytes> {
    let start = HEADER_SIZE
        + framing_extras_length(packet)
        + extras_length(packet)
        + key_length(packet);
    if start >= packet.len() {
        return None;
    }
    Some(packet.slice(start..))
}

/// Extracts the mutation token from a response's extras, when enabled.
///
/// The token occupies the first 16 extras bytes: partition uuid followed
/// by the sequence number.
pub fn extract_mutation_token(
    enabled: bool,
    partition: u16,
    packet: &Bytes,
    bucket: &str,
) -> Option<MutationToken> {
    if !enabled {
        return None;
    }
    let extras = extras(packet)?;
    if extras.len() < 16 {
        return None;
    }
    let mut buf = extras;
    Some(MutationToken {
        partition,
        partition_uuid: buf.get_u64(),
        sequence_number: buf.get_u64(),
        bucket: bucket.to_string(),
    })
}
