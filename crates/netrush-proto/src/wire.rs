// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fixed 28-byte header framing and CRC32 integrity (`§3`, `§4.1`).

use crate::{MsgType, NrshError, HEADER_LEN, MAGIC, MAX_DATAGRAM, VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;

/// Header fields as presented to/parsed from the wire codec.
///
/// `payload_len` and `checksum` are not stored here; they are computed
/// from the payload at encode time and validated at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type carried by this packet.
    pub msg_type: MsgType,
    /// Snapshot id this packet belongs to (0 for non-snapshot traffic
    /// that does not otherwise need one, e.g. INIT).
    pub snapshot_id: u32,
    /// Sender's sequence number, strictly increasing per sender per direction.
    pub seq_num: u32,
    /// Milliseconds since the Unix epoch at send time.
    pub ts_ms: u64,
}

/// A decoded packet: header fields plus the raw payload bytes (including
/// the leading compression-flag byte, if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Decoded header fields.
    pub header: Header,
    /// Raw payload bytes, exactly `payload_len` long.
    pub payload: Bytes,
}

/// Compute CRC32 (IEEE 802.3) over `header_image` (28 bytes, checksum
/// field zeroed) concatenated with `payload`.
fn checksum(header_image: &[u8; HEADER_LEN], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_image);
    hasher.update(payload);
    hasher.finalize()
}

fn header_image(header: &Header, payload_len: u16) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4] = VERSION;
    buf[5] = header.msg_type.as_u8();
    buf[6..10].copy_from_slice(&header.snapshot_id.to_be_bytes());
    buf[10..14].copy_from_slice(&header.seq_num.to_be_bytes());
    buf[14..22].copy_from_slice(&header.ts_ms.to_be_bytes());
    buf[22..24].copy_from_slice(&payload_len.to_be_bytes());
    // buf[24..28] (checksum) stays zeroed; filled in by the caller.
    buf
}

/// Encode a packet from header fields and a payload body.
///
/// # Errors
/// Returns [`NrshError::DatagramTooLarge`] if `payload` does not fit in
/// a `u16` length or the total packet would exceed [`MAX_DATAGRAM`].
pub fn encode(header: &Header, payload: &[u8]) -> Result<Bytes, NrshError> {
    let payload_len = u16::try_from(payload.len()).map_err(|_| NrshError::DatagramTooLarge)?;
    if HEADER_LEN + payload.len() > MAX_DATAGRAM {
        return Err(NrshError::DatagramTooLarge);
    }

    let image = header_image(header, payload_len);
    let crc = checksum(&image, payload);

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&image[..24]);
    out.put_u32(crc);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Decode a packet, validating magic, version, message type, length and
/// checksum in that order. Per spec, any rejection means the packet must
/// be dropped before any further parsing is attempted.
///
/// # Errors
/// Returns the first applicable [`NrshError`] variant among
/// `ShortPacket`, `BadMagic`, `BadVersion`, `UnknownMsgType`,
/// `LengthMismatch`, `ChecksumMismatch`.
pub fn decode(bytes: &[u8]) -> Result<Packet, NrshError> {
    if bytes.len() < HEADER_LEN {
        return Err(NrshError::ShortPacket);
    }
    if bytes[0..4] != MAGIC {
        return Err(NrshError::BadMagic);
    }
    if bytes[4] != VERSION {
        return Err(NrshError::BadVersion);
    }
    let msg_type = MsgType::from_u8(bytes[5]).ok_or(NrshError::UnknownMsgType)?;

    let mut cursor = &bytes[6..HEADER_LEN];
    let snapshot_id = cursor.get_u32();
    let seq_num = cursor.get_u32();
    let ts_ms = cursor.get_u64();
    let payload_len = usize::from(cursor.get_u16());
    let checksum_field = cursor.get_u32();

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(NrshError::LengthMismatch);
    }

    let header = Header {
        msg_type,
        snapshot_id,
        seq_num,
        ts_ms,
    };
    let image = header_image(&header, u16::try_from(payload_len).unwrap_or(u16::MAX));
    let computed = checksum(&image, payload);
    if computed != checksum_field {
        return Err(NrshError::ChecksumMismatch);
    }

    Ok(Packet {
        header,
        payload: Bytes::copy_from_slice(payload),
    })
}
