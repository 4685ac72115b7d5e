// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Payload dialects carried inside the wire body (`§4.2`).
//!
//! Two shapes: the compact ASCII cell-list used by SNAPSHOT/GAME_OVER
//! grid fields, and small fixed-layout tagged records for INIT_ACK,
//! EVENT, ACK and GAME_OVER's non-grid fields. Both sit behind the
//! leading compression-flag byte described in `§3`.

use crate::{Change, NrshError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use std::io::{Read, Write};

/// Compression flag byte value: raw body follows.
pub const FLAG_RAW: u8 = 0x00;
/// Compression flag byte value: zlib-compressed body follows.
pub const FLAG_DEFLATE: u8 = 0x01;

/// Wrap a raw record body with the leading compression-flag byte,
/// deflating it when `raw.len() > threshold` or `force` is set.
///
/// Empty bodies omit the flag byte entirely, per spec.
///
/// # Errors
/// Never fails in practice (`flate2`'s in-memory writer is infallible
/// for `Vec<u8>` sinks); returns `Result` for symmetry with [`decode_body`].
pub fn encode_body(raw: &[u8], force: bool, threshold: usize) -> Result<Bytes, NrshError> {
    if raw.is_empty() {
        return Ok(Bytes::new());
    }
    if force || raw.len() > threshold {
        let compressed = deflate(raw)?;
        let mut out = BytesMut::with_capacity(1 + compressed.len());
        out.put_u8(FLAG_DEFLATE);
        out.put_slice(&compressed);
        Ok(out.freeze())
    } else {
        let mut out = BytesMut::with_capacity(1 + raw.len());
        out.put_u8(FLAG_RAW);
        out.put_slice(raw);
        Ok(out.freeze())
    }
}

/// Unwrap a payload body, honoring the leading compression flag.
/// An empty input decodes to an empty body.
///
/// # Errors
/// Returns [`NrshError::DecompressionFailed`] if the flag is `0x01` but
/// the trailing bytes do not inflate cleanly.
pub fn decode_body(bytes: &[u8]) -> Result<Vec<u8>, NrshError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    match bytes[0] {
        FLAG_RAW => Ok(bytes[1..].to_vec()),
        FLAG_DEFLATE => inflate(&bytes[1..]),
        _ => Err(NrshError::MalformedPayload),
    }
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, NrshError> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|_| NrshError::DecompressionFailed)?;
    encoder.finish().map_err(|_| NrshError::DecompressionFailed)
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>, NrshError> {
    use flate2::read::ZlibDecoder;
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| NrshError::DecompressionFailed)?;
    Ok(out)
}

// --- Cell-list dialect ------------------------------------------------

/// Render a cell-list as `"r,c,o;r,c,o;..."`, empty string for no cells.
#[must_use]
pub fn format_cell_list(cells: &[Change]) -> String {
    let mut out = String::new();
    for (i, c) in cells.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(&c.row.to_string());
        out.push(',');
        out.push_str(&c.col.to_string());
        out.push(',');
        out.push_str(&c.owner.to_string());
    }
    out
}

/// Parse a cell-list produced by [`format_cell_list`]. Strict: any
/// malformed triple fails the whole list.
///
/// # Errors
/// Returns [`NrshError::MalformedPayload`] for any triple that is not
/// exactly `row,col,owner` with all three fields parsing as integers.
pub fn parse_cell_list(text: &str) -> Result<Vec<Change>, NrshError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(';')
        .map(|triple| {
            let mut parts = triple.split(',');
            let row = parts.next().ok_or(NrshError::MalformedPayload)?;
            let col = parts.next().ok_or(NrshError::MalformedPayload)?;
            let owner = parts.next().ok_or(NrshError::MalformedPayload)?;
            if parts.next().is_some() {
                return Err(NrshError::MalformedPayload);
            }
            let row: u16 = row.parse().map_err(|_| NrshError::MalformedPayload)?;
            let col: u16 = col.parse().map_err(|_| NrshError::MalformedPayload)?;
            let owner: u32 = owner.parse().map_err(|_| NrshError::MalformedPayload)?;
            Ok(Change::new(row, col, owner))
        })
        .collect()
}

fn put_cell_list(buf: &mut BytesMut, cells: &[Change]) -> Result<(), NrshError> {
    let text = format_cell_list(cells);
    let bytes = text.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| NrshError::MalformedPayload)?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

fn get_cell_list(buf: &mut &[u8]) -> Result<Vec<Change>, NrshError> {
    if buf.len() < 2 {
        return Err(NrshError::MalformedPayload);
    }
    let len = usize::from(buf.get_u16());
    if buf.len() < len {
        return Err(NrshError::MalformedPayload);
    }
    let text = std::str::from_utf8(&buf[..len]).map_err(|_| NrshError::MalformedPayload)?;
    let cells = parse_cell_list(text)?;
    buf.advance(len);
    Ok(cells)
}

// --- Tagged records -----------------------------------------------------

/// `INIT_ACK` body: the client id assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitAckPayload {
    /// Assigned client id.
    pub client_id: u32,
}

impl InitAckPayload {
    /// Encode to the raw (pre-compression) body bytes.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.client_id);
        buf.to_vec()
    }

    /// Decode from raw body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if the body is not exactly 4 bytes.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, NrshError> {
        if bytes.len() != 4 {
            return Err(NrshError::MalformedPayload);
        }
        Ok(Self {
            client_id: bytes.get_u32(),
        })
    }
}

/// `EVENT` body: a client-originated claim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPayload {
    /// Flattened `row * n + col` index of the requested cell.
    pub cell_index: u32,
    /// Requesting client id.
    pub client_id: u32,
    /// Client-stamped send time, milliseconds since the Unix epoch.
    pub ts_ms: u64,
}

impl EventPayload {
    /// Encode to the raw (pre-compression) body bytes.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(self.cell_index);
        buf.put_u32(self.client_id);
        buf.put_u64(self.ts_ms);
        buf.to_vec()
    }

    /// Decode from raw body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if the body is not exactly 16 bytes.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, NrshError> {
        if bytes.len() != 16 {
            return Err(NrshError::MalformedPayload);
        }
        Ok(Self {
            cell_index: bytes.get_u32(),
            client_id: bytes.get_u32(),
            ts_ms: bytes.get_u64(),
        })
    }
}

/// `ACK` body: the resolved owner for a previously sent EVENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    /// Flattened cell index the ACK refers to.
    pub cell_index: u32,
    /// Owner established for that cell (may differ from the requester).
    pub owner: u32,
}

impl AckPayload {
    /// Encode to the raw (pre-compression) body bytes.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.cell_index);
        buf.put_u32(self.owner);
        buf.to_vec()
    }

    /// Decode from raw body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if the body is not exactly 8 bytes.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, NrshError> {
        if bytes.len() != 8 {
            return Err(NrshError::MalformedPayload);
        }
        Ok(Self {
            cell_index: bytes.get_u32(),
            owner: bytes.get_u32(),
        })
    }
}

/// `GAME_OVER` body: the winner set and the final grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameOverPayload {
    /// Client ids tied for the largest claimed-cell count.
    pub winners: Vec<u32>,
    /// Every claimed cell at game end.
    pub final_grid: Vec<Change>,
}

impl GameOverPayload {
    /// Encode to the raw (pre-compression) body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if `winners` or the
    /// formatted grid would not fit their length prefixes.
    pub fn encode(&self) -> Result<Vec<u8>, NrshError> {
        let mut buf = BytesMut::new();
        let count = u16::try_from(self.winners.len()).map_err(|_| NrshError::MalformedPayload)?;
        buf.put_u16(count);
        for id in &self.winners {
            buf.put_u32(*id);
        }
        put_cell_list(&mut buf, &self.final_grid)?;
        Ok(buf.to_vec())
    }

    /// Decode from raw body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if the body is truncated
    /// or the trailing cell-list is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, NrshError> {
        let mut cursor = bytes;
        if cursor.len() < 2 {
            return Err(NrshError::MalformedPayload);
        }
        let count = usize::from(cursor.get_u16());
        if cursor.len() < count * 4 {
            return Err(NrshError::MalformedPayload);
        }
        let mut winners = Vec::with_capacity(count);
        for _ in 0..count {
            winners.push(cursor.get_u32());
        }
        let final_grid = get_cell_list(&mut cursor)?;
        Ok(Self {
            winners,
            final_grid,
        })
    }
}

/// `SNAPSHOT` body: full/delta flag, grid (if full), changes, and the
/// K-redundancy tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBody {
    /// Whether `grid` carries the complete non-empty cell set.
    pub full: bool,
    /// All non-empty cells, present only when `full`.
    pub grid: Vec<Change>,
    /// Changes since the previous snapshot.
    pub changes: Vec<Change>,
    /// Up to K prior `(snapshot_id, changes)` pairs, oldest first.
    pub redundant: Vec<(u32, Vec<Change>)>,
}

impl SnapshotBody {
    /// Encode to the raw (pre-compression) body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if any embedded cell-list
    /// or the redundancy count would not fit its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, NrshError> {
        let mut buf = BytesMut::new();
        buf.put_u8(u8::from(self.full));
        if self.full {
            put_cell_list(&mut buf, &self.grid)?;
        }
        put_cell_list(&mut buf, &self.changes)?;
        let redundant_count =
            u8::try_from(self.redundant.len()).map_err(|_| NrshError::MalformedPayload)?;
        buf.put_u8(redundant_count);
        for (snapshot_id, changes) in &self.redundant {
            buf.put_u32(*snapshot_id);
            put_cell_list(&mut buf, changes)?;
        }
        Ok(buf.to_vec())
    }

    /// Decode from raw body bytes.
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if the body is truncated
    /// or any embedded cell-list is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, NrshError> {
        let mut cursor = bytes;
        if cursor.is_empty() {
            return Err(NrshError::MalformedPayload);
        }
        let full = cursor.get_u8() != 0;
        let grid = if full {
            get_cell_list(&mut cursor)?
        } else {
            Vec::new()
        };
        let changes = get_cell_list(&mut cursor)?;
        if cursor.is_empty() {
            return Err(NrshError::MalformedPayload);
        }
        let redundant_count = usize::from(cursor.get_u8());
        let mut redundant = Vec::with_capacity(redundant_count);
        for _ in 0..redundant_count {
            if cursor.len() < 4 {
                return Err(NrshError::MalformedPayload);
            }
            let snapshot_id = cursor.get_u32();
            let changes = get_cell_list(&mut cursor)?;
            redundant.push((snapshot_id, changes));
        }
        Ok(Self {
            full,
            grid,
            changes,
            redundant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_list_round_trips_including_empty() {
        assert_eq!(parse_cell_list("").expect("parse"), Vec::<Change>::new());
        assert_eq!(format_cell_list(&[]), "");

        let cells = vec![Change::new(0, 0, 1), Change::new(19, 19, 4), Change::new(2, 2, 0)];
        let text = format_cell_list(&cells);
        assert_eq!(parse_cell_list(&text).expect("parse"), cells);
    }

    #[test]
    fn cell_list_rejects_malformed_triple() {
        assert_eq!(parse_cell_list("1,2"), Err(NrshError::MalformedPayload));
        assert_eq!(parse_cell_list("1,2,3,4"), Err(NrshError::MalformedPayload));
        assert_eq!(parse_cell_list("a,2,3"), Err(NrshError::MalformedPayload));
    }

    #[test]
    fn body_round_trips_raw_and_compressed() {
        let raw = b"small".to_vec();
        let wrapped = encode_body(&raw, false, 1000).expect("encode");
        assert_eq!(wrapped[0], FLAG_RAW);
        assert_eq!(decode_body(&wrapped).expect("decode"), raw);

        let big = vec![7u8; 2000];
        let wrapped = encode_body(&big, false, 1000).expect("encode");
        assert_eq!(wrapped[0], FLAG_DEFLATE);
        assert_eq!(decode_body(&wrapped).expect("decode"), big);

        let forced = encode_body(&raw, true, 1000).expect("encode");
        assert_eq!(forced[0], FLAG_DEFLATE);
        assert_eq!(decode_body(&forced).expect("decode"), raw);
    }

    #[test]
    fn empty_body_round_trips_with_no_flag_byte() {
        let wrapped = encode_body(&[], false, 1000).expect("encode");
        assert!(wrapped.is_empty());
        assert_eq!(decode_body(&wrapped).expect("decode"), Vec::<u8>::new());
    }

    #[test]
    fn init_ack_round_trips() {
        let p = InitAckPayload { client_id: 3 };
        assert_eq!(InitAckPayload::decode(&p.encode()).expect("decode"), p);
    }

    #[test]
    fn event_round_trips() {
        let p = EventPayload {
            cell_index: 42,
            client_id: 1,
            ts_ms: 125,
        };
        assert_eq!(EventPayload::decode(&p.encode()).expect("decode"), p);
    }

    #[test]
    fn ack_round_trips() {
        let p = AckPayload {
            cell_index: 42,
            owner: 2,
        };
        assert_eq!(AckPayload::decode(&p.encode()).expect("decode"), p);
    }

    #[test]
    fn game_over_round_trips() {
        let p = GameOverPayload {
            winners: vec![1, 3],
            final_grid: vec![Change::new(0, 0, 1), Change::new(0, 1, 3)],
        };
        let bytes = p.encode().expect("encode");
        assert_eq!(GameOverPayload::decode(&bytes).expect("decode"), p);
    }

    #[test]
    fn snapshot_full_and_delta_round_trip() {
        let full = SnapshotBody {
            full: true,
            grid: vec![Change::new(1, 1, 2)],
            changes: vec![Change::new(1, 1, 2)],
            redundant: vec![],
        };
        let bytes = full.encode().expect("encode");
        assert_eq!(SnapshotBody::decode(&bytes).expect("decode"), full);

        let delta = SnapshotBody {
            full: false,
            grid: vec![],
            changes: vec![Change::new(2, 2, 1)],
            redundant: vec![(5, vec![Change::new(3, 3, 4)]), (6, vec![])],
        };
        let bytes = delta.encode().expect("encode");
        assert_eq!(SnapshotBody::decode(&bytes).expect("decode"), delta);
    }

    #[test]
    fn snapshot_empty_changes_round_trip() {
        let body = SnapshotBody {
            full: true,
            grid: vec![],
            changes: vec![],
            redundant: vec![],
        };
        let bytes = body.encode().expect("encode");
        assert_eq!(SnapshotBody::decode(&bytes).expect("decode"), body);
    }
}
