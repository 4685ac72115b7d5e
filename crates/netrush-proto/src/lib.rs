// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for NetRush (`NRSH`), the Grid Clash datagram protocol.
//!
//! This crate owns everything byte-shaped and endpoint-agnostic: the
//! fixed 28-byte header, CRC32 integrity, the compact cell-list and
//! tagged-record payload dialects, and the shared error taxonomy. Both
//! `netrush-server` and `netrush-client` depend on it and add nothing
//! to the wire format themselves.

pub mod error;
pub mod payload;
pub mod wire;

pub use error::NrshError;

/// Protocol identifier carried in every header (`b"NRSH"`).
pub const MAGIC: [u8; 4] = *b"NRSH";

/// Current wire version.
pub const VERSION: u8 = 1;

/// Size in bytes of the fixed packet header.
pub const HEADER_LEN: usize = 28;

/// Maximum encoded datagram size (header + payload), per spec.
pub const MAX_DATAGRAM: usize = 1200;

/// Default value above which a raw payload body is zlib-compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1000;

/// Client id for the unclaimed-cell sentinel owner.
pub const UNCLAIMED: u32 = 0;

/// On-wire message type discriminant (`§3` of the protocol spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Client connection request, also reused as a connected-client heartbeat.
    Init = 0,
    /// Server acknowledgement of INIT, carrying the assigned client id.
    InitAck = 1,
    /// Server-originated periodic grid state (full or delta).
    Snapshot = 2,
    /// Client-originated cell claim request.
    Event = 3,
    /// Server acknowledgement of an EVENT, naming the resolved owner.
    Ack = 4,
    /// Server-originated notice that every cell has an owner.
    GameOver = 5,
}

impl MsgType {
    /// Decode a message type from its on-wire byte value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::InitAck),
            2 => Some(Self::Snapshot),
            3 => Some(Self::Event),
            4 => Some(Self::Ack),
            5 => Some(Self::GameOver),
            _ => None,
        }
    }

    /// Encode this message type as its on-wire byte value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single cell-ownership transition: `(row, col, owner)`.
///
/// `owner == 0` denotes unclaimed; this sentinel never appears in a
/// well-formed `Change` produced by the server, since a change always
/// records a claim, but the cell-list grammar tolerates it for
/// round-trip symmetry with the `grid` field of a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Change {
    /// Zero-based row index, `0 <= row < N`.
    pub row: u16,
    /// Zero-based column index, `0 <= col < N`.
    pub col: u16,
    /// Owning client id, or `0` for unclaimed.
    pub owner: u32,
}

impl Change {
    /// Construct a new change triple.
    #[must_use]
    pub fn new(row: u16, col: u16, owner: u32) -> Self {
        Self { row, col, owner }
    }
}
