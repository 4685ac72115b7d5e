// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared error taxonomy (`§7` of the protocol spec).
//!
//! Every variant is an enumerable, loggable kind rather than an opaque
//! string, so callers can match on the rejection reason (tests assert
//! on it directly; the receive path logs it and drops the packet).

use thiserror::Error;

/// An error encountered while framing, decoding, or applying NRSH traffic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NrshError {
    /// Input shorter than the fixed header.
    #[error("packet shorter than the fixed header")]
    ShortPacket,
    /// Protocol id did not match `NRSH`.
    #[error("bad magic bytes")]
    BadMagic,
    /// Wire version not supported by this implementation.
    #[error("unsupported protocol version")]
    BadVersion,
    /// Message type byte does not map to a known variant.
    #[error("unknown message type")]
    UnknownMsgType,
    /// `payload_len` header field does not match the trailing bytes.
    #[error("payload length mismatch")]
    LengthMismatch,
    /// CRC32 over header+payload did not match the header's checksum field.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Payload failed to parse for its message type.
    #[error("malformed payload")]
    MalformedPayload,
    /// Compression flag was set but the body failed to inflate.
    #[error("payload decompression failed")]
    DecompressionFailed,
    /// EVENT or heartbeat came from an address with no matching session.
    #[error("unknown sender")]
    UnknownSender,
    /// INIT rejected because the server is already at the client cap.
    #[error("capacity exceeded")]
    CapacityExceeded,
    /// An outstanding EVENT exhausted its retransmit budget without an ACK.
    #[error("retry budget exhausted")]
    RetryBudgetExhausted,
    /// A delta snapshot arrived before any full snapshot had been applied.
    #[error("stale snapshot")]
    StaleSnapshot,
    /// A snapshot id has already been applied.
    #[error("duplicate snapshot")]
    DuplicateSnapshot,
    /// Encoded packet would exceed the maximum datagram size.
    #[error("packet would exceed the maximum datagram size")]
    DatagramTooLarge,
}
