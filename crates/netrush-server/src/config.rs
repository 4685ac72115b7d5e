// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server configuration surface (`§6`): CLI flags layered over a persisted
//! or default config, following the load-or-default-then-persist shape
//! used for `HostPrefs` in the sibling service.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Recognized server options, persisted under the `server` config key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    pub host: IpAddr,
    /// UDP port, both ends.
    pub port: u16,
    /// Authoritative grid dimension (grid is `n x n`).
    pub grid_side: u16,
    /// Snapshot cadence in Hz.
    pub update_rate_hz: u32,
    /// 1-in-N snapshots are full.
    pub full_every: u32,
    /// Prior snapshot tails attached to each snapshot. Clamped to `u8::MAX`
    /// by [`Args::apply`], the wire format's redundant-tail count limit.
    pub redundancy_k: usize,
    /// Capacity bound on concurrent sessions.
    pub max_clients: usize,
    /// Event retransmit clock, milliseconds (informs client defaults; unused server-side).
    pub rdt_timeout_ms: u64,
    /// Event retransmit budget (informs client defaults; unused server-side).
    pub max_retries: u32,
    /// Server-side staleness cutoff, milliseconds.
    pub client_timeout_ms: u64,
    /// Raw size above which a body is deflated.
    pub compression_threshold: usize,
    /// Construction ceiling for an encoded datagram.
    pub max_datagram: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 5000,
            grid_side: 20,
            update_rate_hz: 20,
            full_every: 10,
            redundancy_k: 2,
            max_clients: 4,
            rdt_timeout_ms: 500,
            max_retries: 3,
            client_timeout_ms: 15_000,
            compression_threshold: netrush_proto::DEFAULT_COMPRESSION_THRESHOLD,
            max_datagram: netrush_proto::MAX_DATAGRAM,
        }
    }
}

/// Command-line overrides. Any flag omitted falls through to the
/// persisted config, then to [`ServerConfig::default`].
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "NetRush Grid Clash server")]
pub struct Args {
    /// Bind address.
    #[arg(long)]
    pub host: Option<IpAddr>,
    /// UDP port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Grid side length N.
    #[arg(long)]
    pub grid_side: Option<u16>,
    /// Snapshot cadence in Hz.
    #[arg(long)]
    pub update_rate_hz: Option<u32>,
    /// 1-in-N snapshots are full.
    #[arg(long)]
    pub full_every: Option<u32>,
    /// Redundancy tail depth K.
    #[arg(long)]
    pub redundancy_k: Option<usize>,
    /// Max concurrent clients.
    #[arg(long)]
    pub max_clients: Option<usize>,
    /// Server-side client timeout, milliseconds.
    #[arg(long)]
    pub client_timeout_ms: Option<u64>,
    /// Compression threshold, bytes.
    #[arg(long)]
    pub compression_threshold: Option<usize>,
}

impl Args {
    /// Layer these CLI overrides over `base` (persisted config or default).
    #[must_use]
    pub fn apply(self, base: ServerConfig) -> ServerConfig {
        ServerConfig {
            host: self.host.unwrap_or(base.host),
            port: self.port.unwrap_or(base.port),
            grid_side: self.grid_side.unwrap_or(base.grid_side),
            update_rate_hz: self.update_rate_hz.unwrap_or(base.update_rate_hz),
            full_every: self.full_every.unwrap_or(base.full_every),
            redundancy_k: self
                .redundancy_k
                .unwrap_or(base.redundancy_k)
                .min(usize::from(u8::MAX)),
            max_clients: self.max_clients.unwrap_or(base.max_clients),
            client_timeout_ms: self.client_timeout_ms.unwrap_or(base.client_timeout_ms),
            compression_threshold: self
                .compression_threshold
                .unwrap_or(base.compression_threshold),
            ..base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_layer_over_defaults() {
        let args = Args {
            port: Some(6000),
            ..Default::default()
        };
        let cfg = args.apply(ServerConfig::default());
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.grid_side, 20);
    }

    #[test]
    fn redundancy_k_is_clamped_to_wire_format_limit() {
        let args = Args {
            redundancy_k: Some(1000),
            ..Default::default()
        };
        let cfg = args.apply(ServerConfig::default());
        assert_eq!(cfg.redundancy_k, usize::from(u8::MAX));
    }
}
