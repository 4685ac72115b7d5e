// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-side constants from the shared configuration surface (`§6`).

use std::time::Duration;

/// Client-side tunables. Grid side and server address come from
/// wherever the embedding application sources them; these are the
/// protocol-level defaults from the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Event retransmit clock.
    pub rdt_timeout: Duration,
    /// Event retransmit budget.
    pub max_retries: u32,
    /// INIT retransmit clock while `CONNECTING` (unbounded retries).
    pub init_retry_interval: Duration,
    /// INIT keep-alive interval once `PLAYING`.
    pub heartbeat_interval: Duration,
    /// Raw size above which an outbound body would be deflated (EVENT
    /// bodies are small enough this practically never triggers).
    pub compression_threshold: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rdt_timeout: Duration::from_millis(500),
            max_retries: 3,
            init_retry_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(3),
            compression_threshold: netrush_proto::DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}
