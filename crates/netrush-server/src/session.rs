// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server session state machine, conflict resolution and pruning
//! (`§4.3`, `§4.7`).

use crate::config::ServerConfig;
use crate::grid::Grid;
use crate::scheduler::Scheduler;
use netrush_proto::payload::{AckPayload, EventPayload, GameOverPayload, SnapshotBody};
use netrush_proto::{Change, NrshError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Server lifecycle state (`IDLE -> RUNNING -> GAME_OVER`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    /// No client has connected yet.
    Idle,
    /// At least one client is connected and the grid is not yet full.
    Running,
    /// Every cell has an owner; the server has entered end-of-game.
    GameOver,
}

/// Per-client record (`§3` client session record).
#[derive(Debug, Clone, Copy)]
pub struct ClientSession {
    /// Assigned client id, monotonically allocated from 1.
    pub client_id: u32,
    /// Last time any packet was received from this address.
    pub last_seen: Instant,
}

/// What a scheduler tick produced, for the caller to broadcast.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// This tick's snapshot id and body.
    pub snapshot: (u32, SnapshotBody),
    /// Present exactly once, on the tick that observes a full grid.
    pub game_over: Option<GameOverPayload>,
}

/// The grid, session table and scheduler as one mutation-serialized unit
/// (`§5`'s single-logical-atom rule).
#[derive(Debug)]
pub struct ServerState {
    grid: Grid,
    scheduler: Scheduler,
    sessions: HashMap<SocketAddr, ClientSession>,
    next_client_id: u32,
    max_clients: usize,
    client_timeout: Duration,
    state: GameState,
    pending_changes: Vec<Change>,
}

impl ServerState {
    /// Build initial state from a resolved configuration.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            grid: Grid::new(config.grid_side),
            scheduler: Scheduler::new(config.full_every, config.redundancy_k),
            sessions: HashMap::new(),
            next_client_id: 0,
            max_clients: config.max_clients,
            client_timeout: Duration::from_millis(config.client_timeout_ms),
            state: GameState::Idle,
            pending_changes: Vec::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn game_state(&self) -> GameState {
        self.state
    }

    /// Active session count.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Addresses of all active sessions, for broadcast fan-out.
    pub fn session_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.sessions.keys().copied()
    }

    /// Accept or idempotently refresh an INIT from `addr`.
    ///
    /// # Errors
    /// Returns [`NrshError::CapacityExceeded`] if `addr` is new and the
    /// session table is already at `max_clients`.
    pub fn accept_init(&mut self, addr: SocketAddr, now: Instant) -> Result<u32, NrshError> {
        if let Some(session) = self.sessions.get_mut(&addr) {
            session.last_seen = now;
            return Ok(session.client_id);
        }
        if self.sessions.len() >= self.max_clients {
            return Err(NrshError::CapacityExceeded);
        }
        self.next_client_id += 1;
        let client_id = self.next_client_id;
        self.sessions.insert(
            addr,
            ClientSession {
                client_id,
                last_seen: now,
            },
        );
        if self.state == GameState::Idle {
            self.state = GameState::Running;
            info!("first client connected, game running");
        }
        info!(client_id, %addr, "client connected");
        Ok(client_id)
    }

    /// Resolve a claim request from `addr`, first-claim-wins.
    ///
    /// # Errors
    /// Returns [`NrshError::UnknownSender`] if `addr` has no session or
    /// the payload's `client_id` does not match it; returns
    /// [`NrshError::MalformedPayload`] if `cell_index` is out of bounds.
    pub fn ingest_event(
        &mut self,
        addr: SocketAddr,
        event: EventPayload,
        now: Instant,
    ) -> Result<AckPayload, NrshError> {
        let session = self.sessions.get_mut(&addr).ok_or(NrshError::UnknownSender)?;
        if session.client_id != event.client_id {
            return Err(NrshError::UnknownSender);
        }
        session.last_seen = now;

        let (row, col) = self
            .grid
            .row_col(event.cell_index)
            .ok_or(NrshError::MalformedPayload)?;
        let (owner, claimed) = self.grid.try_claim(row, col, event.client_id);
        if claimed {
            self.pending_changes.push(Change::new(row, col, owner));
        }
        Ok(AckPayload {
            cell_index: event.cell_index,
            owner,
        })
    }

    /// Advance the snapshot scheduler one tick and detect the
    /// RUNNING -> GAME_OVER transition.
    pub fn tick(&mut self) -> TickOutcome {
        let changes = std::mem::take(&mut self.pending_changes);
        let grid = &self.grid;
        let snapshot = self
            .scheduler
            .next_snapshot(|| grid.non_empty_cells(), changes);

        let game_over = if self.state == GameState::Running && self.grid.is_full() {
            self.state = GameState::GameOver;
            info!("grid full, game over");
            Some(GameOverPayload {
                winners: self.grid.winners(),
                final_grid: self.grid.non_empty_cells(),
            })
        } else {
            None
        };

        TickOutcome { snapshot, game_over }
    }

    /// Remove sessions that have not been heard from in `client_timeout`.
    /// Ownership already granted to a pruned client's cells is untouched.
    pub fn prune_stale(&mut self, now: Instant) -> Vec<SocketAddr> {
        let timeout = self.client_timeout;
        let stale: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            self.sessions.remove(addr);
            info!(%addr, "session pruned (stale)");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            grid_side: 2,
            max_clients: 2,
            client_timeout_ms: 1,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn accept_init_allocates_ids_and_is_idempotent() {
        let mut state = ServerState::new(&test_config());
        let now = Instant::now();
        let id1 = state.accept_init(addr(1), now).expect("first init");
        assert_eq!(id1, 1);
        let id1_again = state.accept_init(addr(1), now).expect("idempotent init");
        assert_eq!(id1_again, 1);
        let id2 = state.accept_init(addr(2), now).expect("second init");
        assert_eq!(id2, 2);
    }

    #[test]
    fn accept_init_rejects_beyond_capacity() {
        let mut state = ServerState::new(&test_config());
        let now = Instant::now();
        state.accept_init(addr(1), now).expect("first");
        state.accept_init(addr(2), now).expect("second");
        assert_eq!(
            state.accept_init(addr(3), now),
            Err(NrshError::CapacityExceeded)
        );
    }

    #[test]
    fn ingest_event_first_claim_wins() {
        let mut state = ServerState::new(&test_config());
        let now = Instant::now();
        state.accept_init(addr(1), now).expect("client 1");
        state.accept_init(addr(2), now).expect("client 2");

        let ack1 = state
            .ingest_event(
                addr(2),
                EventPayload {
                    cell_index: 0,
                    client_id: 2,
                    ts_ms: 205,
                },
                now,
            )
            .expect("client 2 claims first");
        assert_eq!(ack1.owner, 2);

        let ack2 = state
            .ingest_event(
                addr(1),
                EventPayload {
                    cell_index: 0,
                    client_id: 1,
                    ts_ms: 200,
                },
                now,
            )
            .expect("client 1 arrives second");
        assert_eq!(ack2.owner, 2, "later arrival never overturns the first claim");
    }

    #[test]
    fn ingest_event_rejects_unknown_sender() {
        let mut state = ServerState::new(&test_config());
        let now = Instant::now();
        assert_eq!(
            state.ingest_event(
                addr(9),
                EventPayload {
                    cell_index: 0,
                    client_id: 1,
                    ts_ms: 0,
                },
                now,
            ),
            Err(NrshError::UnknownSender)
        );
    }

    #[test]
    fn tick_reaches_game_over_once_grid_is_full() {
        let mut state = ServerState::new(&test_config());
        let now = Instant::now();
        state.accept_init(addr(1), now).expect("client 1");

        for cell in 0..4 {
            state
                .ingest_event(
                    addr(1),
                    EventPayload {
                        cell_index: cell,
                        client_id: 1,
                        ts_ms: 0,
                    },
                    now,
                )
                .expect("claim");
        }

        let outcome = state.tick();
        assert!(outcome.game_over.is_some());
        assert_eq!(state.game_state(), GameState::GameOver);
        let second_tick = state.tick();
        assert!(second_tick.game_over.is_none(), "fires exactly once");
    }

    #[test]
    fn prune_stale_removes_idle_sessions() {
        let mut state = ServerState::new(&test_config());
        let t0 = Instant::now();
        state.accept_init(addr(1), t0).expect("client 1");
        let later = t0 + Duration::from_millis(5);
        let removed = state.prune_stale(later);
        assert_eq!(removed, vec![addr(1)]);
        assert_eq!(state.session_count(), 0);
    }
}
