// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pure client session logic: the state machine, claim sends, ACK/
//! snapshot/game-over handling and the retransmit clock (`§4.4`). Kept
//! free of transport so it can be driven directly in tests; [`crate`]'s
//! root wires it to a real socket.

use crate::config::ClientConfig;
use crate::reassembler::{Reassembler, RenderPort};
use crate::state::{ClientState, EventTable, TickOutcome};
use netrush_proto::payload::SnapshotBody;
use netrush_proto::{Change, NrshError};
use std::time::Instant;

/// One claim ready to go out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Sequence number to stamp on the EVENT header.
    pub seq_num: u32,
    /// Cell coordinate being claimed.
    pub row: u16,
    /// Cell coordinate being claimed.
    pub col: u16,
}

/// Owns the state machine, the outbound event table and the snapshot
/// reassembler for one connection to one server.
#[derive(Debug)]
pub struct ClientSession<R> {
    state: ClientState,
    client_id: Option<u32>,
    grid_side: u16,
    next_seq: u32,
    events: EventTable,
    reassembler: Reassembler,
    render: R,
    winners: Vec<u32>,
    game_over_id: Option<u32>,
}

impl<R: RenderPort> ClientSession<R> {
    /// Build a session for a `grid_side x grid_side` game, starting
    /// `DISCONNECTED`.
    #[must_use]
    pub fn new(grid_side: u16, config: &ClientConfig, render: R) -> Self {
        Self {
            state: ClientState::Disconnected,
            client_id: None,
            grid_side,
            next_seq: 0,
            events: EventTable::new(config.rdt_timeout, config.max_retries),
            reassembler: Reassembler::new(grid_side),
            render,
            winners: Vec::new(),
            game_over_id: None,
        }
    }

    /// Current state machine state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Assigned client id, once known.
    #[must_use]
    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    /// Side length of the grid this session was built for.
    #[must_use]
    pub fn grid_side(&self) -> u16 {
        self.grid_side
    }

    /// Winners surfaced by the most recent GAME_OVER.
    #[must_use]
    pub fn winners(&self) -> &[u32] {
        &self.winners
    }

    /// Current owner of a cell in the local replica.
    #[must_use]
    pub fn owner(&self, row: u16, col: u16) -> u32 {
        self.reassembler.owner(row, col)
    }

    /// Whether a claim for this cell has been sent but not yet ACKed —
    /// the visually-distinct pending state of `§4.4`.
    #[must_use]
    pub fn is_pending(&self, row: u16, col: u16) -> bool {
        self.events.contains_cell(row, col)
    }

    /// Transition out of `DISCONNECTED` on the first INIT send.
    pub fn begin_connecting(&mut self) {
        if self.state == ClientState::Disconnected {
            self.state = ClientState::Connecting;
        }
    }

    /// Apply a received INIT_ACK.
    pub fn on_init_ack(&mut self, client_id: u32) {
        self.client_id = Some(client_id);
        if self.state == ClientState::Connecting {
            self.state = ClientState::Playing;
        }
    }

    /// Allocate a sequence number, record the outstanding entry and
    /// return what to encode as the EVENT packet.
    pub fn send_claim(&mut self, row: u16, col: u16, now: Instant) -> ClaimRequest {
        let seq_num = self.next_seq;
        self.next_seq += 1;
        self.events.insert(seq_num, row, col, now);
        ClaimRequest { seq_num, row, col }
    }

    /// Apply a received ACK: clear the outstanding entry and settle the
    /// cell to its resolved owner (which may not be this client).
    ///
    /// # Errors
    /// Returns [`NrshError::MalformedPayload`] if `cell_index` is out of
    /// bounds for the grid side this session was built with.
    pub fn on_ack(&mut self, cell_index: u32, owner: u32, at_ms: u64) -> Result<(), NrshError> {
        let side = u32::from(self.grid_side);
        if side == 0 || cell_index >= side * side {
            return Err(NrshError::MalformedPayload);
        }
        let row = u16::try_from(cell_index / side).unwrap_or(u16::MAX);
        let col = u16::try_from(cell_index % side).unwrap_or(u16::MAX);
        self.events.remove_matching(row, col);
        self.reassembler
            .apply_changes_for(&[Change::new(row, col, owner)], at_ms, &mut self.render);
        Ok(())
    }

    /// Apply a received SNAPSHOT.
    ///
    /// # Errors
    /// Propagates [`NrshError::DuplicateSnapshot`] or
    /// [`NrshError::StaleSnapshot`] from the reassembler.
    pub fn on_snapshot(&mut self, id: u32, body: &SnapshotBody, at_ms: u64) -> Result<(), NrshError> {
        self.reassembler
            .apply_snapshot(id, body, at_ms, &mut self.render)
    }

    /// Apply a received GAME_OVER: clamp to the final grid, surface
    /// winners, transition to `GAME_OVER`. The server resends GAME_OVER
    /// three times at the same snapshot id (`§4.7`); repeats of an
    /// already-applied id are a no-op.
    pub fn on_game_over(&mut self, id: u32, winners: Vec<u32>, final_grid: &[Change], at_ms: u64) {
        if self.game_over_id == Some(id) {
            return;
        }
        self.reassembler
            .apply_final_grid(final_grid, at_ms, &mut self.render);
        self.winners = winners;
        self.state = ClientState::GameOver;
        self.game_over_id = Some(id);
    }

    /// Advance the retransmit clock. `DISCONNECTED`/`CONNECTING` callers
    /// drive their own INIT retry loop separately; this only governs
    /// outstanding EVENTs.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        self.events.tick(now)
    }
}
