// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client connection state machine and the outbound event reliability
//! table (`§4.4`, `§5`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `DISCONNECTED -> CONNECTING -> PLAYING -> GAME_OVER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No INIT has been sent yet.
    Disconnected,
    /// INIT sent, awaiting INIT_ACK; retries unbounded at `RDT_TIMEOUT`.
    Connecting,
    /// Connected and receiving snapshots.
    Playing,
    /// GAME_OVER observed; the session is over.
    GameOver,
}

/// A claim awaiting acknowledgement.
#[derive(Debug, Clone, Copy)]
pub struct OutstandingEvent {
    /// Cell coordinate this EVENT claims.
    pub row: u16,
    /// Cell coordinate this EVENT claims.
    pub col: u16,
    /// Last time this EVENT (or its most recent retransmit) was sent.
    pub sent_at: Instant,
    /// Number of retransmits sent so far.
    pub retry_count: u32,
}

/// What a `tick()` pass over the outstanding table produced.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// `(seq_num, row, col)` triples that must be retransmitted as-is.
    pub retransmits: Vec<(u32, u16, u16)>,
    /// `(seq_num, row, col)` triples that exhausted their retry budget
    /// and must be reverted to the last confirmed state.
    pub abandoned: Vec<(u32, u16, u16)>,
}

/// Keyed by the EVENT's own `seq_num`, since the server echoes it back
/// in the ACK header for idempotent matching.
#[derive(Debug)]
pub struct EventTable {
    rdt_timeout: Duration,
    max_retries: u32,
    outstanding: HashMap<u32, OutstandingEvent>,
}

impl EventTable {
    /// Build a table with the given retransmit clock and retry budget.
    #[must_use]
    pub fn new(rdt_timeout: Duration, max_retries: u32) -> Self {
        Self {
            rdt_timeout,
            max_retries,
            outstanding: HashMap::new(),
        }
    }

    /// Record a freshly sent claim.
    pub fn insert(&mut self, seq_num: u32, row: u16, col: u16, now: Instant) {
        self.outstanding.insert(
            seq_num,
            OutstandingEvent {
                row,
                col,
                sent_at: now,
                retry_count: 0,
            },
        );
    }

    /// Remove and return the entry for `seq_num`, if any is outstanding.
    /// A no-op (returns `None`) for an already-ACKed or unknown `seq_num`,
    /// which makes repeated ACK delivery idempotent.
    pub fn remove(&mut self, seq_num: u32) -> Option<OutstandingEvent> {
        self.outstanding.remove(&seq_num)
    }

    /// `true` while any claim awaits an ACK.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Whether some outstanding entry targets this coordinate.
    #[must_use]
    pub fn contains_cell(&self, row: u16, col: u16) -> bool {
        self.outstanding
            .values()
            .any(|entry| entry.row == row && entry.col == col)
    }

    /// Remove every outstanding entry targeting this coordinate. A cell
    /// has at most one outstanding claim in practice, but this stays
    /// correct if a caller ever raced two sends for the same cell.
    pub fn remove_matching(&mut self, row: u16, col: u16) {
        self.outstanding
            .retain(|_, entry| entry.row != row || entry.col != col);
    }

    /// Advance the retransmit clock: re-send entries past `rdt_timeout`,
    /// abandoning ones that have exhausted `max_retries`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let mut abandon_ids = Vec::new();

        for (&seq_num, entry) in &mut self.outstanding {
            if now.duration_since(entry.sent_at) <= self.rdt_timeout {
                continue;
            }
            if entry.retry_count >= self.max_retries {
                abandon_ids.push(seq_num);
                outcome.abandoned.push((seq_num, entry.row, entry.col));
            } else {
                entry.retry_count += 1;
                entry.sent_at = now;
                outcome.retransmits.push((seq_num, entry.row, entry.col));
            }
        }

        for seq_num in abandon_ids {
            self.outstanding.remove(&seq_num);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmits_after_timeout_then_abandons() {
        let mut table = EventTable::new(Duration::from_millis(10), 2);
        let t0 = Instant::now();
        table.insert(7, 2, 2, t0);

        let outcome = table.tick(t0);
        assert!(outcome.retransmits.is_empty(), "not yet past the timeout");

        let t1 = t0 + Duration::from_millis(11);
        let outcome = table.tick(t1);
        assert_eq!(outcome.retransmits, vec![(7, 2, 2)]);

        let t2 = t1 + Duration::from_millis(11);
        let outcome = table.tick(t2);
        assert_eq!(outcome.retransmits, vec![(7, 2, 2)]);

        let t3 = t2 + Duration::from_millis(11);
        let outcome = table.tick(t3);
        assert_eq!(outcome.abandoned, vec![(7, 2, 2)]);
        assert!(table.is_empty());
    }

    #[test]
    fn ack_removes_outstanding_entry_idempotently() {
        let mut table = EventTable::new(Duration::from_millis(500), 3);
        let now = Instant::now();
        table.insert(1, 0, 0, now);
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none(), "second ACK is a no-op");
    }
}
