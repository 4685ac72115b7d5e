// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-side snapshot reassembler (`§4.6`): full/delta application,
//! redundancy replay and duplicate rejection, converging to the
//! server's grid regardless of delivery order.

use netrush_proto::payload::SnapshotBody;
use netrush_proto::{Change, NrshError, UNCLAIMED};
use std::collections::{HashSet, VecDeque};

/// How many previously-applied snapshot ids to remember for dedup.
const APPLIED_RING_SIZE: usize = 256;

/// External hand-off for newly-settled cells. The renderer is external
/// to this crate; it only needs to know what changed and when.
pub trait RenderPort {
    /// Called once per cell transition actually applied to the replica.
    fn cell_changed(&mut self, row: u16, col: u16, owner: u32, at_ms: u64);
}

/// A `RenderPort` that does nothing, for headless use and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderPort;

impl RenderPort for NullRenderPort {
    fn cell_changed(&mut self, _row: u16, _col: u16, _owner: u32, _at_ms: u64) {}
}

/// Local grid replica plus the bookkeeping needed to apply snapshots
/// idempotently and in any arrival order.
#[derive(Debug)]
pub struct Reassembler {
    side: u16,
    grid: Vec<u32>,
    applied_ring: VecDeque<u32>,
    applied_set: HashSet<u32>,
    latest_full_id: Option<u32>,
}

impl Reassembler {
    /// Build a reassembler for a `side x side` grid, all cells unclaimed.
    #[must_use]
    pub fn new(side: u16) -> Self {
        Self {
            side,
            grid: vec![UNCLAIMED; usize::from(side) * usize::from(side)],
            applied_ring: VecDeque::with_capacity(APPLIED_RING_SIZE),
            applied_set: HashSet::with_capacity(APPLIED_RING_SIZE),
            latest_full_id: None,
        }
    }

    /// Current owner of a cell in the local replica.
    #[must_use]
    pub fn owner(&self, row: u16, col: u16) -> u32 {
        self.grid[usize::from(row) * usize::from(self.side) + usize::from(col)]
    }

    /// Every claimed cell in the local replica.
    #[must_use]
    pub fn non_empty_cells(&self) -> Vec<Change> {
        let mut out = Vec::new();
        for row in 0..self.side {
            for col in 0..self.side {
                let owner = self.owner(row, col);
                if owner != UNCLAIMED {
                    out.push(Change::new(row, col, owner));
                }
            }
        }
        out
    }

    fn mark_applied(&mut self, id: u32) {
        if self.applied_set.insert(id) {
            self.applied_ring.push_back(id);
            if self.applied_ring.len() > APPLIED_RING_SIZE {
                if let Some(evicted) = self.applied_ring.pop_front() {
                    self.applied_set.remove(&evicted);
                }
            }
        }
    }

    /// First-claim-wins merge: never overwrite an already-owned cell, so
    /// replaying stale redundant changes can never corrupt state.
    fn apply_changes(&mut self, changes: &[Change], at_ms: u64, render: &mut impl RenderPort) {
        for change in changes {
            let idx = usize::from(change.row) * usize::from(self.side) + usize::from(change.col);
            if self.grid[idx] == UNCLAIMED {
                self.grid[idx] = change.owner;
                render.cell_changed(change.row, change.col, change.owner, at_ms);
            }
        }
    }

    /// Apply one received SNAPSHOT. `at_ms` is the local receive time used
    /// to stamp the rendering hand-off, not a protocol field.
    ///
    /// # Errors
    /// Returns [`NrshError::DuplicateSnapshot`] if `id` was already
    /// applied, or [`NrshError::StaleSnapshot`] for a delta received
    /// before any full snapshot.
    pub fn apply_snapshot(
        &mut self,
        id: u32,
        body: &SnapshotBody,
        at_ms: u64,
        render: &mut impl RenderPort,
    ) -> Result<(), NrshError> {
        if self.applied_set.contains(&id) {
            return Err(NrshError::DuplicateSnapshot);
        }

        if body.full {
            self.grid.fill(UNCLAIMED);
            self.apply_changes(&body.grid, at_ms, render);
            self.latest_full_id = Some(id);
            self.mark_applied(id);
            for (redundant_id, changes) in &body.redundant {
                if *redundant_id > id && !self.applied_set.contains(redundant_id) {
                    self.apply_changes(changes, at_ms, render);
                    self.mark_applied(*redundant_id);
                }
            }
            return Ok(());
        }

        let Some(latest_full) = self.latest_full_id else {
            return Err(NrshError::StaleSnapshot);
        };
        if id > latest_full {
            self.apply_changes(&body.changes, at_ms, render);
        }
        for (redundant_id, changes) in &body.redundant {
            if !self.applied_set.contains(redundant_id) && *redundant_id > latest_full {
                self.apply_changes(changes, at_ms, render);
                self.mark_applied(*redundant_id);
            }
        }
        self.mark_applied(id);
        Ok(())
    }

    /// Apply an authoritative out-of-band update (e.g. from an ACK)
    /// using the same first-claim-wins merge as snapshot changes.
    pub fn apply_changes_for(&mut self, changes: &[Change], at_ms: u64, render: &mut impl RenderPort) {
        self.apply_changes(changes, at_ms, render);
    }

    /// Replace the local replica with a GAME_OVER's final grid.
    pub fn apply_final_grid(&mut self, final_grid: &[Change], at_ms: u64, render: &mut impl RenderPort) {
        self.grid.fill(UNCLAIMED);
        self.apply_changes(final_grid, at_ms, render);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netrush_proto::payload::SnapshotBody;

    fn full(id_grid: Vec<Change>) -> SnapshotBody {
        SnapshotBody {
            full: true,
            grid: id_grid,
            changes: Vec::new(),
            redundant: Vec::new(),
        }
    }

    fn delta(changes: Vec<Change>, redundant: Vec<(u32, Vec<Change>)>) -> SnapshotBody {
        SnapshotBody {
            full: false,
            grid: Vec::new(),
            changes,
            redundant,
        }
    }

    #[test]
    fn full_snapshot_replaces_replica() {
        let mut r = Reassembler::new(4);
        let mut render = NullRenderPort;
        r.apply_snapshot(0, &full(vec![Change::new(1, 1, 3)]), 0, &mut render)
            .expect("apply");
        assert_eq!(r.owner(1, 1), 3);
    }

    #[test]
    fn duplicate_snapshot_is_rejected() {
        let mut r = Reassembler::new(4);
        let mut render = NullRenderPort;
        let body = full(vec![Change::new(0, 0, 1)]);
        r.apply_snapshot(5, &body, 0, &mut render).expect("first");
        assert_eq!(
            r.apply_snapshot(5, &body, 0, &mut render),
            Err(NrshError::DuplicateSnapshot)
        );
    }

    #[test]
    fn delta_before_any_full_is_stale() {
        let mut r = Reassembler::new(4);
        let mut render = NullRenderPort;
        let body = delta(vec![Change::new(0, 0, 1)], vec![]);
        assert_eq!(
            r.apply_snapshot(1, &body, 0, &mut render),
            Err(NrshError::StaleSnapshot)
        );
    }

    #[test]
    fn lossy_delta_recovers_via_redundant_tail() {
        let mut r = Reassembler::new(4);
        let mut render = NullRenderPort;
        r.apply_snapshot(0, &full(vec![]), 0, &mut render).expect("full");

        // deltas 1..=3 dropped; 4 carries the redundant tail for 2 and 3.
        let body = delta(
            vec![Change::new(0, 3, 4)],
            vec![
                (2, vec![Change::new(0, 1, 2)]),
                (3, vec![Change::new(0, 2, 3)]),
            ],
        );
        r.apply_snapshot(4, &body, 0, &mut render).expect("apply");

        assert_eq!(r.owner(0, 1), 2);
        assert_eq!(r.owner(0, 2), 3);
        assert_eq!(r.owner(0, 3), 4);
    }

    #[test]
    fn out_of_order_delivery_converges() {
        let mut a = Reassembler::new(4);
        let mut b = Reassembler::new(4);
        let mut render = NullRenderPort;

        let snap0 = full(vec![]);
        let snap1 = delta(vec![Change::new(0, 0, 1)], vec![]);
        let snap2 = delta(
            vec![Change::new(0, 1, 2)],
            vec![(1, vec![Change::new(0, 0, 1)])],
        );

        a.apply_snapshot(0, &snap0, 0, &mut render).expect("a0");
        a.apply_snapshot(1, &snap1, 0, &mut render).expect("a1");
        a.apply_snapshot(2, &snap2, 0, &mut render).expect("a2");

        b.apply_snapshot(0, &snap0, 0, &mut render).expect("b0");
        b.apply_snapshot(2, &snap2, 0, &mut render).expect("b2");
        // id 1 already arrived via snap2's redundant tail; the late original
        // is a legitimate duplicate, not an error in the client's own logic.
        assert_eq!(
            b.apply_snapshot(1, &snap1, 0, &mut render),
            Err(NrshError::DuplicateSnapshot)
        );

        assert_eq!(a.owner(0, 0), b.owner(0, 0));
        assert_eq!(a.owner(0, 1), b.owner(0, 1));
        assert_eq!(a.non_empty_cells(), b.non_empty_cells());
    }
}
