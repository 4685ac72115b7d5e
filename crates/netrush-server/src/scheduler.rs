// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Snapshot scheduler: full/delta decision and the K-redundancy tail
//! (`§4.5`).

use netrush_proto::payload::SnapshotBody;
use netrush_proto::Change;
use std::collections::VecDeque;

/// Drives the monotonic `snapshot_id` clock and keeps the trailing
/// `redundant` history the scheduler attaches to each snapshot.
#[derive(Debug)]
pub struct Scheduler {
    next_snapshot_id: u32,
    full_every: u32,
    redundancy_k: usize,
    history: VecDeque<(u32, Vec<Change>)>,
}

impl Scheduler {
    /// Build a scheduler starting at snapshot id 0.
    #[must_use]
    pub fn new(full_every: u32, redundancy_k: usize) -> Self {
        Self {
            next_snapshot_id: 0,
            full_every: full_every.max(1),
            redundancy_k,
            history: VecDeque::with_capacity(redundancy_k + 1),
        }
    }

    /// Build the body for the next tick's snapshot from the current grid
    /// and the changes accumulated since the previous tick. Advances the
    /// snapshot id and rotates the redundancy history.
    pub fn next_snapshot(
        &mut self,
        non_empty_cells: impl FnOnce() -> Vec<Change>,
        current_changes: Vec<Change>,
    ) -> (u32, SnapshotBody) {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        let full = id % self.full_every == 0;

        let body = SnapshotBody {
            full,
            grid: if full { non_empty_cells() } else { Vec::new() },
            changes: current_changes.clone(),
            redundant: self.history.iter().cloned().collect(),
        };

        self.history.push_back((id, current_changes));
        while self.history.len() > self.redundancy_k {
            self.history.pop_front();
        }

        (id, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netrush_proto::Change;

    #[test]
    fn first_snapshot_is_full() {
        let mut sched = Scheduler::new(10, 2);
        let (id, body) = sched.next_snapshot(Vec::new, vec![]);
        assert_eq!(id, 0);
        assert!(body.full);
    }

    #[test]
    fn full_every_n_and_redundancy_tail_rotate() {
        let mut sched = Scheduler::new(3, 2);
        let changes_at = |owner: u32| vec![Change::new(0, 0, owner)];

        let (_, body0) = sched.next_snapshot(Vec::new, changes_at(1));
        assert!(body0.full);
        assert!(body0.redundant.is_empty());

        let (_, body1) = sched.next_snapshot(Vec::new, changes_at(2));
        assert!(!body1.full);
        assert_eq!(body1.redundant, vec![(0, changes_at(1))]);

        let (_, body2) = sched.next_snapshot(Vec::new, changes_at(3));
        assert!(!body2.full);
        assert_eq!(
            body2.redundant,
            vec![(0, changes_at(1)), (1, changes_at(2))]
        );

        // id 3: full again, and the K=2 tail now holds ids 1 and 2 (0 evicted).
        let (id3, body3) = sched.next_snapshot(Vec::new, changes_at(4));
        assert_eq!(id3, 3);
        assert!(body3.full);
        assert_eq!(
            body3.redundant,
            vec![(1, changes_at(2)), (2, changes_at(3))]
        );
    }
}
