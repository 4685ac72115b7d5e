// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Authoritative N×N grid and claim monotonicity (`§3`).

use netrush_proto::{Change, UNCLAIMED};

/// Owner matrix. `owners[row * n + col]` is `0` (unclaimed) or a client id.
#[derive(Debug, Clone)]
pub struct Grid {
    side: u16,
    owners: Vec<u32>,
}

impl Grid {
    /// Build an empty `side x side` grid.
    #[must_use]
    pub fn new(side: u16) -> Self {
        Self {
            side,
            owners: vec![UNCLAIMED; usize::from(side) * usize::from(side)],
        }
    }

    /// Grid side length.
    #[must_use]
    pub fn side(&self) -> u16 {
        self.side
    }

    fn index(&self, row: u16, col: u16) -> usize {
        usize::from(row) * usize::from(self.side) + usize::from(col)
    }

    /// Flatten `(row, col)` to the `cell_index` carried on the wire.
    #[must_use]
    pub fn flat_index(&self, row: u16, col: u16) -> u32 {
        u32::from(row) * u32::from(self.side) + u32::from(col)
    }

    /// Unflatten a wire `cell_index` back to `(row, col)`, if in bounds.
    #[must_use]
    pub fn row_col(&self, cell_index: u32) -> Option<(u16, u16)> {
        let side = u32::from(self.side);
        if side == 0 || cell_index >= side * side {
            return None;
        }
        let row = u16::try_from(cell_index / side).ok()?;
        let col = u16::try_from(cell_index % side).ok()?;
        Some((row, col))
    }

    /// Current owner of a cell, `0` if unclaimed.
    #[must_use]
    pub fn owner(&self, row: u16, col: u16) -> u32 {
        self.owners[self.index(row, col)]
    }

    /// Claim a cell for `client_id` if unclaimed; otherwise a no-op.
    /// Returns the resolved owner (the caller's id on a fresh claim, the
    /// existing owner otherwise) and whether this call established it.
    pub fn try_claim(&mut self, row: u16, col: u16, client_id: u32) -> (u32, bool) {
        let idx = self.index(row, col);
        if self.owners[idx] == UNCLAIMED {
            self.owners[idx] = client_id;
            (client_id, true)
        } else {
            (self.owners[idx], false)
        }
    }

    /// `true` once every cell has a non-zero owner.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.owners.iter().all(|&o| o != UNCLAIMED)
    }

    /// All currently claimed cells, for a full snapshot or GAME_OVER body.
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

    /// Client ids tied for the largest claimed-cell count.
    #[must_use]
    pub fn winners(&self) -> Vec<u32> {
        let mut counts = std::collections::HashMap::new();
        for &owner in &self.owners {
            if owner != UNCLAIMED {
                *counts.entry(owner).or_insert(0u32) += 1;
            }
        }
        let Some(&max) = counts.values().max() else {
            return Vec::new();
        };
        let mut winners: Vec<u32> = counts
            .into_iter()
            .filter(|&(_, count)| count == max)
            .map(|(id, _)| id)
            .collect();
        winners.sort_unstable();
        winners
    }
}
