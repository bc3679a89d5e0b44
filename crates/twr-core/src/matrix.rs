//! Connectivity matrix and the per-node distance store
//!
//! The matrix is the shared artifact of the whole protocol: cell (i, j)
//! holds node i's last measured distance to node j in meters. Row i is
//! written only by node i (when it held the Initiator role) or received
//! wholesale in a hand-off merge. Rows i→j and j→i are measured
//! independently and may legitimately disagree; the protocol never
//! reconciles them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// N×N grid of measured inter-node distances, row-major, meters.
///
/// Unmeasured cells hold 0.0, which is also the self-distance placeholder
/// on the diagonal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityMatrix {
    node_count: usize,
    cells: Vec<f64>,
}

impl ConnectivityMatrix {
    /// Create an all-zero matrix for a deployment of `node_count` nodes.
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            cells: vec![0.0; node_count * node_count],
        }
    }

    /// Rebuild a matrix from row-major cells, e.g. decoded from a hand-off
    /// frame. Returns `None` when the cell count is not `node_count`².
    pub fn from_cells(node_count: usize, cells: Vec<f64>) -> Option<Self> {
        if cells.len() != node_count * node_count {
            return None;
        }
        Some(Self { node_count, cells })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.cells[row * self.node_count + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        let start = row * self.node_count;
        &self.cells[start..start + self.node_count]
    }

    pub fn set_row(&mut self, row: usize, values: &[f64]) {
        let start = row * self.node_count;
        self.cells[start..start + self.node_count].copy_from_slice(values);
    }

    /// Row-major cell slice, as laid out in the hand-off wire region.
    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    /// True when every off-diagonal cell has been measured at least once.
    pub fn is_fully_populated(&self) -> bool {
        for i in 0..self.node_count {
            for j in 0..self.node_count {
                if i != j && self.get(i, j) == 0.0 {
                    return false;
                }
            }
        }
        true
    }
}

impl fmt::Display for ConnectivityMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.node_count {
            for j in 0..self.node_count {
                write!(f, "{:3.3} M      ", self.get(i, j))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Node-local ranging state: the in-progress distance vector plus the
/// latest known copy of the global matrix.
///
/// No locking is needed anywhere here. Only the active role touches the
/// store, and a node is in exactly one role at a time, so `commit_row` and
/// `merge_matrix` can never race.
#[derive(Debug, Clone)]
pub struct ConnectivityStore {
    vector: Vec<f64>,
    matrix: ConnectivityMatrix,
}

impl ConnectivityStore {
    pub fn new(node_count: usize) -> Self {
        Self {
            vector: vec![0.0; node_count],
            matrix: ConnectivityMatrix::new(node_count),
        }
    }

    /// Record one measured distance into the in-progress vector.
    ///
    /// The caller guarantees `peer_id` is not its own id; the self slot is
    /// meaningless and stays 0.0.
    pub fn record_distance(&mut self, peer_id: u8, meters: f64) {
        self.vector[peer_id as usize] = meters;
    }

    /// Copy the current distance vector into matrix row `self_id`.
    ///
    /// This is the only place the matrix is self-mutated; every other row
    /// arrives via [`merge_matrix`](Self::merge_matrix).
    pub fn commit_row(&mut self, self_id: u8) {
        let row = self.vector.clone();
        self.matrix.set_row(self_id as usize, &row);
    }

    /// Wholesale-replace the local matrix with one received in a hand-off.
    ///
    /// There is no cell-wise reconciliation: the previous initiator's copy
    /// is at least as populated as ours, so replacement only adds state.
    pub fn merge_matrix(&mut self, received: ConnectivityMatrix) {
        self.matrix = received;
    }

    pub fn matrix(&self) -> &ConnectivityMatrix {
        &self.matrix
    }

    pub fn distance_vector(&self) -> &[f64] {
        &self.vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_commit_populates_own_row_only() {
        let mut store = ConnectivityStore::new(4);
        store.record_distance(1, 1.0);
        store.record_distance(2, 2.5);
        store.record_distance(3, 0.75);
        assert!(store.matrix().row(2).iter().all(|&d| d == 0.0));

        store.commit_row(2);
        assert_eq!(store.matrix().row(2), &[0.0, 1.0, 2.5, 0.75]);
        assert!(store.matrix().row(0).iter().all(|&d| d == 0.0));
        assert!(store.matrix().row(1).iter().all(|&d| d == 0.0));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut incoming = ConnectivityMatrix::new(3);
        incoming.set_row(0, &[0.0, 4.2, 1.1]);

        let mut store = ConnectivityStore::new(3);
        store.merge_matrix(incoming.clone());
        let once = store.matrix().clone();
        store.merge_matrix(incoming);
        assert_eq!(&once, store.matrix());
    }

    #[test]
    fn merge_replaces_wholesale() {
        let mut store = ConnectivityStore::new(2);
        store.record_distance(1, 9.9);
        store.commit_row(0);

        let incoming = ConnectivityMatrix::new(2);
        store.merge_matrix(incoming);
        // Replacement, not cell-wise max: the committed row is gone.
        assert_eq!(store.matrix().get(0, 1), 0.0);
    }

    #[test]
    fn from_cells_rejects_wrong_size() {
        assert!(ConnectivityMatrix::from_cells(3, vec![0.0; 8]).is_none());
        assert!(ConnectivityMatrix::from_cells(3, vec![0.0; 9]).is_some());
    }

    #[test]
    fn fully_populated_ignores_diagonal() {
        let mut m = ConnectivityMatrix::new(2);
        assert!(!m.is_fully_populated());
        m.set_row(0, &[0.0, 1.0]);
        m.set_row(1, &[2.0, 0.0]);
        assert!(m.is_fully_populated());
    }
}
