//! # Stochcell Lineage
//!
//! Lineage trees for single-cell simulations.
//!
//! A [`Schnitz`] is one cell's trajectory segment between divisions: its
//! sampled times, the species counts at each sample, the cell volume, and
//! links to its parent and daughters. A [`Lineage`] owns the Schnitzes of a
//! whole simulated colony; links are indices into the owning lineage rather
//! than shared pointers, so a lineage clones, serializes and prunes without
//! any reference juggling.

use ndarray::{s, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use stochcell_core::{ModelError, Result, Time};

/// One cell's trace between divisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schnitz {
    time: Vec<Time>,
    data: Array2<f64>,
    volume: Vec<f64>,
    pub parent: Option<usize>,
    pub daughter1: Option<usize>,
    pub daughter2: Option<usize>,
}

impl Schnitz {
    pub fn new(n_species: usize) -> Self {
        Self {
            time: Vec::new(),
            data: Array2::zeros((0, n_species)),
            volume: Vec::new(),
            parent: None,
            daughter1: None,
            daughter2: None,
        }
    }

    /// Append one sample. The state row must match the species count the
    /// Schnitz was created with.
    pub fn record(&mut self, time: Time, state: &[f64], volume: f64) -> Result<()> {
        if state.len() != self.data.ncols() {
            return Err(ModelError::Dimension(format!(
                "state has {} species, trace expects {}",
                state.len(),
                self.data.ncols()
            )));
        }
        self.data
            .push_row(ArrayView1::from(state))
            .map_err(|e| ModelError::Dimension(e.to_string()))?;
        self.time.push(time);
        self.volume.push(volume);
        Ok(())
    }

    pub fn times(&self) -> &[Time] {
        &self.time
    }

    /// Species counts, one row per sample.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn volumes(&self) -> &[f64] {
        &self.volume
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Copy of the first `end` samples, links carried over untouched.
    fn truncated_to(&self, end: usize) -> Schnitz {
        Schnitz {
            time: self.time[..end].to_vec(),
            data: self.data.slice(s![..end, ..]).to_owned(),
            volume: self.volume[..end].to_vec(),
            parent: self.parent,
            daughter1: self.daughter1,
            daughter2: self.daughter2,
        }
    }
}

/// A colony of [`Schnitz`]es descended from a common ancestor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    schnitzes: Vec<Schnitz>,
}

impl Lineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a Schnitz and return its index, the handle used for linking.
    pub fn add_schnitz(&mut self, schnitz: Schnitz) -> usize {
        self.schnitzes.push(schnitz);
        self.schnitzes.len() - 1
    }

    /// Link a division: both daughters point back at the parent.
    pub fn link_division(&mut self, parent: usize, daughter1: usize, daughter2: usize) -> Result<()> {
        for index in [parent, daughter1, daughter2] {
            if index >= self.schnitzes.len() {
                return Err(ModelError::Lookup(format!("schnitz #{index}")));
            }
        }
        self.schnitzes[parent].daughter1 = Some(daughter1);
        self.schnitzes[parent].daughter2 = Some(daughter2);
        self.schnitzes[daughter1].parent = Some(parent);
        self.schnitzes[daughter2].parent = Some(parent);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Schnitz> {
        self.schnitzes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Schnitz> {
        self.schnitzes.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schnitz> {
        self.schnitzes.iter()
    }

    pub fn len(&self) -> usize {
        self.schnitzes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schnitzes.is_empty()
    }

    /// Restrict the lineage to the window `[t_start, t_end]`.
    ///
    /// A cell survives only if it was *born* inside the window (first sample
    /// at or after `t_start`); survivors drop samples past `t_end`, and
    /// traces left empty are discarded. Parent/daughter links are re-mapped
    /// to the new lineage and cleared where they would point at a discarded
    /// cell, so every link in the result targets a retained Schnitz.
    pub fn truncate(&self, t_start: Time, t_end: Time) -> Lineage {
        let mut index_map: Vec<Option<usize>> = vec![None; self.schnitzes.len()];
        let mut kept: Vec<Schnitz> = Vec::new();
        for (index, schnitz) in self.schnitzes.iter().enumerate() {
            let born_in_window = schnitz.time.first().is_some_and(|&t0| t0 >= t_start);
            if !born_in_window {
                continue;
            }
            let end = schnitz.time.partition_point(|&t| t <= t_end);
            if end == 0 {
                continue;
            }
            index_map[index] = Some(kept.len());
            kept.push(schnitz.truncated_to(end));
        }
        for schnitz in &mut kept {
            schnitz.parent = schnitz.parent.and_then(|i| index_map[i]);
            schnitz.daughter1 = schnitz.daughter1.and_then(|i| index_map[i]);
            schnitz.daughter2 = schnitz.daughter2.and_then(|i| index_map[i]);
        }
        Lineage { schnitzes: kept }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schnitz_with_times(times: &[f64]) -> Schnitz {
        let mut s = Schnitz::new(2);
        for &t in times {
            s.record(t, &[t, 2.0 * t], 1.0 + t / 100.0).unwrap();
        }
        s
    }

    fn divided_colony() -> Lineage {
        let mut lineage = Lineage::new();
        let root = lineage.add_schnitz(schnitz_with_times(&[0.0, 10.0, 20.0]));
        let d1 = lineage.add_schnitz(schnitz_with_times(&[20.0, 30.0]));
        let d2 = lineage.add_schnitz(schnitz_with_times(&[20.0, 30.0]));
        lineage.link_division(root, d1, d2).unwrap();
        lineage
    }

    #[test]
    fn test_record_tracks_all_traces() {
        let s = schnitz_with_times(&[0.0, 1.0, 2.0]);
        assert_eq!(s.len(), 3);
        assert_eq!(s.times(), [0.0, 1.0, 2.0]);
        assert_eq!(s.data().nrows(), 3);
        assert_eq!(s.data()[[2, 1]], 4.0);
        assert_eq!(s.volumes().len(), 3);
    }

    #[test]
    fn test_record_rejects_wrong_width() {
        let mut s = Schnitz::new(2);
        let err = s.record(0.0, &[1.0, 2.0, 3.0], 1.0).unwrap_err();
        assert!(matches!(err, ModelError::Dimension(_)));
    }

    #[test]
    fn test_truncate_drops_cells_born_before_window() {
        let lineage = divided_colony();
        let pruned = lineage.truncate(15.0, 25.0);
        // The root was born at t=0, so only the daughters survive, each
        // trimmed to their t=20 sample.
        assert_eq!(pruned.len(), 2);
        for schnitz in pruned.iter() {
            assert_eq!(schnitz.times(), [20.0]);
            assert_eq!(schnitz.parent, None);
            assert_eq!(schnitz.daughter1, None);
            assert_eq!(schnitz.daughter2, None);
        }
    }

    #[test]
    fn test_truncate_window_invariant() {
        let lineage = divided_colony();
        for (a, b) in [(0.0, 15.0), (0.0, 30.0), (15.0, 25.0), (20.0, 40.0)] {
            let pruned = lineage.truncate(a, b);
            for schnitz in pruned.iter() {
                assert!(!schnitz.is_empty());
                assert!(schnitz.times()[0] >= a);
                assert!(*schnitz.times().last().unwrap() <= b);
                for link in [schnitz.parent, schnitz.daughter1, schnitz.daughter2] {
                    if let Some(target) = link {
                        assert!(pruned.get(target).is_some());
                    }
                }
            }
        }
    }

    #[test]
    fn test_truncate_keeps_links_inside_window() {
        let lineage = divided_colony();
        let pruned = lineage.truncate(0.0, 30.0);
        assert_eq!(pruned.len(), 3);
        let root = pruned.get(0).unwrap();
        assert_eq!(root.daughter1, Some(1));
        assert_eq!(root.daughter2, Some(2));
        assert_eq!(pruned.get(1).unwrap().parent, Some(0));
        assert_eq!(pruned.get(2).unwrap().parent, Some(0));
    }

    #[test]
    fn test_truncate_drops_traces_entirely_past_window() {
        let mut lineage = divided_colony();
        let late = lineage.add_schnitz(schnitz_with_times(&[26.0, 31.0]));
        assert_eq!(late, 3);
        let pruned = lineage.truncate(15.0, 25.0);
        // Born at 26, every sample past t_end: gone.
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_truncate_preserves_sample_data() {
        let lineage = divided_colony();
        let pruned = lineage.truncate(15.0, 30.0);
        let daughter = pruned.get(0).unwrap();
        assert_eq!(daughter.times(), [20.0, 30.0]);
        assert_eq!(daughter.data()[[0, 0]], 20.0);
        assert_eq!(daughter.data()[[1, 1]], 60.0);
        assert_eq!(daughter.volumes()[0], 1.2);
    }

    #[test]
    fn test_lineage_serde_round_trip() {
        let lineage = divided_colony();
        let json = serde_json::to_string(&lineage).unwrap();
        let back: Lineage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lineage);
    }
}
