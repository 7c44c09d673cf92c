//! # Stochcell Core
//!
//! Shared types for the stochcell biochemical reaction-network engine.
//!
//! Everything downstream of the model assembler works on dense vectors of
//! doubles: species counts and parameter values live in flat arrays, and
//! every propensity, delay, rule and expression carries only integer indices
//! into those arrays. The [`SymbolTable`] is where names are traded for
//! indices, exactly once, at model-assembly time.
//!
//! ## Design Philosophy
//!
//! 1. Structural errors surface at assembly time, never during evaluation
//! 2. Evaluation never touches strings
//! 3. Warnings tolerate benign schema evolution; errors guard semantics

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors raised while loading, assembling or querying a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unparseable rate expression: {0}")]
    UnparseableRate(String),

    #[error("malformed reaction: {0}")]
    MalformedReaction(String),

    #[error("invalid stoichiometry: {0}")]
    InvalidStoichiometry(String),

    #[error("unknown propensity type: {0}")]
    UnknownPropensityType(String),

    #[error("unknown delay type: {0}")]
    UnknownDelayType(String),

    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    #[error("unsupported rule frequency: {0}")]
    UnsupportedRuleFrequency(String),

    #[error("parameters referenced but never valued: {}", .0.join(", "))]
    UnspecifiedParameter(Vec<String>),

    #[error(
        "sampled division volume {division_volume} does not exceed the initial volume {initial_volume}"
    )]
    ImpossibleDivision {
        division_volume: f64,
        initial_volume: f64,
    },

    #[error("unknown name: {0}")]
    Lookup(String),

    #[error("malformed model document: {0}")]
    Document(String),

    #[error("dimension mismatch: {0}")]
    Dimension(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Simulation time.
pub type Time = f64;

/// Dense per-species counts, indexed by the symbol table.
pub type StateVector = Array1<f64>;

/// Dense parameter values, indexed by the symbol table.
pub type ParamVector = Array1<f64>;

/// Attribute set of one declarative element (`k="2.0"`, `species="A*B"`, ...).
///
/// Ordered so that warnings about stray attributes come out deterministically.
pub type AttrMap = BTreeMap<String, String>;

// =============================================================================
// SYMBOL TABLE
// =============================================================================

/// Two injective name-to-index maps, one for species and one for parameters.
///
/// Interning is monotone: the first time a name is seen it receives the next
/// free index, and that index never changes for the model's lifetime. The
/// value sets are therefore always exactly `0..n`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    species: HashMap<String, usize>,
    species_names: Vec<String>,
    parameters: HashMap<String, usize>,
    parameter_names: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `name` as a species, interning it on first sight.
    pub fn intern_species(&mut self, name: &str) -> usize {
        if let Some(&i) = self.species.get(name) {
            return i;
        }
        let i = self.species_names.len();
        self.species.insert(name.to_string(), i);
        self.species_names.push(name.to_string());
        i
    }

    /// Index of `name` as a parameter, interning it on first sight.
    pub fn intern_parameter(&mut self, name: &str) -> usize {
        if let Some(&i) = self.parameters.get(name) {
            return i;
        }
        let i = self.parameter_names.len();
        self.parameters.insert(name.to_string(), i);
        self.parameter_names.push(name.to_string());
        i
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species.get(name).copied()
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.get(name).copied()
    }

    /// Species names in index order.
    pub fn species_names(&self) -> &[String] {
        &self.species_names
    }

    /// Parameter names in index order.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn n_species(&self) -> usize {
        self.species_names.len()
    }

    pub fn n_parameters(&self) -> usize {
        self.parameter_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_monotone() {
        let mut table = SymbolTable::new();
        assert_eq!(table.intern_species("mRNA"), 0);
        assert_eq!(table.intern_species("protein"), 1);
        assert_eq!(table.intern_species("mRNA"), 0);
        assert_eq!(table.n_species(), 2);
        assert_eq!(table.species_names(), ["mRNA", "protein"]);
    }

    #[test]
    fn test_species_and_parameters_are_separate_namespaces() {
        let mut table = SymbolTable::new();
        table.intern_species("k");
        table.intern_parameter("k");
        assert_eq!(table.species_index("k"), Some(0));
        assert_eq!(table.parameter_index("k"), Some(0));
        assert_eq!(table.parameter_index("missing"), None);
    }

    #[test]
    fn test_indices_are_dense() {
        let mut table = SymbolTable::new();
        for name in ["a", "b", "c", "b", "a", "d"] {
            table.intern_parameter(name);
        }
        let mut seen: Vec<usize> = table
            .parameter_names()
            .iter()
            .map(|n| table.parameter_index(n).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unspecified_parameter_message_lists_names() {
        let err = ModelError::UnspecifiedParameter(vec!["beta".into(), "gamma".into()]);
        let msg = err.to_string();
        assert!(msg.contains("beta"));
        assert!(msg.contains("gamma"));
    }
}
