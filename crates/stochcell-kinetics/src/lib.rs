//! # Stochcell Kinetics
//!
//! The closed catalogs behind every reaction in a stochcell model:
//!
//! 1. **Propensities**: rate-law shapes with scalar and volume-aware forms
//! 2. **Delays**: waiting-time distributions sampled per reaction firing
//! 3. **Rules**: assignment rules applied repeatedly during integration
//! 4. **Volume models**: growth trajectories and division predicates
//!
//! Each catalog is a tagged enum so the hot evaluation path is a single
//! jump-table dispatch. The specialized propensity shapes (constitutive,
//! unimolecular, bimolecular, Hill) avoid any tree walk; the `General`
//! variant falls back to an expression tree for arbitrary rate laws.
//!
//! All variants carry only dense indices after binding. Binding follows a
//! shared contract: `species_and_parameters` surfaces free names from an
//! attribute set with no symbol table in sight (the assembler interns those
//! names), and `from_fields` then resolves names to indices. Missing
//! required attributes are errors; unrecognized attributes are warnings.

use log::warn;
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use stochcell_core::{AttrMap, ModelError, Result, SymbolTable, Time};
use stochcell_expr::{parse_rate, Term};

fn require<'a>(fields: &'a AttrMap, key: &str, what: &str) -> Result<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ModelError::MalformedReaction(format!("{what} is missing attribute '{key}'")))
}

fn warn_stray_fields(fields: &AttrMap, known: &[&str], what: &str) {
    for key in fields.keys() {
        if !known.contains(&key.as_str()) {
            warn!("ignoring unrecognized attribute '{key}' on {what}");
        }
    }
}

/// Split a `*`-separated species product such as `"A*A*B"`.
///
/// `+` or `-` inside the product is a stoichiometry mistake, not a rate
/// expression, and is rejected outright.
fn split_species_product(product: &str) -> Result<Vec<String>> {
    if product.contains('+') || product.contains('-') {
        return Err(ModelError::InvalidStoichiometry(format!(
            "species product '{product}' must be '*'-separated"
        )));
    }
    let trimmed = product.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split('*')
        .map(|name| {
            let name = name.trim();
            if name.is_empty() {
                Err(ModelError::InvalidStoichiometry(format!(
                    "empty operand in species product '{product}'"
                )))
            } else {
                Ok(name.to_string())
            }
        })
        .collect()
}

fn species_index(symbols: &SymbolTable, name: &str) -> Result<usize> {
    symbols
        .species_index(name)
        .ok_or_else(|| ModelError::Lookup(name.to_string()))
}

fn parameter_index(symbols: &SymbolTable, name: &str) -> Result<usize> {
    symbols
        .parameter_index(name)
        .ok_or_else(|| ModelError::Lookup(name.to_string()))
}

// =============================================================================
// PROPENSITIES
// =============================================================================

/// Declarative propensity type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropensityType {
    Constitutive,
    Unimolecular,
    Bimolecular,
    MassAction,
    HillPositive,
    HillNegative,
    ProportionalHillPositive,
    ProportionalHillNegative,
    General,
}

impl PropensityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropensityType::Constitutive => "constitutive",
            PropensityType::Unimolecular => "unimolecular",
            PropensityType::Bimolecular => "bimolecular",
            PropensityType::MassAction => "massaction",
            PropensityType::HillPositive => "hillpositive",
            PropensityType::HillNegative => "hillnegative",
            PropensityType::ProportionalHillPositive => "proportionalhillpositive",
            PropensityType::ProportionalHillNegative => "proportionalhillnegative",
            PropensityType::General => "general",
        }
    }

    /// Attribute keys that name parameters (as opposed to species or rate
    /// expressions) for this propensity type. The assembler uses this to
    /// accept numeric literals in these slots.
    pub fn parameter_fields(&self) -> &'static [&'static str] {
        match self {
            PropensityType::Constitutive
            | PropensityType::Unimolecular
            | PropensityType::Bimolecular
            | PropensityType::MassAction => &["k"],
            PropensityType::HillPositive
            | PropensityType::HillNegative
            | PropensityType::ProportionalHillPositive
            | PropensityType::ProportionalHillNegative => &["k", "K", "n"],
            PropensityType::General => &[],
        }
    }
}

impl fmt::Display for PropensityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropensityType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constitutive" => Ok(PropensityType::Constitutive),
            "unimolecular" => Ok(PropensityType::Unimolecular),
            "bimolecular" => Ok(PropensityType::Bimolecular),
            "massaction" => Ok(PropensityType::MassAction),
            "hillpositive" => Ok(PropensityType::HillPositive),
            "hillnegative" => Ok(PropensityType::HillNegative),
            "proportionalhillpositive" => Ok(PropensityType::ProportionalHillPositive),
            "proportionalhillnegative" => Ok(PropensityType::ProportionalHillNegative),
            "general" => Ok(PropensityType::General),
            other => Err(ModelError::UnknownPropensityType(other.to_string())),
        }
    }
}

/// A bound rate law. All fields are dense indices into the state or
/// parameter vector; `General` owns an expression tree instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Propensity {
    /// `k`
    Constitutive { k: usize },
    /// `k * x`
    Unimolecular { k: usize, species: usize },
    /// `k * x1 * x2`
    Bimolecular { k: usize, s1: usize, s2: usize },
    /// `k * prod(x_i)` for three or more reactant slots
    MassAction { k: usize, species: Vec<usize> },
    /// `k * (x/K)^n / (1 + (x/K)^n)`
    HillPositive { k: usize, s1: usize, kd: usize, n: usize },
    /// `k / (1 + (x/K)^n)`
    HillNegative { k: usize, s1: usize, kd: usize, n: usize },
    /// `k * d * (x/K)^n / (1 + (x/K)^n)`
    ProportionalHillPositive { k: usize, d: usize, s1: usize, kd: usize, n: usize },
    /// `k * d / (1 + (x/K)^n)`
    ProportionalHillNegative { k: usize, d: usize, s1: usize, kd: usize, n: usize },
    /// Arbitrary expression tree.
    General { rate: Term },
}

impl Propensity {
    /// Reaction rate with an implicit unit volume.
    #[inline]
    pub fn get_propensity(&self, state: &[f64], params: &[f64], time: Time) -> f64 {
        self.get_volume_propensity(state, params, 1.0, time)
    }

    /// Reaction rate against an explicit cell volume.
    ///
    /// Counts are rescaled to concentrations here, per shape: bimolecular
    /// collisions dilute with `1/V`, n-body mass action with `1/V^(n-1)`,
    /// and Hill inputs are concentrations `x/V`.
    pub fn get_volume_propensity(
        &self,
        state: &[f64],
        params: &[f64],
        volume: f64,
        time: Time,
    ) -> f64 {
        match self {
            Propensity::Constitutive { k } => params[*k] * volume,
            Propensity::Unimolecular { k, species } => params[*k] * state[*species],
            Propensity::Bimolecular { k, s1, s2 } => {
                params[*k] * state[*s1] * state[*s2] / volume
            }
            Propensity::MassAction { k, species } => {
                let product: f64 = species.iter().map(|&i| state[i]).product();
                params[*k] * product / volume.powi(species.len() as i32 - 1)
            }
            Propensity::HillPositive { k, s1, kd, n } => {
                let ratio = (state[*s1] / volume / params[*kd]).powf(params[*n]);
                params[*k] * ratio / (1.0 + ratio)
            }
            Propensity::HillNegative { k, s1, kd, n } => {
                let ratio = (state[*s1] / volume / params[*kd]).powf(params[*n]);
                params[*k] / (1.0 + ratio)
            }
            Propensity::ProportionalHillPositive { k, d, s1, kd, n } => {
                let ratio = (state[*s1] / volume / params[*kd]).powf(params[*n]);
                params[*k] * state[*d] * ratio / (1.0 + ratio)
            }
            Propensity::ProportionalHillNegative { k, d, s1, kd, n } => {
                let ratio = (state[*s1] / volume / params[*kd]).powf(params[*n]);
                params[*k] * state[*d] / (1.0 + ratio)
            }
            Propensity::General { rate } => rate.volume_evaluate(state, params, volume, time),
        }
    }

    /// Free species and parameter names in an attribute set, in that order.
    ///
    /// Needs no symbol table; the assembler calls this to intern names
    /// before any binding happens.
    pub fn species_and_parameters(
        kind: PropensityType,
        fields: &AttrMap,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let what = format!("{kind} propensity");
        match kind {
            PropensityType::Constitutive => {
                let k = require(fields, "k", &what)?;
                Ok((vec![], vec![k.to_string()]))
            }
            PropensityType::Unimolecular => {
                let k = require(fields, "k", &what)?;
                let species = require(fields, "species", &what)?;
                Ok((vec![species.to_string()], vec![k.to_string()]))
            }
            PropensityType::Bimolecular | PropensityType::MassAction => {
                let k = require(fields, "k", &what)?;
                let product = fields.get("species").map(String::as_str).unwrap_or("");
                Ok((split_species_product(product)?, vec![k.to_string()]))
            }
            PropensityType::HillPositive | PropensityType::HillNegative => {
                let k = require(fields, "k", &what)?;
                let kd = require(fields, "K", &what)?;
                let n = require(fields, "n", &what)?;
                let s1 = require(fields, "s1", &what)?;
                Ok((
                    vec![s1.to_string()],
                    vec![k.to_string(), kd.to_string(), n.to_string()],
                ))
            }
            PropensityType::ProportionalHillPositive
            | PropensityType::ProportionalHillNegative => {
                let k = require(fields, "k", &what)?;
                let kd = require(fields, "K", &what)?;
                let n = require(fields, "n", &what)?;
                let s1 = require(fields, "s1", &what)?;
                let d = require(fields, "d", &what)?;
                Ok((
                    vec![s1.to_string(), d.to_string()],
                    vec![k.to_string(), kd.to_string(), n.to_string()],
                ))
            }
            PropensityType::General => {
                let rate = require(fields, "rate", &what)?;
                let expr = parse_rate(rate)?;
                Ok((expr.species_names(), expr.parameter_names()))
            }
        }
    }

    /// Bind an attribute set against the final symbol table.
    ///
    /// `massaction` with zero, one or two operand species is specialized to
    /// the constitutive, unimolecular or bimolecular shape; the semantics
    /// are identical, only the dispatch is cheaper.
    pub fn from_fields(
        kind: PropensityType,
        fields: &AttrMap,
        symbols: &SymbolTable,
    ) -> Result<Propensity> {
        let what = format!("{kind} propensity");
        let prop = match kind {
            PropensityType::Constitutive => {
                warn_stray_fields(fields, &["k"], &what);
                Propensity::Constitutive {
                    k: parameter_index(symbols, require(fields, "k", &what)?)?,
                }
            }
            PropensityType::Unimolecular => {
                warn_stray_fields(fields, &["k", "species"], &what);
                Propensity::Unimolecular {
                    k: parameter_index(symbols, require(fields, "k", &what)?)?,
                    species: species_index(symbols, require(fields, "species", &what)?)?,
                }
            }
            PropensityType::Bimolecular => {
                warn_stray_fields(fields, &["k", "species"], &what);
                let operands = split_species_product(require(fields, "species", &what)?)?;
                if operands.len() != 2 {
                    return Err(ModelError::MalformedReaction(format!(
                        "{what} needs exactly two species, got {}",
                        operands.len()
                    )));
                }
                Propensity::Bimolecular {
                    k: parameter_index(symbols, require(fields, "k", &what)?)?,
                    s1: species_index(symbols, &operands[0])?,
                    s2: species_index(symbols, &operands[1])?,
                }
            }
            PropensityType::MassAction => {
                warn_stray_fields(fields, &["k", "species"], &what);
                let k = parameter_index(symbols, require(fields, "k", &what)?)?;
                let product = fields.get("species").map(String::as_str).unwrap_or("");
                let operands = split_species_product(product)?;
                let indices = operands
                    .iter()
                    .map(|name| species_index(symbols, name))
                    .collect::<Result<Vec<_>>>()?;
                match indices.as_slice() {
                    [] => Propensity::Constitutive { k },
                    [species] => Propensity::Unimolecular {
                        k,
                        species: *species,
                    },
                    [s1, s2] => Propensity::Bimolecular {
                        k,
                        s1: *s1,
                        s2: *s2,
                    },
                    _ => Propensity::MassAction {
                        k,
                        species: indices,
                    },
                }
            }
            PropensityType::HillPositive
            | PropensityType::HillNegative
            | PropensityType::ProportionalHillPositive
            | PropensityType::ProportionalHillNegative => {
                let proportional = matches!(
                    kind,
                    PropensityType::ProportionalHillPositive
                        | PropensityType::ProportionalHillNegative
                );
                if proportional {
                    warn_stray_fields(fields, &["k", "K", "n", "s1", "d"], &what);
                } else {
                    warn_stray_fields(fields, &["k", "K", "n", "s1"], &what);
                }
                let k = parameter_index(symbols, require(fields, "k", &what)?)?;
                let kd = parameter_index(symbols, require(fields, "K", &what)?)?;
                let n = parameter_index(symbols, require(fields, "n", &what)?)?;
                let s1 = species_index(symbols, require(fields, "s1", &what)?)?;
                match kind {
                    PropensityType::HillPositive => Propensity::HillPositive { k, s1, kd, n },
                    PropensityType::HillNegative => Propensity::HillNegative { k, s1, kd, n },
                    PropensityType::ProportionalHillPositive => {
                        let d = species_index(symbols, require(fields, "d", &what)?)?;
                        Propensity::ProportionalHillPositive { k, d, s1, kd, n }
                    }
                    PropensityType::ProportionalHillNegative => {
                        let d = species_index(symbols, require(fields, "d", &what)?)?;
                        Propensity::ProportionalHillNegative { k, d, s1, kd, n }
                    }
                    _ => unreachable!(),
                }
            }
            PropensityType::General => {
                warn_stray_fields(fields, &["rate"], &what);
                let rate = parse_rate(require(fields, "rate", &what)?)?.bind(symbols)?;
                Propensity::General { rate }
            }
        };
        Ok(prop)
    }
}

// =============================================================================
// DELAYS
// =============================================================================

/// Declarative delay type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayType {
    None,
    Fixed,
    Gaussian,
    Gamma,
}

impl DelayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayType::None => "none",
            DelayType::Fixed => "fixed",
            DelayType::Gaussian => "gaussian",
            DelayType::Gamma => "gamma",
        }
    }

    /// Attribute keys naming parameters for this delay type.
    pub fn parameter_fields(&self) -> &'static [&'static str] {
        match self {
            DelayType::None => &[],
            DelayType::Fixed => &["delay"],
            DelayType::Gaussian => &["mean", "std"],
            DelayType::Gamma => &["k", "theta"],
        }
    }
}

impl fmt::Display for DelayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DelayType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(DelayType::None),
            "fixed" => Ok(DelayType::Fixed),
            "gaussian" => Ok(DelayType::Gaussian),
            "gamma" => Ok(DelayType::Gamma),
            other => Err(ModelError::UnknownDelayType(other.to_string())),
        }
    }
}

/// Waiting time between a reaction firing and its delayed stoichiometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delay {
    None,
    Fixed { delay: usize },
    Gaussian { mean: usize, std: usize },
    Gamma { k: usize, theta: usize },
}

impl Delay {
    /// Sample the waiting time for one firing.
    ///
    /// Gaussian delays can come out negative; they are returned as-is and
    /// the delay queue decides how to treat them. A gamma with non-positive
    /// shape or scale yields NaN, which the simulator's NaN checks catch.
    pub fn get_delay<R: Rng + ?Sized>(
        &self,
        _state: &[f64],
        params: &[f64],
        _time: Time,
        rng: &mut R,
    ) -> f64 {
        match self {
            Delay::None => 0.0,
            Delay::Fixed { delay } => params[*delay],
            Delay::Gaussian { mean, std } => {
                let z: f64 = rng.sample(StandardNormal);
                params[*mean] + params[*std] * z
            }
            Delay::Gamma { k, theta } => match Gamma::new(params[*k], params[*theta]) {
                Ok(gamma) => gamma.sample(rng),
                Err(_) => f64::NAN,
            },
        }
    }

    /// Free species and parameter names in an attribute set (delays never
    /// reference species; the species list is always empty).
    pub fn species_and_parameters(
        kind: DelayType,
        fields: &AttrMap,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let what = format!("{kind} delay");
        let params = kind
            .parameter_fields()
            .iter()
            .map(|key| require(fields, key, &what).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        Ok((Vec::new(), params))
    }

    /// Bind an attribute set against the final symbol table.
    pub fn from_fields(kind: DelayType, fields: &AttrMap, symbols: &SymbolTable) -> Result<Delay> {
        let what = format!("{kind} delay");
        warn_stray_fields(fields, kind.parameter_fields(), &what);
        let index = |key: &str| -> Result<usize> {
            parameter_index(symbols, require(fields, key, &what)?)
        };
        Ok(match kind {
            DelayType::None => Delay::None,
            DelayType::Fixed => Delay::Fixed { delay: index("delay")? },
            DelayType::Gaussian => Delay::Gaussian {
                mean: index("mean")?,
                std: index("std")?,
            },
            DelayType::Gamma => Delay::Gamma {
                k: index("k")?,
                theta: index("theta")?,
            },
        })
    }
}

// =============================================================================
// RULES
// =============================================================================

/// Declarative rule type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleType {
    Additive,
    Assignment,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleType::Additive => "additive",
            RuleType::Assignment => "assignment",
        })
    }
}

impl FromStr for RuleType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "additive" => Ok(RuleType::Additive),
            "assignment" => Ok(RuleType::Assignment),
            other => Err(ModelError::UnknownRuleType(other.to_string())),
        }
    }
}

/// Destination slot of an assignment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleTarget {
    Species(usize),
    Parameter(usize),
}

/// An assignment rule, applied once per simulator step in declaration order.
///
/// Rules mutate the state or parameter vector in place; a rule sees every
/// mutation made by earlier rules in the same step. There is no dependency
/// analysis and no fixed-point iteration: a right-hand side that reads a
/// slot written by a *later* rule sees the pre-step value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    /// `dest = s1 + s2 + ...` over species counts.
    AdditiveAssignment { dest: usize, summands: Vec<usize> },
    /// `target = <expression>`.
    GeneralAssignment { target: RuleTarget, rhs: Term },
}

fn check_frequency(fields: &AttrMap) -> Result<()> {
    match fields.get("frequency").map(String::as_str) {
        None | Some("repeated") => Ok(()),
        Some(other) => Err(ModelError::UnsupportedRuleFrequency(other.to_string())),
    }
}

fn split_equation<'a>(fields: &'a AttrMap, what: &str) -> Result<(&'a str, &'a str)> {
    let equation = require(fields, "equation", what)?;
    let (lhs, rhs) = equation.split_once('=').ok_or_else(|| {
        ModelError::MalformedReaction(format!("{what} equation '{equation}' has no '='"))
    })?;
    Ok((lhs.trim(), rhs.trim()))
}

/// A rule target name: plain names are species, a `|`/`_` marker means the
/// parameter slot of that name.
fn classify_target<'a>(name: &'a str, what: &str) -> Result<(bool, &'a str)> {
    if name == "volume" || name == "t" {
        return Err(ModelError::MalformedReaction(format!(
            "{what} cannot assign to reserved name '{name}'"
        )));
    }
    if let Some(stripped) = name.strip_prefix('|').or_else(|| name.strip_prefix('_')) {
        if stripped.is_empty() {
            return Err(ModelError::MalformedReaction(format!(
                "{what} has a parameter marker without a name"
            )));
        }
        Ok((true, stripped))
    } else if name.is_empty() {
        Err(ModelError::MalformedReaction(format!(
            "{what} has an empty name in its equation"
        )))
    } else {
        Ok((false, name))
    }
}

impl Rule {
    /// Apply with an implicit unit volume.
    #[inline]
    pub fn apply(&self, state: &mut [f64], params: &mut [f64], time: Time) {
        self.volume_apply(state, params, 1.0, time);
    }

    /// Apply against an explicit cell volume.
    pub fn volume_apply(&self, state: &mut [f64], params: &mut [f64], volume: f64, time: Time) {
        match self {
            Rule::AdditiveAssignment { dest, summands } => {
                let total: f64 = summands.iter().map(|&i| state[i]).sum();
                state[*dest] = total;
            }
            Rule::GeneralAssignment { target, rhs } => {
                let value = rhs.volume_evaluate(state, params, volume, time);
                match target {
                    RuleTarget::Species(i) => state[*i] = value,
                    RuleTarget::Parameter(i) => params[*i] = value,
                }
            }
        }
    }

    /// Free species and parameter names in an attribute set. Also rejects
    /// any frequency other than `repeated` so the failure surfaces during
    /// discovery, before any name is interned.
    pub fn species_and_parameters(
        kind: RuleType,
        fields: &AttrMap,
    ) -> Result<(Vec<String>, Vec<String>)> {
        check_frequency(fields)?;
        let what = format!("{kind} rule");
        let (lhs, rhs) = split_equation(fields, &what)?;
        match kind {
            RuleType::Additive => {
                let (is_param, dest) = classify_target(lhs, &what)?;
                if is_param {
                    return Err(ModelError::MalformedReaction(format!(
                        "{what} target '{lhs}' must be a species"
                    )));
                }
                let mut species = vec![dest.to_string()];
                for name in rhs.split('+') {
                    let name = name.trim();
                    let (is_param, name) = classify_target(name, &what)?;
                    if is_param {
                        return Err(ModelError::MalformedReaction(format!(
                            "{what} sums species, got parameter '{name}'"
                        )));
                    }
                    species.push(name.to_string());
                }
                Ok((species, Vec::new()))
            }
            RuleType::Assignment => {
                let (is_param, dest) = classify_target(lhs, &what)?;
                let expr = parse_rate(rhs)?;
                let mut species = expr.species_names();
                let mut params = expr.parameter_names();
                if is_param {
                    params.push(dest.to_string());
                } else {
                    species.push(dest.to_string());
                }
                Ok((species, params))
            }
        }
    }

    /// Bind an attribute set against the final symbol table.
    pub fn from_fields(kind: RuleType, fields: &AttrMap, symbols: &SymbolTable) -> Result<Rule> {
        check_frequency(fields)?;
        let what = format!("{kind} rule");
        warn_stray_fields(fields, &["equation", "frequency"], &what);
        let (lhs, rhs) = split_equation(fields, &what)?;
        match kind {
            RuleType::Additive => {
                let (is_param, dest) = classify_target(lhs, &what)?;
                if is_param {
                    return Err(ModelError::MalformedReaction(format!(
                        "{what} target '{lhs}' must be a species"
                    )));
                }
                let dest = species_index(symbols, dest)?;
                let summands = rhs
                    .split('+')
                    .map(|name| species_index(symbols, name.trim()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Rule::AdditiveAssignment { dest, summands })
            }
            RuleType::Assignment => {
                let (is_param, dest) = classify_target(lhs, &what)?;
                let target = if is_param {
                    RuleTarget::Parameter(parameter_index(symbols, dest)?)
                } else {
                    RuleTarget::Species(species_index(symbols, dest)?)
                };
                let rhs = parse_rate(rhs)?.bind(symbols)?;
                Ok(Rule::GeneralAssignment { target, rhs })
            }
        }
    }
}

// =============================================================================
// VOLUME MODELS
// =============================================================================

/// Exponential growth toward a pre-sampled division instant.
///
/// The division time is drawn once at `initialize`, so each cell has a
/// deterministic division instant independent of subsequent stochastic
/// firings. Daughter cells are `clone`d and re-initialized, which re-draws
/// their own instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StochasticTimeThresholdVolume {
    cycle_time: f64,
    division_volume: f64,
    noise: f64,
    growth_rate: f64,
    division_time: f64,
}

impl StochasticTimeThresholdVolume {
    pub fn new(cycle_time: f64, division_volume: f64, noise: f64) -> Self {
        Self {
            cycle_time,
            division_volume,
            noise,
            growth_rate: std::f64::consts::LN_2 / cycle_time,
            division_time: f64::NAN,
        }
    }
}

/// Growth at a state-dependent rate, dividing at a pre-sampled volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDependentVolume {
    mean_division_volume: f64,
    noise: f64,
    growth_rate: Term,
    division_volume: f64,
}

impl StateDependentVolume {
    pub fn new(mean_division_volume: f64, noise: f64, growth_rate: Term) -> Self {
        Self {
            mean_division_volume,
            noise,
            growth_rate,
            division_volume: f64::NAN,
        }
    }
}

/// Cell-volume growth trajectory and division predicate.
///
/// Holds per-cell scalar state; `clone` is the deep copy handed to each
/// daughter on division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VolumeModel {
    StochasticTimeThreshold(StochasticTimeThresholdVolume),
    StateDependent(StateDependentVolume),
}

impl From<StochasticTimeThresholdVolume> for VolumeModel {
    fn from(v: StochasticTimeThresholdVolume) -> Self {
        VolumeModel::StochasticTimeThreshold(v)
    }
}

impl From<StateDependentVolume> for VolumeModel {
    fn from(v: StateDependentVolume) -> Self {
        VolumeModel::StateDependent(v)
    }
}

impl VolumeModel {
    /// Draw this cell's division point.
    ///
    /// For the time-threshold model the division instant is
    /// `time + N(1, noise) * ln(V*/v0) / growth_rate`; for the
    /// state-dependent model the division volume is `N(1, noise) * V*`,
    /// which must exceed the initial volume.
    pub fn initialize<R: Rng + ?Sized>(
        &mut self,
        _state: &[f64],
        _params: &[f64],
        time: Time,
        volume: f64,
        rng: &mut R,
    ) -> Result<()> {
        match self {
            VolumeModel::StochasticTimeThreshold(m) => {
                let z: f64 = rng.sample(StandardNormal);
                let scale = 1.0 + m.noise * z;
                // ln(V*/v0) / growth_rate, written base-2 so a clean doubling
                // lands on an exact division instant.
                m.division_time =
                    time + scale * m.cycle_time * (m.division_volume / volume).log2();
                Ok(())
            }
            VolumeModel::StateDependent(m) => {
                let z: f64 = rng.sample(StandardNormal);
                m.division_volume = (1.0 + m.noise * z) * m.mean_division_volume;
                if m.division_volume <= volume {
                    Err(ModelError::ImpossibleDivision {
                        division_volume: m.division_volume,
                        initial_volume: volume,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Volume increment over `dt` of exponential growth.
    pub fn get_volume_step(
        &self,
        state: &[f64],
        params: &[f64],
        time: Time,
        volume: f64,
        dt: f64,
    ) -> f64 {
        match self {
            VolumeModel::StochasticTimeThreshold(m) => {
                volume * ((m.growth_rate * dt).exp() - 1.0)
            }
            VolumeModel::StateDependent(m) => {
                let rate = m.growth_rate.volume_evaluate(state, params, volume, time);
                volume * ((rate * dt).exp() - 1.0)
            }
        }
    }

    /// Whether this cell divides in the step ending at `time`.
    pub fn cell_divided(
        &self,
        _state: &[f64],
        _params: &[f64],
        time: Time,
        volume: f64,
        dt: f64,
    ) -> bool {
        match self {
            VolumeModel::StochasticTimeThreshold(m) => {
                m.division_time > time - dt && m.division_time <= time
            }
            VolumeModel::StateDependent(m) => volume > m.division_volume,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn attrs(pairs: &[(&str, &str)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn table(species: &[&str], params: &[&str]) -> SymbolTable {
        let mut t = SymbolTable::new();
        for s in species {
            t.intern_species(s);
        }
        for p in params {
            t.intern_parameter(p);
        }
        t
    }

    #[test]
    fn test_constitutive_propensity() {
        let symbols = table(&[], &["k"]);
        let p =
            Propensity::from_fields(PropensityType::Constitutive, &attrs(&[("k", "k")]), &symbols)
                .unwrap();
        let params = [2.0];
        assert_eq!(p.get_propensity(&[], &params, 0.0), 2.0);
        assert_eq!(p.get_volume_propensity(&[], &params, 3.0, 0.0), 6.0);
    }

    #[test]
    fn test_hill_positive_propensity() {
        let symbols = table(&["x"], &["k", "K", "n"]);
        let fields = attrs(&[("k", "k"), ("K", "K"), ("n", "n"), ("s1", "x")]);
        let p = Propensity::from_fields(PropensityType::HillPositive, &fields, &symbols).unwrap();
        let params = [10.0, 5.0, 2.0];
        assert!((p.get_propensity(&[5.0], &params, 0.0) - 5.0).abs() < 1e-12);
        assert_eq!(p.get_propensity(&[0.0], &params, 0.0), 0.0);
        // Saturates toward k.
        assert!((p.get_propensity(&[5e8], &params, 0.0) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_hill_negative_complements_positive() {
        let symbols = table(&["x"], &["k", "K", "n"]);
        let fields = attrs(&[("k", "k"), ("K", "K"), ("n", "n"), ("s1", "x")]);
        let pos = Propensity::from_fields(PropensityType::HillPositive, &fields, &symbols).unwrap();
        let neg = Propensity::from_fields(PropensityType::HillNegative, &fields, &symbols).unwrap();
        let params = [10.0, 5.0, 2.0];
        for x in [0.0, 1.0, 5.0, 20.0] {
            let total =
                pos.get_propensity(&[x], &params, 0.0) + neg.get_propensity(&[x], &params, 0.0);
            assert!((total - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_proportional_hill_scales_with_d() {
        let symbols = table(&["x", "m"], &["k", "K", "n"]);
        let fields = attrs(&[("k", "k"), ("K", "K"), ("n", "n"), ("s1", "x"), ("d", "m")]);
        let p =
            Propensity::from_fields(PropensityType::ProportionalHillPositive, &fields, &symbols)
                .unwrap();
        let params = [10.0, 5.0, 2.0];
        assert!((p.get_propensity(&[5.0, 3.0], &params, 0.0) - 15.0).abs() < 1e-12);
        // d stays a raw count under volume evaluation.
        let v = 2.0;
        let ratio = (5.0 / v / 5.0_f64).powf(2.0);
        let expected = 10.0 * 3.0 * ratio / (1.0 + ratio);
        assert!((p.get_volume_propensity(&[5.0, 3.0], &params, v, 0.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_bimolecular_volume_scaling() {
        let symbols = table(&["a", "b"], &["k"]);
        let fields = attrs(&[("k", "k"), ("species", "a*b")]);
        let p = Propensity::from_fields(PropensityType::Bimolecular, &fields, &symbols).unwrap();
        let state = [4.0, 6.0];
        let params = [0.5];
        let plain = p.get_propensity(&state, &params, 0.0);
        for v in [0.5, 1.0, 2.0, 7.0] {
            assert!((p.get_volume_propensity(&state, &params, v, 0.0) - plain / v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_mass_action_volume_scaling() {
        let symbols = table(&["a", "b", "c"], &["k"]);
        let fields = attrs(&[("k", "k"), ("species", "a*b*c")]);
        let p = Propensity::from_fields(PropensityType::MassAction, &fields, &symbols).unwrap();
        assert!(matches!(p, Propensity::MassAction { .. }));
        let state = [2.0, 3.0, 4.0];
        let params = [1.5];
        let plain = p.get_propensity(&state, &params, 0.0);
        for v in [0.5, 2.0, 10.0] {
            let scaled = p.get_volume_propensity(&state, &params, v, 0.0);
            assert!((scaled * v.powi(2) - plain).abs() < 1e-9);
        }
    }

    #[test]
    fn test_mass_action_specializes_small_orders() {
        let symbols = table(&["a", "b"], &["k"]);
        let p = Propensity::from_fields(PropensityType::MassAction, &attrs(&[("k", "k")]), &symbols)
            .unwrap();
        assert!(matches!(p, Propensity::Constitutive { .. }));
        let p = Propensity::from_fields(
            PropensityType::MassAction,
            &attrs(&[("k", "k"), ("species", "a")]),
            &symbols,
        )
        .unwrap();
        assert!(matches!(p, Propensity::Unimolecular { .. }));
        let p = Propensity::from_fields(
            PropensityType::MassAction,
            &attrs(&[("k", "k"), ("species", "a*b")]),
            &symbols,
        )
        .unwrap();
        assert!(matches!(p, Propensity::Bimolecular { .. }));
    }

    #[test]
    fn test_mass_action_rejects_sum_in_product() {
        let fields = attrs(&[("k", "k"), ("species", "a+b")]);
        let err = Propensity::species_and_parameters(PropensityType::MassAction, &fields)
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidStoichiometry(_)));
    }

    #[test]
    fn test_missing_attribute_is_malformed() {
        let err = Propensity::species_and_parameters(PropensityType::HillPositive, &attrs(&[]))
            .unwrap_err();
        assert!(matches!(err, ModelError::MalformedReaction(_)));
    }

    #[test]
    fn test_unknown_propensity_type() {
        let err = "michaelismenten".parse::<PropensityType>().unwrap_err();
        assert!(matches!(err, ModelError::UnknownPropensityType(_)));
    }

    #[test]
    fn test_general_propensity_tracks_expression() {
        let symbols = table(&["x"], &["k"]);
        let fields = attrs(&[("rate", "_k * x / (10 + x)")]);
        let (species, params) =
            Propensity::species_and_parameters(PropensityType::General, &fields).unwrap();
        assert_eq!(species, vec!["x".to_string()]);
        assert_eq!(params, vec!["k".to_string()]);
        let p = Propensity::from_fields(PropensityType::General, &fields, &symbols).unwrap();
        let value = p.get_propensity(&[10.0], &[4.0], 0.0);
        assert!((value - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_delay_catalog() {
        let mut rng = StdRng::seed_from_u64(7);
        let symbols = table(&[], &["tau", "mu", "sigma"]);
        let none = Delay::from_fields(DelayType::None, &attrs(&[]), &symbols).unwrap();
        assert_eq!(none.get_delay(&[], &[5.0, 0.0, 0.0], 0.0, &mut rng), 0.0);

        let fixed =
            Delay::from_fields(DelayType::Fixed, &attrs(&[("delay", "tau")]), &symbols).unwrap();
        assert_eq!(fixed.get_delay(&[], &[5.0, 0.0, 0.0], 0.0, &mut rng), 5.0);

        // Zero-noise gaussian collapses to its mean, even a negative one.
        let gauss = Delay::from_fields(
            DelayType::Gaussian,
            &attrs(&[("mean", "mu"), ("std", "sigma")]),
            &symbols,
        )
        .unwrap();
        assert_eq!(gauss.get_delay(&[], &[0.0, -2.5, 0.0], 0.0, &mut rng), -2.5);
    }

    #[test]
    fn test_gamma_delay_sampling() {
        let mut rng = StdRng::seed_from_u64(42);
        let symbols = table(&[], &["k", "theta"]);
        let gamma = Delay::from_fields(
            DelayType::Gamma,
            &attrs(&[("k", "k"), ("theta", "theta")]),
            &symbols,
        )
        .unwrap();
        let params = [2.0, 3.0];
        let n = 2000;
        let mut total = 0.0;
        for _ in 0..n {
            let sample = gamma.get_delay(&[], &params, 0.0, &mut rng);
            assert!(sample >= 0.0);
            total += sample;
        }
        // Mean of Gamma(2, 3) is 6.
        assert!((total / n as f64 - 6.0).abs() < 0.5);
    }

    #[test]
    fn test_unknown_delay_type() {
        assert!(matches!(
            "weibull".parse::<DelayType>(),
            Err(ModelError::UnknownDelayType(_))
        ));
    }

    #[test]
    fn test_additive_rule() {
        let symbols = table(&["total", "a", "b"], &[]);
        let fields = attrs(&[("equation", "total = a + b"), ("frequency", "repeated")]);
        let rule = Rule::from_fields(RuleType::Additive, &fields, &symbols).unwrap();
        let mut state = [0.0, 2.0, 3.5];
        let mut params: [f64; 0] = [];
        rule.apply(&mut state, &mut params, 0.0);
        assert_eq!(state[0], 5.5);
    }

    #[test]
    fn test_assignment_rule_targets_parameter() {
        let symbols = table(&["x"], &["gain"]);
        let fields = attrs(&[("equation", "_gain = 2 * x")]);
        let rule = Rule::from_fields(RuleType::Assignment, &fields, &symbols).unwrap();
        let mut state = [4.0];
        let mut params = [0.0];
        rule.apply(&mut state, &mut params, 0.0);
        assert_eq!(params[0], 8.0);
    }

    #[test]
    fn test_rules_apply_in_declaration_order() {
        let symbols = table(&["a", "b"], &[]);
        let first = Rule::from_fields(
            RuleType::Assignment,
            &attrs(&[("equation", "a = 10")]),
            &symbols,
        )
        .unwrap();
        let second = Rule::from_fields(
            RuleType::Assignment,
            &attrs(&[("equation", "b = a + 1")]),
            &symbols,
        )
        .unwrap();
        let mut state = [0.0, 0.0];
        let mut params: [f64; 0] = [];
        for rule in [&first, &second] {
            rule.apply(&mut state, &mut params, 0.0);
        }
        assert_eq!(state, [10.0, 11.0]);
    }

    #[test]
    fn test_rule_frequency_must_be_repeated() {
        let fields = attrs(&[("equation", "a = b"), ("frequency", "once")]);
        let err = Rule::species_and_parameters(RuleType::Assignment, &fields).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedRuleFrequency(_)));
    }

    #[test]
    fn test_additive_rule_rejects_parameter_target() {
        let fields = attrs(&[("equation", "_p = a + b")]);
        let err = Rule::species_and_parameters(RuleType::Additive, &fields).unwrap_err();
        assert!(matches!(err, ModelError::MalformedReaction(_)));
    }

    #[test]
    fn test_time_threshold_volume_division() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model: VolumeModel = StochasticTimeThresholdVolume::new(33.0, 2.0, 0.0).into();
        model.initialize(&[], &[], 0.0, 1.0, &mut rng).unwrap();
        // ln(2/1) / (ln 2 / 33) = 33 exactly, regardless of rng draws at zero noise.
        assert!(!model.cell_divided(&[], &[], 32.8, 1.9, 0.1));
        assert!(model.cell_divided(&[], &[], 33.0, 2.0, 0.1));
        assert!(!model.cell_divided(&[], &[], 33.2, 2.0, 0.1));
    }

    #[test]
    fn test_time_threshold_growth_is_exponential() {
        let model: VolumeModel = StochasticTimeThresholdVolume::new(33.0, 2.0, 0.0).into();
        let growth = std::f64::consts::LN_2 / 33.0;
        let step = model.get_volume_step(&[], &[], 0.0, 1.0, 0.5);
        assert!((step - ((growth * 0.5).exp() - 1.0)).abs() < 1e-12);
        // Doubling over a full cycle.
        let mut volume = 1.0;
        let dt = 0.01;
        let steps = (33.0 / dt) as usize;
        for i in 0..steps {
            volume += model.get_volume_step(&[], &[], i as f64 * dt, volume, dt);
        }
        assert!((volume - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_dependent_volume() {
        let mut rng = StdRng::seed_from_u64(3);
        let growth = parse_rate("0.1")
            .unwrap()
            .bind(&SymbolTable::new())
            .unwrap();
        let mut model: VolumeModel = StateDependentVolume::new(2.0, 0.0, growth).into();
        model.initialize(&[], &[], 0.0, 1.0, &mut rng).unwrap();
        assert!(!model.cell_divided(&[], &[], 1.0, 1.5, 0.1));
        assert!(model.cell_divided(&[], &[], 1.0, 2.1, 0.1));
        let step = model.get_volume_step(&[], &[], 0.0, 1.0, 0.5);
        assert!((step - ((0.1_f64 * 0.5).exp() - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_state_dependent_impossible_division() {
        let mut rng = StdRng::seed_from_u64(3);
        let growth = parse_rate("0.1")
            .unwrap()
            .bind(&SymbolTable::new())
            .unwrap();
        let mut model: VolumeModel = StateDependentVolume::new(2.0, 0.0, growth).into();
        let err = model.initialize(&[], &[], 0.0, 5.0, &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::ImpossibleDivision { .. }));
    }

    #[test]
    fn test_daughter_copy_resamples_independently() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut mother: VolumeModel = StochasticTimeThresholdVolume::new(30.0, 2.0, 0.05).into();
        mother.initialize(&[], &[], 0.0, 1.0, &mut rng).unwrap();
        let mother_instant = match &mother {
            VolumeModel::StochasticTimeThreshold(m) => m.division_time,
            other => panic!("unexpected volume model {other:?}"),
        };
        let mut daughter = mother.clone();
        assert_eq!(mother, daughter);
        daughter.initialize(&[], &[], 30.0, 1.0, &mut rng).unwrap();
        // The mother's pre-sampled division instant is untouched.
        match &mother {
            VolumeModel::StochasticTimeThreshold(m) => {
                assert_eq!(m.division_time, mother_instant)
            }
            other => panic!("unexpected volume model {other:?}"),
        }
        assert_ne!(mother, daughter);
    }

    #[test]
    fn test_propensities_stay_nonnegative() {
        let symbols = table(&["a", "b"], &["k", "K", "n"]);
        let params = [3.0, 5.0, 2.0];
        let cases = [
            Propensity::from_fields(PropensityType::Constitutive, &attrs(&[("k", "k")]), &symbols)
                .unwrap(),
            Propensity::from_fields(
                PropensityType::MassAction,
                &attrs(&[("k", "k"), ("species", "a*b")]),
                &symbols,
            )
            .unwrap(),
            Propensity::from_fields(
                PropensityType::HillNegative,
                &attrs(&[("k", "k"), ("K", "K"), ("n", "n"), ("s1", "a")]),
                &symbols,
            )
            .unwrap(),
        ];
        for p in &cases {
            for state in [[0.0, 0.0], [1.0, 4.0], [250.0, 3.0]] {
                assert!(p.get_propensity(&state, &params, 0.0) >= 0.0);
                assert!(p.get_volume_propensity(&state, &params, 2.0, 0.0) >= 0.0);
            }
        }
    }
}
