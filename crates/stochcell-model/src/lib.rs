//! # Stochcell Model
//!
//! The declarative model document and the assembler that turns it into a
//! ready-to-simulate [`Model`].
//!
//! A model file is a `<model>` element holding reactions (with their
//! propensity and delay), repeated assignment rules, and parameter/species
//! valuations. Assembly runs in three phases:
//!
//! 1. **Discovery**: reaction texts are parsed into stoichiometry deltas and
//!    every propensity/delay/rule surfaces its free names; each name is
//!    interned into the symbol table on first sight.
//! 2. **Binding**: with the table frozen, every catalog entry resolves its
//!    names to dense indices and the two stoichiometry matrices are built.
//! 3. **Valuation**: `<parameter>` and `<species>` tags are applied. A
//!    referenced parameter with no value is fatal; a referenced species with
//!    no value defaults to 0 with a warning; a valued name nothing refers to
//!    is kept, with a warning.
//!
//! Downstream simulators read the matrices once and then call the
//! per-reaction propensity/delay objects each step; the model structure
//! itself is immutable during simulation apart from [`Model::set_species`] /
//! [`Model::set_params`].

use log::warn;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use stochcell_core::{AttrMap, ModelError, ParamVector, Result, StateVector, SymbolTable};
use stochcell_expr::{parse_rate, Term};
use stochcell_kinetics::{Delay, DelayType, Propensity, PropensityType, Rule, RuleType};

pub mod xml;

// =============================================================================
// DECLARATIVE DOCUMENT
// =============================================================================

/// Unbound propensity declaration: a type tag plus its attribute set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropensitySpec {
    pub kind: PropensityType,
    pub fields: AttrMap,
}

impl PropensitySpec {
    pub fn new(kind: PropensityType, fields: AttrMap) -> Self {
        Self { kind, fields }
    }
}

/// Unbound delay declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySpec {
    pub kind: DelayType,
    pub fields: AttrMap,
}

impl DelaySpec {
    pub fn new(kind: DelayType, fields: AttrMap) -> Self {
        Self { kind, fields }
    }

    /// The no-delay declaration, used when a reaction has no `delay` child.
    pub fn none() -> Self {
        Self {
            kind: DelayType::None,
            fields: AttrMap::new(),
        }
    }
}

/// Unbound rule declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub kind: RuleType,
    pub fields: AttrMap,
}

impl RuleSpec {
    pub fn new(kind: RuleType, fields: AttrMap) -> Self {
        Self { kind, fields }
    }
}

/// One reaction declaration.
///
/// `text` is the immediate stoichiometry (`"reactants -- products"`,
/// `+`-separated species, either side may be empty); `after` uses the same
/// grammar for the delayed stoichiometry applied when the delay expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionSpec {
    pub text: String,
    pub after: Option<String>,
    pub propensity: PropensitySpec,
    pub delay: DelaySpec,
}

/// In-memory declarative model, as read from XML or built programmatically
/// (the SBML importer produces one of these).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDocument {
    pub reactions: Vec<ReactionSpec>,
    pub rules: Vec<RuleSpec>,
    pub parameters: Vec<(String, f64)>,
    pub species: Vec<(String, f64)>,
}

impl ModelDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reaction(
        &mut self,
        text: &str,
        after: Option<&str>,
        propensity: PropensitySpec,
        delay: DelaySpec,
    ) {
        self.reactions.push(ReactionSpec {
            text: text.to_string(),
            after: after.map(str::to_string),
            propensity,
            delay,
        });
    }

    pub fn add_rule(&mut self, rule: RuleSpec) {
        self.rules.push(rule);
    }

    pub fn add_parameter(&mut self, name: &str, value: f64) {
        self.parameters.push((name.to_string(), value));
    }

    pub fn add_species(&mut self, name: &str, value: f64) {
        self.species.push((name.to_string(), value));
    }

    /// Read a declarative model from XML text.
    pub fn from_xml_str(input: &str) -> Result<Self> {
        let root = xml::parse(input)?;
        if root.name != "model" {
            return Err(ModelError::Document(format!(
                "expected a <model> root, found <{}>",
                root.name
            )));
        }
        let mut doc = ModelDocument::new();
        for child in &root.children {
            match child.name.as_str() {
                "reaction" => doc.reactions.push(read_reaction(child)?),
                "rule" => doc.rules.push(read_rule(child)?),
                "parameter" => doc.parameters.push(read_valuation(child)?),
                "species" => doc.species.push(read_valuation(child)?),
                other => warn!("ignoring unrecognized element <{other}> in model document"),
            }
        }
        Ok(doc)
    }

    /// Read a declarative model from an XML file.
    pub fn from_xml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_xml_str(&std::fs::read_to_string(path)?)
    }
}

fn read_reaction(node: &xml::XmlNode) -> Result<ReactionSpec> {
    let text = node
        .attr("text")
        .ok_or_else(|| {
            ModelError::MalformedReaction("reaction is missing the 'text' attribute".to_string())
        })?
        .to_string();
    let after = node.attr("after").map(str::to_string);
    for key in node.attrs.keys() {
        if key != "text" && key != "after" {
            warn!("ignoring unrecognized attribute '{key}' on reaction '{text}'");
        }
    }

    let mut propensity = None;
    let mut delay = None;
    for child in &node.children {
        match child.name.as_str() {
            "propensity" => {
                let (kind, fields) = read_typed(child)?;
                propensity = Some(PropensitySpec::new(PropensityType::from_str(kind)?, fields));
            }
            "delay" => {
                let (kind, fields) = read_typed(child)?;
                delay = Some(DelaySpec::new(DelayType::from_str(kind)?, fields));
            }
            other => warn!("ignoring unrecognized element <{other}> in reaction '{text}'"),
        }
    }
    let propensity = propensity.ok_or_else(|| {
        ModelError::MalformedReaction(format!("reaction '{text}' has no propensity"))
    })?;
    Ok(ReactionSpec {
        text,
        after,
        propensity,
        delay: delay.unwrap_or_else(DelaySpec::none),
    })
}

fn read_rule(node: &xml::XmlNode) -> Result<RuleSpec> {
    let (kind, fields) = read_typed(node)?;
    Ok(RuleSpec::new(RuleType::from_str(kind)?, fields))
}

/// Split an element into its `type` attribute and the remaining fields.
fn read_typed(node: &xml::XmlNode) -> Result<(&str, AttrMap)> {
    let kind = node.attr("type").ok_or_else(|| {
        ModelError::MalformedReaction(format!("<{}> is missing the 'type' attribute", node.name))
    })?;
    let fields = node
        .attrs
        .iter()
        .filter(|(key, _)| key.as_str() != "type")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok((kind, fields))
}

fn read_valuation(node: &xml::XmlNode) -> Result<(String, f64)> {
    let name = node.attr("name").ok_or_else(|| {
        ModelError::Document(format!("<{}> is missing the 'name' attribute", node.name))
    })?;
    let value = node.attr("value").ok_or_else(|| {
        ModelError::Document(format!("<{}> '{name}' is missing the 'value' attribute", node.name))
    })?;
    let value: f64 = value.trim().parse().map_err(|_| {
        ModelError::Document(format!("<{}> '{name}' has non-numeric value '{value}'", node.name))
    })?;
    Ok((name.to_string(), value))
}

// =============================================================================
// REACTION TEXT
// =============================================================================

/// Parse `"reactants -- products"` into per-species signed deltas, in
/// textual order. Repeated species accumulate (`"A + A -- B"` consumes two
/// units of A).
fn parse_reaction_text(text: &str) -> Result<Vec<(String, i32)>> {
    let (reactants, products) = text.split_once("--").ok_or_else(|| {
        ModelError::MalformedReaction(format!("reaction text '{text}' must contain '--'"))
    })?;
    let mut deltas = Vec::new();
    accumulate_side(reactants, -1, &mut deltas, text)?;
    accumulate_side(products, 1, &mut deltas, text)?;
    Ok(deltas)
}

fn accumulate_side(
    side: &str,
    sign: i32,
    deltas: &mut Vec<(String, i32)>,
    text: &str,
) -> Result<()> {
    let side = side.trim();
    if side.is_empty() {
        return Ok(());
    }
    for chunk in side.split('+') {
        let name = chunk.trim();
        if name.is_empty() {
            return Err(ModelError::MalformedReaction(format!(
                "empty species name in reaction text '{text}'"
            )));
        }
        match deltas.iter_mut().find(|(existing, _)| existing.as_str() == name) {
            Some((_, delta)) => *delta += sign,
            None => deltas.push((name.to_string(), sign)),
        }
    }
    Ok(())
}

// =============================================================================
// ASSEMBLY
// =============================================================================

/// A bound reaction: its rate law and its firing delay. The stoichiometry
/// lives in the model-wide matrices, one column per reaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub propensity: Propensity,
    pub delay: Delay,
}

/// A fully assembled model: symbol table, initial values, bound catalogs and
/// stoichiometry matrices.
///
/// Evaluation calls are read-only on this structure; simulators copy the
/// initial vectors and mutate their own. Distinct models can therefore be
/// simulated in parallel, and one model can back several simulations as long
/// as each owns its vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    symbols: SymbolTable,
    species_values: StateVector,
    param_values: ParamVector,
    reactions: Vec<Reaction>,
    rules: Vec<Rule>,
    update: Array2<i32>,
    delay_update: Array2<i32>,
}

/// Replace finite numeric literals in parameter slots with synthetic,
/// auto-valued parameters, so the catalogs only ever bind names.
fn canonicalize_numeric_fields(
    fields: &AttrMap,
    parameter_keys: &[&str],
    suffix: &str,
    parameters: &mut Vec<(String, f64)>,
) -> AttrMap {
    let mut out = fields.clone();
    for &key in parameter_keys {
        if let Some(value) = fields.get(key) {
            if let Ok(number) = value.trim().parse::<f64>() {
                if number.is_finite() {
                    let name = format!("{key}_{suffix}");
                    parameters.push((name.clone(), number));
                    out.insert(key.to_string(), name);
                }
            }
        }
    }
    out
}

impl Model {
    /// Assemble a declarative document.
    pub fn from_document(doc: &ModelDocument) -> Result<Model> {
        let mut symbols = SymbolTable::new();
        let mut parameters = doc.parameters.clone();

        // Canonicalize numeric literals, then discover and intern free names.
        let mut prop_specs = Vec::with_capacity(doc.reactions.len());
        let mut delay_specs = Vec::with_capacity(doc.reactions.len());
        let mut immediate_deltas = Vec::with_capacity(doc.reactions.len());
        let mut delayed_deltas = Vec::with_capacity(doc.reactions.len());

        for (index, reaction) in doc.reactions.iter().enumerate() {
            let immediate = parse_reaction_text(&reaction.text)?;
            let delayed = match &reaction.after {
                Some(after) => parse_reaction_text(after)?,
                None => Vec::new(),
            };
            for (name, _) in immediate.iter().chain(delayed.iter()) {
                symbols.intern_species(name);
            }

            let prop_fields = canonicalize_numeric_fields(
                &reaction.propensity.fields,
                reaction.propensity.kind.parameter_fields(),
                &format!("auto_r{index}"),
                &mut parameters,
            );
            let (species, params) =
                Propensity::species_and_parameters(reaction.propensity.kind, &prop_fields)?;
            for name in &species {
                symbols.intern_species(name);
            }
            for name in &params {
                symbols.intern_parameter(name);
            }

            let delay_fields = canonicalize_numeric_fields(
                &reaction.delay.fields,
                reaction.delay.kind.parameter_fields(),
                &format!("auto_d{index}"),
                &mut parameters,
            );
            let (species, params) =
                Delay::species_and_parameters(reaction.delay.kind, &delay_fields)?;
            for name in &species {
                symbols.intern_species(name);
            }
            for name in &params {
                symbols.intern_parameter(name);
            }

            prop_specs.push((reaction.propensity.kind, prop_fields));
            delay_specs.push((reaction.delay.kind, delay_fields));
            immediate_deltas.push(immediate);
            delayed_deltas.push(delayed);
        }

        for rule in &doc.rules {
            let (species, params) = Rule::species_and_parameters(rule.kind, &rule.fields)?;
            for name in &species {
                symbols.intern_species(name);
            }
            for name in &params {
                symbols.intern_parameter(name);
            }
        }

        // Names valued below but referenced nowhere stay in the model; they
        // just cannot affect any reaction.
        for (name, _) in &parameters {
            if symbols.parameter_index(name).is_none() {
                warn!("parameter '{name}' is valued but never referenced");
                symbols.intern_parameter(name);
            }
        }
        let referenced_species = symbols.n_species();
        for (name, _) in &doc.species {
            if symbols.species_index(name).is_none() {
                warn!("species '{name}' is valued but never referenced");
                symbols.intern_species(name);
            }
        }

        // Binding.
        let n_species = symbols.n_species();
        let n_reactions = doc.reactions.len();
        let mut reactions = Vec::with_capacity(n_reactions);
        for ((kind, fields), (delay_kind, delay_fields)) in
            prop_specs.iter().zip(delay_specs.iter())
        {
            reactions.push(Reaction {
                propensity: Propensity::from_fields(*kind, fields, &symbols)?,
                delay: Delay::from_fields(*delay_kind, delay_fields, &symbols)?,
            });
        }
        let mut rules = Vec::with_capacity(doc.rules.len());
        for rule in &doc.rules {
            rules.push(Rule::from_fields(rule.kind, &rule.fields, &symbols)?);
        }

        let mut update = Array2::<i32>::zeros((n_species, n_reactions));
        let mut delay_update = Array2::<i32>::zeros((n_species, n_reactions));
        for (column, deltas) in immediate_deltas.iter().enumerate() {
            for (name, delta) in deltas {
                let row = symbols.species_index(name).expect("interned above");
                update[[row, column]] += delta;
            }
        }
        for (column, deltas) in delayed_deltas.iter().enumerate() {
            for (name, delta) in deltas {
                let row = symbols.species_index(name).expect("interned above");
                delay_update[[row, column]] += delta;
            }
        }

        // Valuation.
        let mut param_values = vec![None; symbols.n_parameters()];
        for (name, value) in &parameters {
            let index = symbols.parameter_index(name).expect("interned above");
            param_values[index] = Some(*value);
        }
        let missing: Vec<String> = symbols
            .parameter_names()
            .iter()
            .zip(param_values.iter())
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ModelError::UnspecifiedParameter(missing));
        }
        let param_values: ParamVector =
            param_values.into_iter().map(|v| v.expect("checked")).collect();

        let mut species_values = vec![0.0; n_species];
        let mut valued: HashSet<&str> = HashSet::new();
        for (name, value) in &doc.species {
            let index = symbols.species_index(name).expect("interned above");
            species_values[index] = *value;
            valued.insert(name.as_str());
        }
        for name in &symbols.species_names()[..referenced_species] {
            if !valued.contains(name.as_str()) {
                warn!("species '{name}' was never given a value, defaulting to 0");
            }
        }

        Ok(Model {
            symbols,
            species_values: StateVector::from(species_values),
            param_values,
            reactions,
            rules,
            update,
            delay_update,
        })
    }

    /// Load and assemble an XML model in one step.
    pub fn from_xml_str(input: &str) -> Result<Model> {
        Model::from_document(&ModelDocument::from_xml_str(input)?)
    }

    /// Load and assemble an XML model file in one step.
    pub fn from_xml_file<P: AsRef<Path>>(path: P) -> Result<Model> {
        Model::from_document(&ModelDocument::from_xml_file(path)?)
    }

    pub fn n_species(&self) -> usize {
        self.symbols.n_species()
    }

    pub fn n_parameters(&self) -> usize {
        self.symbols.n_parameters()
    }

    pub fn n_reactions(&self) -> usize {
        self.reactions.len()
    }

    /// Species names in index order.
    pub fn get_species_list(&self) -> &[String] {
        self.symbols.species_names()
    }

    /// Parameter names in index order.
    pub fn get_param_list(&self) -> &[String] {
        self.symbols.parameter_names()
    }

    /// A copy of the initial species counts.
    pub fn get_species_values(&self) -> StateVector {
        self.species_values.clone()
    }

    /// A copy of the parameter values.
    pub fn get_params_values(&self) -> ParamVector {
        self.param_values.clone()
    }

    /// Immediate stoichiometry, `[species][reaction]`.
    pub fn get_update_array(&self) -> &Array2<i32> {
        &self.update
    }

    /// Delayed stoichiometry, `[species][reaction]`.
    pub fn get_delay_update_array(&self) -> &Array2<i32> {
        &self.delay_update
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn get_propensity(&self, reaction: usize) -> Option<&Propensity> {
        self.reactions.get(reaction).map(|r| &r.propensity)
    }

    pub fn get_delay(&self, reaction: usize) -> Option<&Delay> {
        self.reactions.get(reaction).map(|r| &r.delay)
    }

    /// Repeated rules in declaration order, the order they must be applied.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get_species_index(&self, name: &str) -> Option<usize> {
        self.symbols.species_index(name)
    }

    pub fn get_param_index(&self, name: &str) -> Option<usize> {
        self.symbols.parameter_index(name)
    }

    pub fn get_species_value(&self, name: &str) -> Result<f64> {
        self.get_species_index(name)
            .map(|i| self.species_values[i])
            .ok_or_else(|| ModelError::Lookup(name.to_string()))
    }

    pub fn get_param_value(&self, name: &str) -> Result<f64> {
        self.get_param_index(name)
            .map(|i| self.param_values[i])
            .ok_or_else(|| ModelError::Lookup(name.to_string()))
    }

    /// Overwrite initial species counts by name. No name may be unknown;
    /// nothing is written if any is.
    pub fn set_species(&mut self, values: &HashMap<String, f64>) -> Result<()> {
        let mut writes = Vec::with_capacity(values.len());
        for (name, value) in values {
            let index = self
                .get_species_index(name)
                .ok_or_else(|| ModelError::Lookup(name.clone()))?;
            writes.push((index, *value));
        }
        for (index, value) in writes {
            self.species_values[index] = value;
        }
        Ok(())
    }

    /// Overwrite parameter values by name. No name may be unknown; nothing
    /// is written if any is.
    pub fn set_params(&mut self, values: &HashMap<String, f64>) -> Result<()> {
        let mut writes = Vec::with_capacity(values.len());
        for (name, value) in values {
            let index = self
                .get_param_index(name)
                .ok_or_else(|| ModelError::Lookup(name.clone()))?;
            writes.push((index, *value));
        }
        for (index, value) in writes {
            self.param_values[index] = value;
        }
        Ok(())
    }

    /// Parse a rate string against this model's symbol table.
    ///
    /// Every name in the string must already exist in the model.
    pub fn parse_general_expression(&self, rate: &str) -> Result<Term> {
        parse_rate(rate)?.bind(&self.symbols)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }
}

// =============================================================================
// TESTS
// =============================================================================
