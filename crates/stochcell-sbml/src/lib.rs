//! # Stochcell SBML
//!
//! Importer for a pragmatic subset of SBML (Systems Biology Markup
//! Language), the community standard for biochemical models.
//!
//! The importer does not try to be a validator: it reads species,
//! parameters (global and kinetic-law local, merged into one flat
//! namespace), reactions with their kinetic-law math, and assignment rules,
//! and emits the native [`ModelDocument`]. Everything outside the subset
//! (events, extra compartments, rate and algebraic rules, unsupported
//! MathML) is skipped with a warning or rejected with an error, whichever
//! the construct deserves.
//!
//! Kinetic laws arrive as MathML; they are stringified into the native
//! infix rate grammar, with every identifier that names a parameter
//! rewritten to carry the internal parameter marker. Imported models
//! therefore flow through exactly the same expression parser and assembler
//! as native ones.

use log::warn;
use std::collections::HashSet;
use std::path::Path;
use stochcell_core::{AttrMap, ModelError, Result};
use stochcell_kinetics::{PropensityType, RuleType};
use stochcell_model::xml::{self, XmlNode};
use stochcell_model::{DelaySpec, ModelDocument, PropensitySpec, RuleSpec};

/// Reserved identifiers of the rate grammar; SBML entities with these names
/// cannot be represented and are skipped.
const RESERVED: [&str; 2] = ["volume", "t"];

/// Import an SBML document from XML text.
pub fn import_sbml_str(input: &str) -> Result<ModelDocument> {
    let root = xml::parse(input)?;
    let model = if root.name == "model" {
        &root
    } else {
        root.child("model").ok_or_else(|| {
            ModelError::Document("SBML document has no <model> element".to_string())
        })?
    };
    import_model(model)
}

/// Import an SBML file.
pub fn import_sbml_file<P: AsRef<Path>>(path: P) -> Result<ModelDocument> {
    import_sbml_str(&std::fs::read_to_string(path)?)
}

fn list_children<'a>(
    parent: &'a XmlNode,
    list: &'a str,
    item: &'a str,
) -> impl Iterator<Item = &'a XmlNode> {
    parent
        .child(list)
        .into_iter()
        .flat_map(move |l| l.children_named(item))
}

fn import_model(model: &XmlNode) -> Result<ModelDocument> {
    let mut doc = ModelDocument::new();

    let compartments: Vec<_> = list_children(model, "listOfCompartments", "compartment").collect();
    if compartments.len() > 1 {
        warn!(
            "SBML model declares {} compartments; all species are treated as \
             sharing a single cell volume",
            compartments.len()
        );
    }
    if model.child("listOfEvents").is_some() {
        warn!("SBML events are not supported and were skipped");
    }
    if model.child("listOfFunctionDefinitions").is_some() {
        warn!("SBML function definitions are not supported and were skipped");
    }

    // Parameters: globals first, then every kinetic law's locals, merged
    // into one flat namespace. Collisions take the last value.
    let mut parameters: Vec<(String, f64)> = Vec::new();
    for node in list_children(model, "listOfParameters", "parameter") {
        import_parameter(node, &mut parameters);
    }
    for reaction in list_children(model, "listOfReactions", "reaction") {
        if let Some(law) = reaction.child("kineticLaw") {
            for (list, item) in [
                ("listOfLocalParameters", "localParameter"),
                ("listOfParameters", "parameter"),
            ] {
                for node in list_children(law, list, item) {
                    import_parameter(node, &mut parameters);
                }
            }
        }
    }
    let parameter_names: HashSet<String> =
        parameters.iter().map(|(name, _)| name.clone()).collect();

    // Species.
    for node in list_children(model, "listOfSpecies", "species") {
        let Some(id) = node.attr("id") else {
            warn!("skipping SBML species with no id");
            continue;
        };
        if RESERVED.contains(&id) {
            warn!("skipping SBML species '{id}': the name is reserved");
            continue;
        }
        let amount = finite_attr(node, "initialAmount");
        let concentration = finite_attr(node, "initialConcentration");
        doc.add_species(id, amount.or(concentration).unwrap_or(0.0));
    }

    // Reactions.
    for reaction in list_children(model, "listOfReactions", "reaction") {
        let id = reaction.attr("id").unwrap_or("<anonymous>");
        if reaction.attr("reversible") == Some("true") {
            warn!(
                "SBML reaction '{id}' is reversible; stochastic semantics \
                 treat it as written, forward only"
            );
        }
        let reactants = import_side(reaction, "listOfReactants", id)?;
        let products = import_side(reaction, "listOfProducts", id)?;
        let text = format!("{} -- {}", reactants.join(" + "), products.join(" + "));

        let rate = match reaction.child("kineticLaw").and_then(|law| law.child("math")) {
            Some(math) => math_to_infix(math, &parameter_names)?,
            None => {
                warn!("SBML reaction '{id}' has no kinetic law; its rate is 0");
                "0".to_string()
            }
        };
        let mut fields = AttrMap::new();
        fields.insert("rate".to_string(), rate);
        doc.add_reaction(
            &text,
            None,
            PropensitySpec::new(PropensityType::General, fields),
            DelaySpec::none(),
        );
    }

    // Rules: only assignment rules survive the translation.
    if let Some(list) = model.child("listOfRules") {
        for node in &list.children {
            match node.name.as_str() {
                "assignmentRule" => {
                    let Some(variable) = node.attr("variable") else {
                        warn!("skipping SBML assignment rule with no variable");
                        continue;
                    };
                    let Some(math) = node.child("math") else {
                        warn!("skipping SBML assignment rule for '{variable}' with no math");
                        continue;
                    };
                    let rhs = math_to_infix(math, &parameter_names)?;
                    let lhs = if parameter_names.contains(variable) {
                        format!("_{variable}")
                    } else {
                        variable.to_string()
                    };
                    let mut fields = AttrMap::new();
                    fields.insert("equation".to_string(), format!("{lhs} = {rhs}"));
                    fields.insert("frequency".to_string(), "repeated".to_string());
                    doc.add_rule(RuleSpec::new(RuleType::Assignment, fields));
                }
                other => warn!("skipping unsupported SBML rule kind <{other}>"),
            }
        }
    }

    for (name, value) in parameters {
        doc.add_parameter(&name, value);
    }
    Ok(doc)
}

fn import_parameter(node: &XmlNode, parameters: &mut Vec<(String, f64)>) {
    let Some(id) = node.attr("id") else {
        warn!("skipping SBML parameter with no id");
        return;
    };
    if RESERVED.contains(&id) {
        warn!("skipping SBML parameter '{id}': the name is reserved");
        return;
    }
    let value = match finite_attr(node, "value") {
        Some(value) => value,
        None => {
            warn!("SBML parameter '{id}' has no value, defaulting to 0");
            0.0
        }
    };
    match parameters.iter_mut().find(|(name, _)| name.as_str() == id) {
        Some((_, existing)) => *existing = value,
        None => parameters.push((id.to_string(), value)),
    }
}

fn finite_attr(node: &XmlNode, key: &str) -> Option<f64> {
    node.attr(key)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// One reaction side as a list of species names, each repeated per unit of
/// stoichiometry (the native reaction grammar writes multiplicity by
/// repetition).
fn import_side(reaction: &XmlNode, list: &str, id: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for reference in list_children(reaction, list, "speciesReference") {
        let species = reference.attr("species").ok_or_else(|| {
            ModelError::Document(format!(
                "SBML reaction '{id}' has a species reference with no species"
            ))
        })?;
        let stoichiometry = reference
            .attr("stoichiometry")
            .map(|raw| raw.trim().parse::<f64>())
            .transpose()
            .map_err(|_| {
                ModelError::Document(format!(
                    "SBML reaction '{id}' has a non-numeric stoichiometry for '{species}'"
                ))
            })?
            .unwrap_or(1.0);
        let count = stoichiometry.round();
        if (stoichiometry - count).abs() > 1e-9 {
            warn!(
                "SBML reaction '{id}': stoichiometry {stoichiometry} of '{species}' \
                 rounded to {count}"
            );
        }
        for _ in 0..count as i64 {
            names.push(species.to_string());
        }
    }
    Ok(names)
}

// =============================================================================
// MATHML
// =============================================================================

/// Stringify a `<math>` element into the native infix rate grammar,
/// rewriting identifiers that name parameters with the internal marker.
fn math_to_infix(math: &XmlNode, parameters: &HashSet<String>) -> Result<String> {
    let child = math.children.first().ok_or_else(|| {
        ModelError::UnparseableRate("empty MathML expression".to_string())
    })?;
    expr_to_infix(child, parameters)
}

fn expr_to_infix(node: &XmlNode, parameters: &HashSet<String>) -> Result<String> {
    match node.name.as_str() {
        "apply" => {
            let (op, operands) = node.children.split_first().ok_or_else(|| {
                ModelError::UnparseableRate("empty MathML apply".to_string())
            })?;
            let args: Vec<String> = operands
                .iter()
                .map(|child| expr_to_infix(child, parameters))
                .collect::<Result<_>>()?;
            apply_to_infix(&op.name, &args)
        }
        "ci" => {
            let name = node.text();
            let name = name.trim();
            if name.is_empty() {
                return Err(ModelError::UnparseableRate("empty MathML <ci>".to_string()));
            }
            if parameters.contains(name) {
                Ok(format!("_{name}"))
            } else {
                Ok(name.to_string())
            }
        }
        "cn" => cn_to_infix(node),
        "csymbol" => {
            let url = node.attr("definitionURL").unwrap_or("");
            if url.ends_with("time") {
                Ok("t".to_string())
            } else {
                Err(ModelError::UnparseableRate(format!(
                    "unsupported MathML csymbol '{url}'"
                )))
            }
        }
        "pi" => Ok(format!("{}", std::f64::consts::PI)),
        "exponentiale" => Ok(format!("{}", std::f64::consts::E)),
        other => Err(ModelError::UnparseableRate(format!(
            "unsupported MathML element <{other}>"
        ))),
    }
}

fn apply_to_infix(op: &str, args: &[String]) -> Result<String> {
    let unary = |name: &str| -> Result<String> {
        match args {
            [only] => Ok(format!("{name}({only})")),
            _ => Err(ModelError::UnparseableRate(format!(
                "MathML <{op}> expects one operand, got {}",
                args.len()
            ))),
        }
    };
    let binary = |infix: &str| -> Result<String> {
        match args {
            [lhs, rhs] => Ok(format!("({lhs} {infix} {rhs})")),
            _ => Err(ModelError::UnparseableRate(format!(
                "MathML <{op}> expects two operands, got {}",
                args.len()
            ))),
        }
    };
    match op {
        "plus" => Ok(match args.len() {
            0 => "0".to_string(),
            _ => format!("({})", args.join(" + ")),
        }),
        "times" => Ok(match args.len() {
            0 => "1".to_string(),
            _ => format!("({})", args.join(" * ")),
        }),
        "minus" => match args {
            [only] => Ok(format!("(-{only})")),
            [lhs, rhs] => Ok(format!("({lhs} - {rhs})")),
            _ => Err(ModelError::UnparseableRate(format!(
                "MathML <minus> expects one or two operands, got {}",
                args.len()
            ))),
        },
        "divide" => binary("/"),
        "power" => binary("^"),
        "exp" => unary("exp"),
        "ln" => unary("log"),
        "abs" => unary("abs"),
        "max" => Ok(format!("Max({})", args.join(", "))),
        "min" => Ok(format!("Min({})", args.join(", "))),
        other => Err(ModelError::UnparseableRate(format!(
            "unsupported MathML operator '{other}'"
        ))),
    }
}

fn cn_to_infix(node: &XmlNode) -> Result<String> {
    let bad = |detail: String| ModelError::UnparseableRate(detail);
    match node.attr("type") {
        Some("e-notation") => match node.texts.as_slice() {
            [mantissa, exponent] => Ok(format!(
                "({}e{})",
                mantissa.trim(),
                exponent.trim()
            )),
            _ => Err(bad("malformed e-notation <cn>".to_string())),
        },
        Some("rational") => match node.texts.as_slice() {
            [numerator, denominator] => {
                Ok(format!("({} / {})", numerator.trim(), denominator.trim()))
            }
            _ => Err(bad("malformed rational <cn>".to_string())),
        },
        _ => {
            let text = node.text();
            let text = text.trim().to_string();
            let value: f64 = text
                .parse()
                .map_err(|_| bad(format!("non-numeric MathML <cn> '{text}'")))?;
            if !value.is_finite() {
                return Err(bad(format!("non-finite MathML <cn> '{text}'")));
            }
            Ok(text)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
