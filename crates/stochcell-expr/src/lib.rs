//! # Stochcell Expr
//!
//! Rate-expression language for the stochcell engine.
//!
//! User-supplied rate laws arrive as infix strings (`"k1*S / (_Kd + S)"`)
//! and leave as an evaluation tree that is walked on every propensity call.
//! Parsing happens in two stages so the model assembler can intern names
//! before any index exists:
//!
//! 1. [`parse_rate`] turns the string into a [`RateExpr`], a tree that still
//!    carries names and exposes the free species/parameter sets.
//! 2. [`RateExpr::bind`] resolves every name against a [`SymbolTable`] and
//!    produces a [`Term`], which holds only dense indices and is immutable
//!    for the model's lifetime.
//!
//! ## Grammar
//!
//! Infix `+ - * / ^` with conventional precedence, `^` right-associative,
//! unary minus, parentheses, and the function names `exp`, `log`,
//! `heaviside`, `abs`, `Max`, `Min`. The identifiers `volume` and `t` are
//! reserved; a leading `|` (or the internal `_`) marks a parameter reference
//! and is stripped; every other identifier is a species.
//!
//! Division and subtraction are desugared (`a/b` to `a * b^-1`, `a-b` to
//! `a + (-1)*b`), keeping the evaluator's node set closed.

use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use stochcell_core::{ModelError, Result, SymbolTable, Time};

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" }

number = @{ ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)? }
name = @{ ("|" | "_" | ASCII_ALPHA) ~ (ASCII_ALPHANUMERIC | "_")* }
call = { name ~ "(" ~ expr ~ ("," ~ expr)* ~ ")" }

neg = { "-" }
add = { "+" }
sub = { "-" }
mul = { "*" }
div = { "/" }
pow = { "^" }

prefix = _{ neg }
infix = _{ add | sub | mul | div | pow }
primary = _{ number | call | name | "(" ~ expr ~ ")" }

expr = { prefix* ~ primary ~ (infix ~ prefix* ~ primary)* }
input = _{ SOI ~ expr ~ EOI }
"#]
struct RateParser;

// =============================================================================
// SYMBOLIC TREE (parser output, still carries names)
// =============================================================================

/// A parsed rate expression whose leaves still carry names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateExpr {
    Constant(f64),
    Species(String),
    Parameter(String),
    Volume,
    Time,
    Sum(Vec<RateExpr>),
    Product(Vec<RateExpr>),
    Power(Box<RateExpr>, Box<RateExpr>),
    Exp(Box<RateExpr>),
    Log(Box<RateExpr>),
    Step(Box<RateExpr>),
    Abs(Box<RateExpr>),
    Max(Vec<RateExpr>),
    Min(Vec<RateExpr>),
}

impl RateExpr {
    /// Free species names, sorted and deduplicated.
    pub fn species_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        self.visit(&mut |node| {
            if let RateExpr::Species(s) = node {
                names.insert(s.clone());
            }
        });
        names.into_iter().collect()
    }

    /// Free parameter names (marker already stripped), sorted and deduplicated.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        self.visit(&mut |node| {
            if let RateExpr::Parameter(p) = node {
                names.insert(p.clone());
            }
        });
        names.into_iter().collect()
    }

    fn visit(&self, f: &mut impl FnMut(&RateExpr)) {
        f(self);
        match self {
            RateExpr::Sum(children)
            | RateExpr::Product(children)
            | RateExpr::Max(children)
            | RateExpr::Min(children) => {
                for child in children {
                    child.visit(f);
                }
            }
            RateExpr::Power(base, exponent) => {
                base.visit(f);
                exponent.visit(f);
            }
            RateExpr::Exp(x) | RateExpr::Log(x) | RateExpr::Step(x) | RateExpr::Abs(x) => {
                x.visit(f)
            }
            _ => {}
        }
    }

    /// Resolve every name to its dense index.
    ///
    /// Fails with [`ModelError::Lookup`] on a name the table does not know;
    /// the assembler prevents that by interning the free names first.
    pub fn bind(&self, symbols: &SymbolTable) -> Result<Term> {
        let bind_all = |children: &[RateExpr]| -> Result<Vec<Term>> {
            children.iter().map(|c| c.bind(symbols)).collect()
        };
        Ok(match self {
            RateExpr::Constant(v) => Term::Constant(*v),
            RateExpr::Species(name) => Term::Species(
                symbols
                    .species_index(name)
                    .ok_or_else(|| ModelError::Lookup(name.clone()))?,
            ),
            RateExpr::Parameter(name) => Term::Parameter(
                symbols
                    .parameter_index(name)
                    .ok_or_else(|| ModelError::Lookup(name.clone()))?,
            ),
            RateExpr::Volume => Term::Volume,
            RateExpr::Time => Term::Time,
            RateExpr::Sum(children) => Term::Sum(bind_all(children)?),
            RateExpr::Product(children) => Term::Product(bind_all(children)?),
            RateExpr::Power(base, exponent) => Term::Power(
                Box::new(base.bind(symbols)?),
                Box::new(exponent.bind(symbols)?),
            ),
            RateExpr::Exp(x) => Term::Exp(Box::new(x.bind(symbols)?)),
            RateExpr::Log(x) => Term::Log(Box::new(x.bind(symbols)?)),
            RateExpr::Step(x) => Term::Step(Box::new(x.bind(symbols)?)),
            RateExpr::Abs(x) => Term::Abs(Box::new(x.bind(symbols)?)),
            RateExpr::Max(children) => Term::Max(bind_all(children)?),
            RateExpr::Min(children) => Term::Min(bind_all(children)?),
        })
    }
}

// =============================================================================
// EVALUATION TREE (index-bound, hot path)
// =============================================================================

/// An index-bound expression node.
///
/// Each parent exclusively owns its children; the tree is built once at
/// model-assembly time and never mutated. Evaluation is pure: it reads the
/// state and parameter slices and writes nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Constant(f64),
    Species(usize),
    Parameter(usize),
    Volume,
    Time,
    Sum(Vec<Term>),
    Product(Vec<Term>),
    Power(Box<Term>, Box<Term>),
    Exp(Box<Term>),
    Log(Box<Term>),
    Step(Box<Term>),
    Abs(Box<Term>),
    Max(Vec<Term>),
    Min(Vec<Term>),
}

impl Term {
    /// Evaluate with an implicit unit volume.
    #[inline]
    pub fn evaluate(&self, state: &[f64], params: &[f64], time: Time) -> f64 {
        self.volume_evaluate(state, params, 1.0, time)
    }

    /// Evaluate against an explicit cell volume.
    ///
    /// `Species` still reads raw counts here; any count-to-concentration
    /// rescaling is the propensity layer's job.
    pub fn volume_evaluate(&self, state: &[f64], params: &[f64], volume: f64, time: Time) -> f64 {
        match self {
            Term::Constant(v) => *v,
            Term::Species(i) => state[*i],
            Term::Parameter(i) => params[*i],
            Term::Volume => volume,
            Term::Time => time,
            Term::Sum(children) => children
                .iter()
                .map(|c| c.volume_evaluate(state, params, volume, time))
                .sum(),
            Term::Product(children) => children
                .iter()
                .map(|c| c.volume_evaluate(state, params, volume, time))
                .product(),
            Term::Power(base, exponent) => base
                .volume_evaluate(state, params, volume, time)
                .powf(exponent.volume_evaluate(state, params, volume, time)),
            Term::Exp(x) => x.volume_evaluate(state, params, volume, time).exp(),
            Term::Log(x) => x.volume_evaluate(state, params, volume, time).ln(),
            Term::Step(x) => {
                if x.volume_evaluate(state, params, volume, time) >= 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Term::Abs(x) => x.volume_evaluate(state, params, volume, time).abs(),
            Term::Max(children) => children
                .iter()
                .map(|c| c.volume_evaluate(state, params, volume, time))
                .fold(f64::NEG_INFINITY, f64::max),
            Term::Min(children) => children
                .iter()
                .map(|c| c.volume_evaluate(state, params, volume, time))
                .fold(f64::INFINITY, f64::min),
        }
    }
}

// =============================================================================
// PARSER
// =============================================================================

/// Parse an infix rate string into a [`RateExpr`].
///
/// Any lexical, syntactic, arity or non-finite-literal failure is reported
/// as [`ModelError::UnparseableRate`].
pub fn parse_rate(input: &str) -> Result<RateExpr> {
    let mut pairs = RateParser::parse(Rule::input, input)
        .map_err(|_| ModelError::UnparseableRate(input.to_string()))?;
    let expr = pairs
        .next()
        .ok_or_else(|| ModelError::UnparseableRate(input.to_string()))?;
    build_expr(expr.into_inner())
}

fn pratt() -> PrattParser<Rule> {
    PrattParser::new()
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
        .op(Op::prefix(Rule::neg))
        .op(Op::infix(Rule::pow, Assoc::Right))
}

fn build_expr(pairs: Pairs<Rule>) -> Result<RateExpr> {
    pratt()
        .map_primary(build_primary)
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::neg => Ok(negate(rhs?)),
            rule => unreachable!("unexpected prefix operator {rule:?}"),
        })
        .map_infix(|lhs, op, rhs| {
            let (lhs, rhs) = (lhs?, rhs?);
            Ok(match op.as_rule() {
                Rule::add => flatten_sum(lhs, rhs),
                Rule::sub => flatten_sum(lhs, negate(rhs)),
                Rule::mul => flatten_product(lhs, rhs),
                Rule::div => flatten_product(
                    lhs,
                    RateExpr::Power(Box::new(rhs), Box::new(RateExpr::Constant(-1.0))),
                ),
                Rule::pow => RateExpr::Power(Box::new(lhs), Box::new(rhs)),
                rule => unreachable!("unexpected infix operator {rule:?}"),
            })
        })
        .parse(pairs)
}

fn build_primary(pair: Pair<Rule>) -> Result<RateExpr> {
    match pair.as_rule() {
        Rule::number => {
            let value: f64 = pair
                .as_str()
                .parse()
                .map_err(|_| ModelError::UnparseableRate(pair.as_str().to_string()))?;
            if !value.is_finite() {
                return Err(ModelError::UnparseableRate(pair.as_str().to_string()));
            }
            Ok(RateExpr::Constant(value))
        }
        Rule::name => classify_name(pair.as_str()),
        Rule::call => build_call(pair),
        Rule::expr => build_expr(pair.into_inner()),
        rule => Err(ModelError::UnparseableRate(format!(
            "unexpected token {rule:?}"
        ))),
    }
}

fn build_call(pair: Pair<Rule>) -> Result<RateExpr> {
    let text = pair.as_str().to_string();
    let mut inner = pair.into_inner();
    let fname = inner
        .next()
        .ok_or_else(|| ModelError::UnparseableRate(text.clone()))?
        .as_str()
        .to_string();
    let args: Vec<RateExpr> = inner
        .map(|arg| build_expr(arg.into_inner()))
        .collect::<Result<_>>()?;

    let unary = |args: Vec<RateExpr>| -> Result<Box<RateExpr>> {
        match <[RateExpr; 1]>::try_from(args) {
            Ok([only]) => Ok(Box::new(only)),
            Err(_) => Err(ModelError::UnparseableRate(text.clone())),
        }
    };

    match fname.as_str() {
        "exp" => Ok(RateExpr::Exp(unary(args)?)),
        "log" => Ok(RateExpr::Log(unary(args)?)),
        "heaviside" => Ok(RateExpr::Step(unary(args)?)),
        "abs" => Ok(RateExpr::Abs(unary(args)?)),
        "Max" => Ok(RateExpr::Max(args)),
        "Min" => Ok(RateExpr::Min(args)),
        _ => Err(ModelError::UnparseableRate(format!(
            "unknown function '{fname}'"
        ))),
    }
}

/// Keyword and marker classification for a bare identifier.
fn classify_name(name: &str) -> Result<RateExpr> {
    match name {
        "volume" => Ok(RateExpr::Volume),
        "t" => Ok(RateExpr::Time),
        _ => {
            if let Some(stripped) = name.strip_prefix('|').or_else(|| name.strip_prefix('_')) {
                if stripped.is_empty() {
                    return Err(ModelError::UnparseableRate(name.to_string()));
                }
                Ok(RateExpr::Parameter(stripped.to_string()))
            } else {
                Ok(RateExpr::Species(name.to_string()))
            }
        }
    }
}

fn negate(expr: RateExpr) -> RateExpr {
    match expr {
        RateExpr::Constant(v) => RateExpr::Constant(-v),
        other => flatten_product(RateExpr::Constant(-1.0), other),
    }
}

fn flatten_sum(lhs: RateExpr, rhs: RateExpr) -> RateExpr {
    let mut children = match lhs {
        RateExpr::Sum(children) => children,
        other => vec![other],
    };
    match rhs {
        RateExpr::Sum(more) => children.extend(more),
        other => children.push(other),
    }
    RateExpr::Sum(children)
}

fn flatten_product(lhs: RateExpr, rhs: RateExpr) -> RateExpr {
    let mut children = match lhs {
        RateExpr::Product(children) => children,
        other => vec![other],
    };
    match rhs {
        RateExpr::Product(more) => children.extend(more),
        other => children.push(other),
    }
    RateExpr::Product(children)
}

// =============================================================================
// TESTS
// =============================================================================
