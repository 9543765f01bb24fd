//! Boolean criteria over telemetry parameters and command arguments
//!
//! Evaluation is three-valued: a comparison whose operand is not available
//! yields `None` ("undetermined") instead of `false`, so a constraint or
//! verifier keeps waiting rather than failing on missing data.

use cmdflow_core::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Plain literal as written in a dictionary file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    /// Boolean literal
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// String literal
    String(String),
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Bool(v) => Value::Bool(*v),
            Literal::Int(v) => Value::Int(*v),
            Literal::Float(v) => Value::Float(*v),
            Literal::String(v) => Value::String(v.clone()),
        }
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Latest known value of a telemetry parameter
    Parameter(String),
    /// Value assigned to a command argument
    Argument(String),
    /// Constant
    Literal(Literal),
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `==`
    #[serde(rename = "==")]
    Eq,
    /// `!=`
    #[serde(rename = "!=")]
    Ne,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    fn apply(&self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
            // incomparable values are never equal
            (CompareOp::Ne, None) => true,
            (_, None) => false,
        }
    }
}

/// A boolean expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criteria {
    /// Binary comparison
    Compare {
        /// Left operand
        left: Operand,
        /// Operator
        op: CompareOp,
        /// Right operand
        right: Operand,
    },
    /// Conjunction
    All(Vec<Criteria>),
    /// Disjunction
    Any(Vec<Criteria>),
    /// Negation
    Not(Box<Criteria>),
}

/// Supplies operand values during evaluation
pub trait EvalContext {
    /// Current value of a parameter
    fn parameter(&self, name: &str) -> Option<Value>;
    /// Value of a command argument
    fn argument(&self, name: &str) -> Option<Value>;
}

impl Criteria {
    /// Shorthand for `parameter == literal`
    pub fn parameter_equals(name: impl Into<String>, value: Literal) -> Self {
        Criteria::Compare {
            left: Operand::Parameter(name.into()),
            op: CompareOp::Eq,
            right: Operand::Literal(value),
        }
    }

    /// Evaluate; `None` when the result depends on an unavailable operand
    pub fn evaluate(&self, ctx: &dyn EvalContext) -> Option<bool> {
        match self {
            Criteria::Compare { left, op, right } => {
                let l = resolve(left, ctx)?;
                let r = resolve(right, ctx)?;
                Some(op.apply(l.compare(&r)))
            }
            Criteria::All(items) => {
                let mut undetermined = false;
                for item in items {
                    match item.evaluate(ctx) {
                        Some(false) => return Some(false),
                        None => undetermined = true,
                        Some(true) => {}
                    }
                }
                if undetermined {
                    None
                } else {
                    Some(true)
                }
            }
            Criteria::Any(items) => {
                let mut undetermined = false;
                for item in items {
                    match item.evaluate(ctx) {
                        Some(true) => return Some(true),
                        None => undetermined = true,
                        Some(false) => {}
                    }
                }
                if undetermined {
                    None
                } else {
                    Some(false)
                }
            }
            Criteria::Not(inner) => inner.evaluate(ctx).map(|v| !v),
        }
    }

    /// Names of all parameters the expression refers to
    pub fn parameters(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_parameters(&mut out);
        out
    }

    fn collect_parameters(&self, out: &mut BTreeSet<String>) {
        match self {
            Criteria::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Parameter(name) = operand {
                        out.insert(name.clone());
                    }
                }
            }
            Criteria::All(items) | Criteria::Any(items) => {
                for item in items {
                    item.collect_parameters(out);
                }
            }
            Criteria::Not(inner) => inner.collect_parameters(out),
        }
    }
}

fn resolve(operand: &Operand, ctx: &dyn EvalContext) -> Option<Value> {
    match operand {
        Operand::Parameter(name) => ctx.parameter(name),
        Operand::Argument(name) => ctx.argument(name),
        Operand::Literal(literal) => Some(Value::from(literal)),
    }
}
