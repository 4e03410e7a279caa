//! The expression AST.
//!
//! Expressions are lowered out of the `hcl` syntax tree once, at load time,
//! and carried by blocks for the rest of the run. An [`Expr`] supports two
//! operations: evaluation (see [`crate::eval`]) and [`Expr::variables`],
//! which reports the traversals the expression references so the engine can
//! build dependency edges.

use crate::value::Value;
use std::collections::HashSet;
use std::fmt;

/// A dotted reference path rooted at a variable, e.g. `stage.build.output`.
/// Only statically known steps are recorded; a dynamic index ends the path.
#[derive(Debug, Clone, PartialEq)]
pub struct Traversal {
    pub root: String,
    pub steps: Vec<TraversalStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraversalStep {
    Attr(String),
    Index(Value),
}

impl Traversal {
    pub fn root(root: impl Into<String>) -> Self {
        Traversal {
            root: root.into(),
            steps: Vec::new(),
        }
    }

    /// Attribute names following the root, ignoring index steps.
    pub fn attrs(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|s| match s {
            TraversalStep::Attr(name) => Some(name.as_str()),
            TraversalStep::Index(_) => None,
        })
    }
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for step in &self.steps {
            match step {
                TraversalStep::Attr(name) => write!(f, ".{}", name)?,
                TraversalStep::Index(v) => write!(f, "[{}]", v)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
}

/// One step of an attribute/index chain.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessStep {
    Attr(String),
    Index(Expr),
    /// `[*]` / `.*` — maps the remaining steps over the elements.
    Splat,
}

/// A piece of a string template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Interpolation(Expr),
    If {
        cond: Expr,
        then: Vec<TemplatePart>,
        otherwise: Vec<TemplatePart>,
    },
    For {
        key_var: Option<String>,
        value_var: String,
        collection: Expr,
        body: Vec<TemplatePart>,
    },
}

/// Object constructor keys are either bare identifiers or computed.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKey {
    Ident(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Template(Vec<TemplatePart>),
    Variable(String),
    Access {
        base: Box<Expr>,
        steps: Vec<AccessStep>,
    },
    FuncCall {
        name: String,
        args: Vec<Expr>,
        expand_final: bool,
    },
    Conditional {
        cond: Box<Expr>,
        truthy: Box<Expr>,
        falsy: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    ForList {
        key_var: Option<String>,
        value_var: String,
        collection: Box<Expr>,
        value: Box<Expr>,
        cond: Option<Box<Expr>>,
    },
    ForObject {
        key_var: Option<String>,
        value_var: String,
        collection: Box<Expr>,
        key: Box<Expr>,
        value: Box<Expr>,
        cond: Option<Box<Expr>>,
        grouping: bool,
    },
    Array(Vec<Expr>),
    Object(Vec<(ObjectKey, Expr)>),
    Parens(Box<Expr>),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn null() -> Expr {
        Expr::Literal(Value::NULL)
    }

    /// All variable traversals this expression references. Names bound by
    /// for-expressions and for-directives are excluded.
    pub fn variables(&self) -> Vec<Traversal> {
        let mut out = Vec::new();
        let mut bound = HashSet::new();
        self.collect_variables(&mut out, &mut bound);
        out
    }

    fn collect_variables(&self, out: &mut Vec<Traversal>, bound: &mut HashSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Template(parts) => collect_template(parts, out, bound),
            Expr::Variable(name) => {
                if !bound.contains(name) {
                    out.push(Traversal::root(name.clone()));
                }
            }
            Expr::Access { base, steps } => {
                // A chain rooted at a variable becomes one traversal with its
                // statically-known prefix; anything else decomposes.
                if let Expr::Variable(root) = base.as_ref() {
                    if !bound.contains(root) {
                        let mut traversal = Traversal::root(root.clone());
                        for step in steps {
                            match step {
                                AccessStep::Attr(name) => {
                                    traversal.steps.push(TraversalStep::Attr(name.clone()))
                                }
                                AccessStep::Index(Expr::Literal(v)) => {
                                    traversal.steps.push(TraversalStep::Index(v.clone()))
                                }
                                _ => break,
                            }
                        }
                        out.push(traversal);
                    }
                } else {
                    base.collect_variables(out, bound);
                }
                for step in steps {
                    if let AccessStep::Index(expr) = step {
                        if !matches!(expr, Expr::Literal(_)) {
                            expr.collect_variables(out, bound);
                        }
                    }
                }
            }
            Expr::FuncCall { args, .. } => {
                for arg in args {
                    arg.collect_variables(out, bound);
                }
            }
            Expr::Conditional { cond, truthy, falsy } => {
                cond.collect_variables(out, bound);
                truthy.collect_variables(out, bound);
                falsy.collect_variables(out, bound);
            }
            Expr::Unary { operand, .. } => operand.collect_variables(out, bound),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out, bound);
                rhs.collect_variables(out, bound);
            }
            Expr::ForList {
                key_var,
                value_var,
                collection,
                value,
                cond,
            } => {
                collection.collect_variables(out, bound);
                let added = bind(bound, key_var.as_deref(), value_var);
                value.collect_variables(out, bound);
                if let Some(cond) = cond {
                    cond.collect_variables(out, bound);
                }
                unbind(bound, added);
            }
            Expr::ForObject {
                key_var,
                value_var,
                collection,
                key,
                value,
                cond,
                ..
            } => {
                collection.collect_variables(out, bound);
                let added = bind(bound, key_var.as_deref(), value_var);
                key.collect_variables(out, bound);
                value.collect_variables(out, bound);
                if let Some(cond) = cond {
                    cond.collect_variables(out, bound);
                }
                unbind(bound, added);
            }
            Expr::Array(items) => {
                for item in items {
                    item.collect_variables(out, bound);
                }
            }
            Expr::Object(entries) => {
                for (key, value) in entries {
                    if let ObjectKey::Expr(expr) = key {
                        expr.collect_variables(out, bound);
                    }
                    value.collect_variables(out, bound);
                }
            }
            Expr::Parens(inner) => inner.collect_variables(out, bound),
        }
    }
}

fn collect_template(parts: &[TemplatePart], out: &mut Vec<Traversal>, bound: &mut HashSet<String>) {
    for part in parts {
        match part {
            TemplatePart::Literal(_) => {}
            TemplatePart::Interpolation(expr) => expr.collect_variables(out, bound),
            TemplatePart::If { cond, then, otherwise } => {
                cond.collect_variables(out, bound);
                collect_template(then, out, bound);
                collect_template(otherwise, out, bound);
            }
            TemplatePart::For {
                key_var,
                value_var,
                collection,
                body,
            } => {
                collection.collect_variables(out, bound);
                let added = bind(bound, key_var.as_deref(), value_var);
                collect_template(body, out, bound);
                unbind(bound, added);
            }
        }
    }
}

fn bind(bound: &mut HashSet<String>, key_var: Option<&str>, value_var: &str) -> Vec<String> {
    let mut added = Vec::new();
    for name in key_var.into_iter().chain(std::iter::once(value_var)) {
        if bound.insert(name.to_string()) {
            added.push(name.to_string());
        }
    }
    added
}

fn unbind(bound: &mut HashSet<String>, added: Vec<String>) {
    for name in added {
        bound.remove(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(root: &str, attrs: &[&str]) -> Expr {
        Expr::Access {
            base: Box::new(Expr::Variable(root.to_string())),
            steps: attrs.iter().map(|a| AccessStep::Attr(a.to_string())).collect(),
        }
    }

    #[test]
    fn test_variables_from_access_chain() {
        let expr = access("stage", &["build", "output"]);
        let vars = expr.variables();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].to_string(), "stage.build.output");
    }

    #[test]
    fn test_variables_in_template() {
        let expr = Expr::Template(vec![
            TemplatePart::Literal("echo ".to_string()),
            TemplatePart::Interpolation(access("output", &["MSG"])),
        ]);
        let vars = expr.variables();
        assert_eq!(vars[0].root, "output");
    }

    #[test]
    fn test_for_expr_bound_vars_excluded() {
        let expr = Expr::ForList {
            key_var: None,
            value_var: "x".to_string(),
            collection: Box::new(access("local", &["items"])),
            value: Box::new(Expr::Variable("x".to_string())),
            cond: None,
        };
        let vars = expr.variables();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].root, "local");
    }

    #[test]
    fn test_dynamic_index_ends_traversal() {
        let expr = Expr::Access {
            base: Box::new(Expr::Variable("stage".to_string())),
            steps: vec![
                AccessStep::Attr("build".to_string()),
                AccessStep::Index(Expr::Variable("i".to_string())),
                AccessStep::Attr("output".to_string()),
            ],
        };
        let vars = expr.variables();
        assert_eq!(vars[0].to_string(), "stage.build");
        assert!(vars.iter().any(|t| t.root == "i"));
    }
}
