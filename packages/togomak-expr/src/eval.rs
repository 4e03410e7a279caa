//! Expression evaluation.
//!
//! Evaluation walks the [`Expr`] AST against a [`Scope`]. Errors surface as
//! [`Diagnostics`]; `try`/`can` are the only places where an evaluation error
//! is recoverable, so they are handled here as special forms rather than as
//! table functions.

use crate::context::{Scope, SharedContext};
use crate::diag::{Diagnostic, Diagnostics};
use crate::expr::{AccessStep, BinOp, Expr, ObjectKey, TemplatePart, UnaryOp};
use crate::value::{Number, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Evaluate `expr` against the shared context under the read lock, with the
/// given overlay frames (outermost first).
pub fn evaluate(
    shared: &SharedContext,
    expr: &Expr,
    frames: &[HashMap<String, Value>],
) -> Result<Value, Diagnostics> {
    let ctx = shared.read();
    let mut scope = Scope::new(&ctx);
    for frame in frames {
        scope.push_frame(frame.clone());
    }
    expr.value(&mut scope)
}

fn error(summary: impl Into<String>, detail: impl Into<String>) -> Diagnostics {
    Diagnostic::error(summary, detail).into()
}

impl Expr {
    pub fn value(&self, scope: &mut Scope<'_>) -> Result<Value, Diagnostics> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Template(parts) => render_template(parts, scope).map(Value::String),
            Expr::Variable(name) => match scope.lookup(name) {
                Some(v) => Ok(v.clone()),
                None => Err(error(
                    "unknown variable",
                    format!("there is no variable named \"{}\"", name),
                )),
            },
            Expr::Access { base, steps } => {
                let value = base.value(scope)?;
                apply_steps(value, steps, scope)
            }
            Expr::FuncCall {
                name,
                args,
                expand_final,
            } => call_function(name, args, *expand_final, scope),
            Expr::Conditional { cond, truthy, falsy } => {
                if truthiness(&cond.value(scope)?)? {
                    truthy.value(scope)
                } else {
                    falsy.value(scope)
                }
            }
            Expr::Unary { op, operand } => {
                let value = operand.value(scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthiness(&value)?)),
                    UnaryOp::Neg => match value.as_number() {
                        Some(Number::Int(i)) => Ok(Value::from(-i)),
                        Some(Number::Float(f)) => Ok(Value::from(-f)),
                        None => Err(error(
                            "invalid operand",
                            format!("unary minus requires a number, got {}", value.kind()),
                        )),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => binary_op(*op, lhs, rhs, scope),
            Expr::ForList {
                key_var,
                value_var,
                collection,
                value,
                cond,
            } => {
                let items = iterate(&collection.value(scope)?)?;
                let mut out = Vec::new();
                for (k, v) in items {
                    scope.push_frame(bindings(key_var.as_deref(), value_var, k, v));
                    let keep = match cond {
                        Some(cond) => truthiness(&cond.value(scope)?)?,
                        None => true,
                    };
                    let result = if keep { Some(value.value(scope)) } else { None };
                    scope.pop_frame();
                    if let Some(result) = result {
                        out.push(result?);
                    }
                }
                Ok(Value::List(out))
            }
            Expr::ForObject {
                key_var,
                value_var,
                collection,
                key,
                value,
                cond,
                grouping,
            } => {
                let items = iterate(&collection.value(scope)?)?;
                let mut grouped: IndexMap<String, Vec<Value>> = IndexMap::new();
                for (k, v) in items {
                    scope.push_frame(bindings(key_var.as_deref(), value_var, k, v));
                    let result: Result<Option<(String, Value)>, Diagnostics> = (|| {
                        let keep = match cond {
                            Some(cond) => truthiness(&cond.value(scope)?)?,
                            None => true,
                        };
                        if !keep {
                            return Ok(None);
                        }
                        let key_value = key.value(scope)?;
                        let key_str = key_value.coerce_string().ok_or_else(|| {
                            error(
                                "invalid object key",
                                format!("object keys must be strings, got {}", key_value.kind()),
                            )
                        })?;
                        let entry_value = value.value(scope)?;
                        Ok(Some((key_str, entry_value)))
                    })();
                    scope.pop_frame();
                    if let Some((key_str, entry_value)) = result? {
                        let slot = grouped.entry(key_str.clone()).or_default();
                        if !slot.is_empty() && !grouping {
                            return Err(error(
                                "duplicate object key",
                                format!("key \"{}\" appears more than once", key_str),
                            ));
                        }
                        slot.push(entry_value);
                    }
                }
                let entries = grouped
                    .into_iter()
                    .map(|(k, mut vs)| {
                        let v = if *grouping {
                            Value::List(vs)
                        } else {
                            vs.remove(0)
                        };
                        (k, v)
                    })
                    .collect();
                Ok(Value::Object(entries))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.value(scope)?);
                }
                Ok(Value::List(out))
            }
            Expr::Object(entries) => {
                let mut out = IndexMap::new();
                for (key, value) in entries {
                    let key = match key {
                        ObjectKey::Ident(name) => name.clone(),
                        ObjectKey::Expr(expr) => {
                            let v = expr.value(scope)?;
                            v.coerce_string().ok_or_else(|| {
                                error(
                                    "invalid object key",
                                    format!("object keys must be strings, got {}", v.kind()),
                                )
                            })?
                        }
                    };
                    out.insert(key, value.value(scope)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Parens(inner) => inner.value(scope),
        }
    }
}

/// Bool coercion used by conditions, `!` and the logical operators.
pub fn truthiness(value: &Value) -> Result<bool, Diagnostics> {
    value.coerce_bool().ok_or_else(|| {
        error(
            "invalid condition",
            format!("expected a bool, got {}", value.kind()),
        )
    })
}

fn bindings(
    key_var: Option<&str>,
    value_var: &str,
    key: Value,
    value: Value,
) -> HashMap<String, Value> {
    let mut frame = HashMap::new();
    if let Some(key_var) = key_var {
        frame.insert(key_var.to_string(), key);
    }
    frame.insert(value_var.to_string(), value);
    frame
}

/// Key/value pairs of an iterable value. Lists yield their index as key.
pub fn iterate(value: &Value) -> Result<Vec<(Value, Value)>, Diagnostics> {
    match value {
        Value::List(items) | Value::Set(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i as i64), v.clone()))
            .collect()),
        Value::Map(entries) | Value::Object(entries) => Ok(entries
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect()),
        other => Err(error(
            "cannot iterate",
            format!("expected a list, set, map or object, got {}", other.kind()),
        )),
    }
}

fn render_template(parts: &[TemplatePart], scope: &mut Scope<'_>) -> Result<String, Diagnostics> {
    let mut out = String::new();
    for part in parts {
        match part {
            TemplatePart::Literal(text) => out.push_str(text),
            TemplatePart::Interpolation(expr) => {
                let value = expr.value(scope)?;
                if value.is_null() {
                    return Err(error(
                        "invalid template interpolation",
                        "the expression result is null; cannot include a null value in a string template",
                    ));
                }
                out.push_str(&value.render());
            }
            TemplatePart::If { cond, then, otherwise } => {
                let branch = if truthiness(&cond.value(scope)?)? {
                    then
                } else {
                    otherwise
                };
                out.push_str(&render_template(branch, scope)?);
            }
            TemplatePart::For {
                key_var,
                value_var,
                collection,
                body,
            } => {
                let items = iterate(&collection.value(scope)?)?;
                for (k, v) in items {
                    scope.push_frame(bindings(key_var.as_deref(), value_var, k, v));
                    let rendered = render_template(body, scope);
                    scope.pop_frame();
                    out.push_str(&rendered?);
                }
            }
        }
    }
    Ok(out)
}

fn apply_steps(
    mut value: Value,
    steps: &[AccessStep],
    scope: &mut Scope<'_>,
) -> Result<Value, Diagnostics> {
    for (i, step) in steps.iter().enumerate() {
        match step {
            AccessStep::Attr(name) => value = get_attr(&value, name)?,
            AccessStep::Index(expr) => {
                let key = expr.value(scope)?;
                value = get_index(&value, &key)?;
            }
            AccessStep::Splat => {
                let rest = &steps[i + 1..];
                let items: Vec<Value> = match value {
                    Value::List(v) | Value::Set(v) => v,
                    Value::Null(_) => Vec::new(),
                    single => vec![single],
                };
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(apply_steps(item, rest, scope)?);
                }
                return Ok(Value::List(out));
            }
        }
    }
    Ok(value)
}

fn get_attr(value: &Value, name: &str) -> Result<Value, Diagnostics> {
    match value {
        Value::Object(entries) | Value::Map(entries) => entries.get(name).cloned().ok_or_else(|| {
            error(
                "unknown attribute",
                format!("this object has no attribute named \"{}\"", name),
            )
        }),
        Value::Null(_) => Err(error(
            "attempt to get attribute from null value",
            format!("cannot read \"{}\" from a null value", name),
        )),
        other => Err(error(
            "unsupported attribute access",
            format!("cannot read \"{}\" from a {} value", name, other.kind()),
        )),
    }
}

fn get_index(value: &Value, key: &Value) -> Result<Value, Diagnostics> {
    match value {
        Value::List(items) | Value::Set(items) => {
            let idx = key.as_i64().ok_or_else(|| {
                error(
                    "invalid index",
                    format!("list indices must be numbers, got {}", key.kind()),
                )
            })?;
            if idx < 0 || idx as usize >= items.len() {
                return Err(error(
                    "index out of range",
                    format!("index {} is outside 0..{}", idx, items.len()),
                ));
            }
            Ok(items[idx as usize].clone())
        }
        Value::Map(entries) | Value::Object(entries) => {
            let key = key.coerce_string().ok_or_else(|| {
                error(
                    "invalid index",
                    format!("map keys must be strings, got {}", key.kind()),
                )
            })?;
            entries.get(&key).cloned().ok_or_else(|| {
                error("unknown key", format!("this map has no key \"{}\"", key))
            })
        }
        Value::Null(_) => Err(error("attempt to index null value", "the value is null")),
        other => Err(error(
            "unsupported index",
            format!("cannot index a {} value", other.kind()),
        )),
    }
}

fn call_function(
    name: &str,
    args: &[Expr],
    expand_final: bool,
    scope: &mut Scope<'_>,
) -> Result<Value, Diagnostics> {
    // try/can observe evaluation failures of their arguments, so their
    // arguments stay unevaluated here.
    match name {
        "try" => {
            let mut last_err = error("try failed", "no expressions were given to try()");
            for arg in args {
                match arg.value(scope) {
                    Ok(v) => return Ok(v),
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        }
        "can" => {
            if args.len() != 1 {
                return Err(error("invalid arguments", "can() takes exactly one argument"));
            }
            Ok(Value::Bool(args[0].value(scope).is_ok()))
        }
        _ => {
            let mut values = Vec::with_capacity(args.len());
            for (i, arg) in args.iter().enumerate() {
                let v = arg.value(scope)?;
                if expand_final && i == args.len() - 1 {
                    match v {
                        Value::List(items) | Value::Set(items) => values.extend(items),
                        other => {
                            return Err(error(
                                "invalid expansion",
                                format!("the ... operand must be a list, got {}", other.kind()),
                            ))
                        }
                    }
                } else {
                    values.push(v);
                }
            }
            match scope.function(name) {
                Some(function) => function.call(name, &values),
                None => Err(error(
                    "unknown function",
                    format!("there is no function named \"{}\"", name),
                )),
            }
        }
    }
}

fn binary_op(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &mut Scope<'_>) -> Result<Value, Diagnostics> {
    // Short-circuit the logical operators.
    match op {
        BinOp::And => {
            if !truthiness(&lhs.value(scope)?)? {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthiness(&rhs.value(scope)?)?));
        }
        BinOp::Or => {
            if truthiness(&lhs.value(scope)?)? {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthiness(&rhs.value(scope)?)?));
        }
        _ => {}
    }

    let left = lhs.value(scope)?;
    let right = rhs.value(scope)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(left == right)),
        BinOp::NotEq => Ok(Value::Bool(left != right)),
        BinOp::Less | BinOp::LessEq | BinOp::Greater | BinOp::GreaterEq => {
            let (a, b) = numeric_pair(op, &left, &right)?;
            let ord = a
                .partial_cmp(&b)
                .ok_or_else(|| error("invalid comparison", "cannot compare NaN"))?;
            Ok(Value::Bool(match op {
                BinOp::Less => ord.is_lt(),
                BinOp::LessEq => ord.is_le(),
                BinOp::Greater => ord.is_gt(),
                BinOp::GreaterEq => ord.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            let (a, b) = numeric_pair(op, &left, &right)?;
            Ok(Value::Number(arith(op, a, b)?))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn numeric_pair(op: BinOp, left: &Value, right: &Value) -> Result<(Number, Number), Diagnostics> {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(error(
            "invalid operands",
            format!(
                "operator {:?} requires numbers, got {} and {}",
                op,
                left.kind(),
                right.kind()
            ),
        )),
    }
}

fn arith(op: BinOp, a: Number, b: Number) -> Result<Number, Diagnostics> {
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        match op {
            BinOp::Add => {
                if let Some(r) = x.checked_add(y) {
                    return Ok(Number::Int(r));
                }
            }
            BinOp::Sub => {
                if let Some(r) = x.checked_sub(y) {
                    return Ok(Number::Int(r));
                }
            }
            BinOp::Mul => {
                if let Some(r) = x.checked_mul(y) {
                    return Ok(Number::Int(r));
                }
            }
            BinOp::Div => {
                if y == 0 {
                    return Err(error("division by zero", "the divisor is zero"));
                }
                if x % y == 0 {
                    return Ok(Number::Int(x / y));
                }
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(error("division by zero", "the divisor is zero"));
                }
                return Ok(Number::Int(x % y));
            }
            _ => unreachable!(),
        }
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(error("division by zero", "the divisor is zero"));
            }
            x / y
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(error("division by zero", "the divisor is zero"));
            }
            x % y
        }
        _ => unreachable!(),
    };
    Ok(Number::from(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvalContext;
    use crate::lower::lower;

    fn ctx() -> EvalContext {
        let mut ctx = EvalContext::with_functions(crate::funcs::standard_functions(
            std::env::current_dir().unwrap(),
        ));
        ctx.set_variable("cwd", Value::from("/work"));
        ctx.publish(
            "stage",
            &["build", "output"],
            Value::from("artifact.tar"),
        );
        ctx.publish("output", &["MSG"], Value::from("hi"));
        ctx.set_variable("true", Value::Bool(true));
        ctx.set_variable("false", Value::Bool(false));
        ctx.set_variable("null", Value::NULL);
        ctx
    }

    fn eval_src(src: &str) -> Result<Value, Diagnostics> {
        let body: hcl::Body = hcl::parse(&format!("a = {}\n", src)).unwrap();
        let attr = body.attributes().next().unwrap();
        let expr = lower(attr.expr());
        let ctx = ctx();
        let mut scope = Scope::new(&ctx);
        expr.value(&mut scope)
    }

    #[test]
    fn test_eval_arithmetic() {
        assert_eq!(eval_src("1 + 2 * 3").unwrap(), Value::from(7));
        assert_eq!(eval_src("7 / 2").unwrap(), Value::from(3.5));
        assert_eq!(eval_src("6 / 2").unwrap(), Value::from(3));
        assert_eq!(eval_src("7 % 3").unwrap(), Value::from(1));
    }

    #[test]
    fn test_eval_template_with_traversal() {
        assert_eq!(
            eval_src(r#""echo ${output.MSG}""#).unwrap(),
            Value::from("echo hi")
        );
    }

    #[test]
    fn test_eval_conditional_and_logic() {
        assert_eq!(eval_src(r#"1 == 1 ? "y" : "n""#).unwrap(), Value::from("y"));
        assert_eq!(eval_src("true && !false").unwrap(), Value::Bool(true));
        assert_eq!(eval_src("false || false").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_eval_unknown_variable_is_error() {
        let err = eval_src("nosuch.thing").unwrap_err();
        assert!(err.has_errors());
    }

    #[test]
    fn test_eval_try_recovers() {
        assert_eq!(
            eval_src(r#"try(nosuch.thing, "fallback")"#).unwrap(),
            Value::from("fallback")
        );
        assert_eq!(eval_src("can(nosuch.thing)").unwrap(), Value::Bool(false));
        assert_eq!(eval_src("can(stage.build.output)").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_eval_for_expressions() {
        assert_eq!(
            eval_src("[for x in [1, 2, 3] : x * 2]").unwrap(),
            Value::List(vec![Value::from(2), Value::from(4), Value::from(6)])
        );
        let obj = eval_src(r#"{for i, x in ["a", "b"] : x => i}"#).unwrap();
        assert_eq!(obj.as_entries().unwrap()["b"], Value::from(1));
    }

    #[test]
    fn test_eval_splat() {
        let v = eval_src(r#"[{name = "a"}, {name = "b"}][*].name"#).unwrap();
        assert_eq!(
            v,
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_null_in_template_is_error() {
        let err = eval_src(r#""x: ${null}""#).unwrap_err();
        assert!(err.has_errors());
    }

    #[test]
    fn test_function_call_through_table() {
        assert_eq!(eval_src(r#"upper("hi")"#).unwrap(), Value::from("HI"));
        assert_eq!(eval_src("max(1, 5, 3)").unwrap(), Value::from(5));
    }
}
