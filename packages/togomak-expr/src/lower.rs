//! Lowering from the `hcl` syntax tree into the [`Expr`] AST.
//!
//! Runs once at pipeline load. Lowering is infallible: the parser has
//! already validated syntax, and the rare construct we cannot represent
//! degrades to a literal so evaluation can report a precise error later.

use crate::expr::{AccessStep, BinOp, Expr, ObjectKey, TemplatePart, UnaryOp};
use crate::value::{Number, Value};
use hcl::template::{Directive, Element, Template};
use hcl::{BinaryOperator, Expression, HeredocStripMode, TemplateExpr, TraversalOperator, UnaryOperator};

pub fn lower(expr: &Expression) -> Expr {
    match expr {
        Expression::Null => Expr::null(),
        Expression::Bool(b) => Expr::Literal(Value::Bool(*b)),
        Expression::Number(n) => Expr::Literal(lower_number(n)),
        Expression::String(s) => Expr::Literal(Value::String(s.clone())),
        Expression::Array(items) => Expr::Array(items.iter().map(lower).collect()),
        Expression::Object(entries) => Expr::Object(
            entries
                .iter()
                .map(|(key, value)| {
                    let key = match key {
                        hcl::ObjectKey::Identifier(ident) => ObjectKey::Ident(ident.to_string()),
                        hcl::ObjectKey::Expression(expr) => ObjectKey::Expr(lower(expr)),
                        _ => ObjectKey::Ident(key.to_string()),
                    };
                    (key, lower(value))
                })
                .collect(),
        ),
        Expression::TemplateExpr(template) => lower_template_expr(template),
        Expression::Variable(var) => Expr::Variable(var.to_string()),
        Expression::Traversal(traversal) => {
            let base = lower(&traversal.expr);
            let steps = traversal
                .operators
                .iter()
                .map(|op| match op {
                    TraversalOperator::GetAttr(ident) => AccessStep::Attr(ident.to_string()),
                    TraversalOperator::Index(expr) => AccessStep::Index(lower(expr)),
                    TraversalOperator::LegacyIndex(i) => {
                        AccessStep::Index(Expr::Literal(Value::from(*i as i64)))
                    }
                    TraversalOperator::FullSplat | TraversalOperator::AttrSplat => AccessStep::Splat,
                    _ => AccessStep::Splat,
                })
                .collect();
            Expr::Access {
                base: Box::new(base),
                steps,
            }
        }
        Expression::FuncCall(call) => Expr::FuncCall {
            name: call.name.to_string(),
            args: call.args.iter().map(lower).collect(),
            expand_final: call.expand_final,
        },
        Expression::Parenthesis(inner) => Expr::Parens(Box::new(lower(inner))),
        Expression::Conditional(cond) => Expr::Conditional {
            cond: Box::new(lower(&cond.cond_expr)),
            truthy: Box::new(lower(&cond.true_expr)),
            falsy: Box::new(lower(&cond.false_expr)),
        },
        Expression::Operation(op) => match op.as_ref() {
            hcl::Operation::Unary(unary) => Expr::Unary {
                op: match unary.operator {
                    UnaryOperator::Neg => UnaryOp::Neg,
                    UnaryOperator::Not => UnaryOp::Not,
                },
                operand: Box::new(lower(&unary.expr)),
            },
            hcl::Operation::Binary(binary) => Expr::Binary {
                op: lower_binary_operator(binary.operator),
                lhs: Box::new(lower(&binary.lhs_expr)),
                rhs: Box::new(lower(&binary.rhs_expr)),
            },
        },
        Expression::ForExpr(for_expr) => {
            let key_var = for_expr.key_var.as_ref().map(|k| k.to_string());
            let value_var = for_expr.value_var.to_string();
            let collection = Box::new(lower(&for_expr.collection_expr));
            let cond = for_expr.cond_expr.as_ref().map(|c| Box::new(lower(c)));
            match &for_expr.key_expr {
                Some(key_expr) => Expr::ForObject {
                    key_var,
                    value_var,
                    collection,
                    key: Box::new(lower(key_expr)),
                    value: Box::new(lower(&for_expr.value_expr)),
                    cond,
                    grouping: for_expr.grouping,
                },
                None => Expr::ForList {
                    key_var,
                    value_var,
                    collection,
                    value: Box::new(lower(&for_expr.value_expr)),
                    cond,
                },
            }
        }
        // Anything the AST grows that we do not know about degrades to null.
        _ => Expr::null(),
    }
}

fn lower_number(n: &hcl::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Number(Number::Int(i))
    } else {
        Value::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN)))
    }
}

fn lower_binary_operator(op: BinaryOperator) -> BinOp {
    match op {
        BinaryOperator::Eq => BinOp::Eq,
        BinaryOperator::NotEq => BinOp::NotEq,
        BinaryOperator::Less => BinOp::Less,
        BinaryOperator::LessEq => BinOp::LessEq,
        BinaryOperator::Greater => BinOp::Greater,
        BinaryOperator::GreaterEq => BinOp::GreaterEq,
        BinaryOperator::Plus => BinOp::Add,
        BinaryOperator::Minus => BinOp::Sub,
        BinaryOperator::Mul => BinOp::Mul,
        BinaryOperator::Div => BinOp::Div,
        BinaryOperator::Mod => BinOp::Mod,
        BinaryOperator::And => BinOp::And,
        BinaryOperator::Or => BinOp::Or,
    }
}

fn lower_template_expr(template: &TemplateExpr) -> Expr {
    let parsed = match Template::from_expr(template) {
        Ok(parsed) => parsed,
        // Syntax was validated by the parser; an unparsable template body is
        // carried through verbatim.
        Err(_) => {
            let raw = match template {
                TemplateExpr::QuotedString(s) => s.clone(),
                TemplateExpr::Heredoc(heredoc) => heredoc.template.clone(),
            };
            return Expr::Literal(Value::String(raw));
        }
    };

    let mut parts = lower_template(&parsed);
    if let TemplateExpr::Heredoc(heredoc) = template {
        if heredoc.strip == HeredocStripMode::Indent {
            dedent_parts(&mut parts);
        }
    }

    // A template that is exactly one interpolation yields the inner value
    // unwrapped, so `"${[1, 2]}"` stays a list.
    if parts.len() == 1 {
        if let TemplatePart::Interpolation(inner) = &parts[0] {
            return inner.clone();
        }
    }
    if parts.is_empty() {
        return Expr::Literal(Value::String(String::new()));
    }
    if parts.len() == 1 {
        if let TemplatePart::Literal(text) = &parts[0] {
            return Expr::Literal(Value::String(text.clone()));
        }
    }
    Expr::Template(parts)
}

fn lower_template(template: &Template) -> Vec<TemplatePart> {
    template
        .elements()
        .iter()
        .map(|element| match element {
            Element::Literal(text) => TemplatePart::Literal(text.clone()),
            Element::Interpolation(interp) => TemplatePart::Interpolation(lower(&interp.expr)),
            Element::Directive(Directive::If(directive)) => TemplatePart::If {
                cond: lower(&directive.cond_expr),
                then: lower_template(&directive.true_template),
                otherwise: directive
                    .false_template
                    .as_ref()
                    .map(lower_template)
                    .unwrap_or_default(),
            },
            Element::Directive(Directive::For(directive)) => TemplatePart::For {
                key_var: directive.key_var.as_ref().map(|k| k.to_string()),
                value_var: directive.value_var.to_string(),
                collection: lower(&directive.collection_expr),
                body: lower_template(&directive.template),
            },
        })
        .collect()
}

/// Strip the smallest common leading indentation from literal lines
/// (`<<-` heredocs).
fn dedent_parts(parts: &mut [TemplatePart]) {
    let mut min_indent = usize::MAX;
    for part in parts.iter() {
        if let TemplatePart::Literal(text) = part {
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let indent = line.len() - line.trim_start().len();
                min_indent = min_indent.min(indent);
            }
        }
    }
    if min_indent == 0 || min_indent == usize::MAX {
        return;
    }
    for part in parts.iter_mut() {
        if let TemplatePart::Literal(text) = part {
            *text = text
                .split_inclusive('\n')
                .map(|line| {
                    let trimmed = line.trim_start_matches([' ', '\t']);
                    let removed = line.len() - trimmed.len();
                    &line[removed.min(min_indent)..]
                })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower_attr(src: &str) -> Expr {
        let body: hcl::Body = hcl::parse(src).unwrap();
        let attr = body.attributes().next().unwrap();
        lower(attr.expr())
    }

    #[test]
    fn test_lower_literals() {
        assert_eq!(lower_attr("a = 42"), Expr::Literal(Value::from(42)));
        assert_eq!(lower_attr("a = true"), Expr::Literal(Value::Bool(true)));
        assert_eq!(lower_attr("a = null"), Expr::null());
        assert_eq!(lower_attr(r#"a = "plain""#), Expr::Literal(Value::from("plain")));
    }

    #[test]
    fn test_lower_traversal() {
        let expr = lower_attr("a = stage.build.output");
        let vars = expr.variables();
        assert_eq!(vars[0].to_string(), "stage.build.output");
    }

    #[test]
    fn test_lower_template_single_interpolation_unwraps() {
        let expr = lower_attr(r#"a = "${stage.build.output}""#);
        assert!(matches!(expr, Expr::Access { .. }));
    }

    #[test]
    fn test_lower_template_mixed() {
        let expr = lower_attr(r#"a = "echo ${output.MSG}""#);
        match expr {
            Expr::Template(parts) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0], TemplatePart::Literal("echo ".to_string()));
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn test_lower_function_call() {
        let expr = lower_attr(r#"a = upper("hi")"#);
        match expr {
            Expr::FuncCall { name, args, .. } => {
                assert_eq!(name, "upper");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected func call, got {:?}", other),
        }
    }

    #[test]
    fn test_lower_conditional_and_operators() {
        let expr = lower_attr("a = 1 == 2 ? \"x\" : \"y\"");
        assert!(matches!(expr, Expr::Conditional { .. }));
        let expr = lower_attr("a = !false && 2 > 1");
        assert!(matches!(expr, Expr::Binary { op: BinOp::And, .. }));
    }

    #[test]
    fn test_lower_for_expr() {
        let expr = lower_attr("a = [for x in local.items : upper(x)]");
        assert!(matches!(expr, Expr::ForList { .. }));
        let expr = lower_attr("a = {for k, v in local.items : k => v}");
        assert!(matches!(expr, Expr::ForObject { .. }));
    }
}
