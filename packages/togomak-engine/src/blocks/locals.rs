//! The `locals` block: named derived values.

use togomak_expr::{lower::lower, Expr, Traversal};

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub expr: Expr,
}

impl Local {
    pub fn identifier(&self) -> String {
        format!("local.{}", self.name)
    }

    /// Decode every attribute of a `locals { ... }` body.
    pub fn decode_all(body: &hcl::Body) -> Vec<Local> {
        body.attributes()
            .map(|attr| Local {
                name: attr.key().to_string(),
                expr: lower(attr.expr()),
            })
            .collect()
    }

    pub fn variables(&self) -> Vec<Traversal> {
        self.expr.variables()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_locals() {
        let body: hcl::Body = hcl::parse(
            r#"
            locals {
              version = "1.2.3"
              tag     = "v${local.version}"
            }
            "#,
        )
        .unwrap();
        let block = body.blocks().next().unwrap();
        let locals = Local::decode_all(block.body());
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[0].identifier(), "local.version");
        assert_eq!(locals[1].variables()[0].to_string(), "local.version");
    }
}
