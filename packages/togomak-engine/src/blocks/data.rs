//! The `data` block.
//!
//! A data block is addressed as `data.<provider>.<name>`. Its body is
//! provider-specific: attributes stay lazy expressions and are decoded by the
//! provider at run time against the shared evaluation context.

use indexmap::IndexMap;
use togomak_expr::{lower::lower, Diagnostics, Expr, Traversal};

/// A provider-agnostic view of a data block body: top-level attributes plus
/// one level of nested blocks (e.g. the git provider's `auth`).
#[derive(Debug, Clone, Default)]
pub struct DataBody {
    pub attrs: IndexMap<String, Expr>,
    pub blocks: Vec<(String, IndexMap<String, Expr>)>,
}

impl DataBody {
    pub fn decode(body: &hcl::Body) -> DataBody {
        let mut out = DataBody::default();
        for attr in body.attributes() {
            out.attrs.insert(attr.key().to_string(), lower(attr.expr()));
        }
        for block in body.blocks() {
            let mut attrs = IndexMap::new();
            for attr in block.body().attributes() {
                attrs.insert(attr.key().to_string(), lower(attr.expr()));
            }
            out.blocks.push((block.identifier().to_string(), attrs));
        }
        out
    }

    pub fn attr(&self, name: &str) -> Option<&Expr> {
        self.attrs.get(name)
    }

    pub fn block(&self, name: &str) -> Option<&IndexMap<String, Expr>> {
        self.blocks
            .iter()
            .find(|(block_name, _)| block_name == name)
            .map(|(_, attrs)| attrs)
    }
}

#[derive(Debug, Clone)]
pub struct Data {
    pub provider: String,
    pub name: String,
    pub body: DataBody,
}

impl Data {
    pub fn decode(provider: &str, name: &str, body: &hcl::Body) -> Result<Data, Diagnostics> {
        Ok(Data {
            provider: provider.to_string(),
            name: name.to_string(),
            body: DataBody::decode(body),
        })
    }

    /// The two-segment id used in the evaluation context and the graph.
    pub fn id(&self) -> String {
        format!("{}.{}", self.provider, self.name)
    }

    pub fn identifier(&self) -> String {
        format!("data.{}.{}", self.provider, self.name)
    }

    pub fn variables(&self) -> Vec<Traversal> {
        let mut out = Vec::new();
        for expr in self.body.attrs.values() {
            out.extend(expr.variables());
        }
        for (_, attrs) in &self.body.blocks {
            for expr in attrs.values() {
                out.extend(expr.variables());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_block() {
        let body: hcl::Body = hcl::parse(
            r#"
            data "git" "repo" {
              url   = "https://example.com/repo.git"
              depth = 1
              auth {
                username = "u"
                password = "p"
              }
            }
            "#,
        )
        .unwrap();
        let block = body.blocks().next().unwrap();
        let labels = block.labels();
        let data = Data::decode(labels[0].as_str(), labels[1].as_str(), block.body()).unwrap();
        assert_eq!(data.id(), "git.repo");
        assert_eq!(data.identifier(), "data.git.repo");
        assert!(data.body.attr("url").is_some());
        assert!(data.body.block("auth").unwrap().contains_key("password"));
    }
}
