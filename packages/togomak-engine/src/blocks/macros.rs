//! The `macro` block.
//!
//! A macro is a reusable template a stage invokes through its `use` block.
//! Three shapes exist: an inline `stage` template that merges into the using
//! stage, a `source` path to a sub-pipeline directory run by recursive
//! self-invocation, and inline `files` materialised to a temp directory and
//! run the same way.

use super::stage::Stage;
use togomak_expr::{lower::lower, Diagnostic, Diagnostics, Expr, Traversal};

#[derive(Debug, Clone)]
pub struct Macro {
    pub id: String,
    pub source: Option<Expr>,
    pub stage: Option<Stage>,
    /// Map of file name to content.
    pub files: Option<Expr>,
}

impl Macro {
    pub fn identifier(&self) -> String {
        format!("macro.{}", self.id)
    }

    pub fn decode(id: &str, body: &hcl::Body) -> Result<Macro, Diagnostics> {
        let mut diags = Diagnostics::new();
        let mut source = None;
        let mut files = None;
        let mut stage = None;

        for attr in body.attributes() {
            let expr = lower(attr.expr());
            match attr.key() {
                "source" => source = Some(expr),
                "files" => files = Some(expr),
                other => diags.push(Diagnostic::error(
                    "unsupported attribute",
                    format!("macro.{} has no attribute named \"{}\"", id, other),
                )),
            }
        }
        for block in body.blocks() {
            match block.identifier() {
                "stage" => match Stage::decode(id, block.body()) {
                    Ok(template) => stage = Some(template),
                    Err(d) => diags.extend(d),
                },
                other => diags.push(Diagnostic::error(
                    "unsupported block",
                    format!("macro.{} has no block type named \"{}\"", id, other),
                )),
            }
        }

        let shapes = [source.is_some(), stage.is_some(), files.is_some()]
            .iter()
            .filter(|present| **present)
            .count();
        if shapes > 1 {
            diags.push(Diagnostic::error(
                "conflicting macro definition",
                format!(
                    "macro.{} must define exactly one of source, files or an inline stage",
                    id
                ),
            ));
        }
        if diags.has_errors() {
            return Err(diags);
        }
        Ok(Macro {
            id: id.to_string(),
            source,
            stage,
            files,
        })
    }

    pub fn variables(&self) -> Vec<Traversal> {
        let mut out = Vec::new();
        if let Some(source) = &self.source {
            out.extend(source.variables());
        }
        if let Some(files) = &self.files {
            out.extend(files.variables());
        }
        if let Some(stage) = &self.stage {
            out.extend(stage.variables());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_macro(src: &str) -> Result<Macro, Diagnostics> {
        let body: hcl::Body = hcl::parse(src).unwrap();
        let block = body.blocks().next().unwrap();
        let id = block.labels().first().unwrap().as_str().to_string();
        Macro::decode(&id, block.body())
    }

    #[test]
    fn test_decode_inline_stage_macro() {
        let m = parse_macro(
            r#"
            macro "lint" {
              stage {
                script = "cargo clippy"
              }
            }
            "#,
        )
        .unwrap();
        assert!(m.stage.is_some());
        assert_eq!(m.identifier(), "macro.lint");
    }

    #[test]
    fn test_decode_files_macro() {
        let m = parse_macro(
            r#"
            macro "sub" {
              files = {
                "togomak.hcl" = "stage \"a\" {}"
              }
            }
            "#,
        )
        .unwrap();
        assert!(m.files.is_some());
    }

    #[test]
    fn test_conflicting_shapes_rejected() {
        let err = parse_macro(
            r#"
            macro "bad" {
              source = "./sub"
              files  = {}
            }
            "#,
        )
        .unwrap_err();
        assert!(err.has_errors());
    }
}
