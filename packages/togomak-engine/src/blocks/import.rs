//! The `import` block: textual merge of another pipeline file.

use super::literal_string;
use togomak_expr::{lower::lower, Diagnostic, Diagnostics};

#[derive(Debug, Clone)]
pub struct Import {
    /// Path to the imported file or directory, relative to the importing
    /// file. Imports expand before any evaluation, so the source must be a
    /// literal.
    pub source: String,
}

impl Import {
    pub fn decode(body: &hcl::Body) -> Result<Import, Diagnostics> {
        let mut source = None;
        let mut diags = Diagnostics::new();
        for attr in body.attributes() {
            match attr.key() {
                "source" => source = Some(literal_string(&lower(attr.expr()), "import.source")?),
                other => diags.push(Diagnostic::error(
                    "unsupported attribute",
                    format!("import block has no attribute named \"{}\"", other),
                )),
            }
        }
        match source {
            Some(source) if !diags.has_errors() => Ok(Import { source }),
            _ => {
                if !diags.has_errors() {
                    diags.push(Diagnostic::error(
                        "missing attribute",
                        "import block requires a \"source\" attribute",
                    ));
                }
                Err(diags)
            }
        }
    }
}
