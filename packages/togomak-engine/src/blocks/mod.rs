//! The block model: stages, data sources, macros, locals and imports.
//!
//! Blocks are decoded once from the parsed pipeline file. Expression-valued
//! attributes stay lazy ([`Expr`]); attributes that configure the engine
//! itself (retry counts, daemon switches) must be literals and are folded at
//! decode time.

pub mod data;
pub mod import;
pub mod locals;
pub mod macros;
pub mod stage;

pub use data::{Data, DataBody};
pub use import::Import;
pub use locals::Local;
pub use macros::Macro;
pub use stage::{Stage, StageContainer, StageDaemon, StageEnv, StageRetry, StageUse};

use togomak_expr::{Diagnostic, Diagnostics, EvalContext, Expr, Scope, Value};

pub const STAGE_BLOCK: &str = "stage";
pub const DATA_BLOCK: &str = "data";
pub const MACRO_BLOCK: &str = "macro";
pub const LOCALS_BLOCK: &str = "locals";
pub const IMPORT_BLOCK: &str = "import";

/// Evaluate an expression that must be a literal (no context available at
/// decode time).
pub(crate) fn literal(expr: &Expr, what: &str) -> Result<Value, Diagnostics> {
    let ctx = EvalContext::new();
    let mut scope = Scope::new(&ctx);
    expr.value(&mut scope).map_err(|_| {
        Diagnostics::from(Diagnostic::error(
            "invalid attribute",
            format!("{} must be a literal value", what),
        ))
    })
}

pub(crate) fn literal_bool(expr: &Expr, what: &str) -> Result<bool, Diagnostics> {
    let v = literal(expr, what)?;
    v.coerce_bool().ok_or_else(|| {
        Diagnostics::from(Diagnostic::error(
            "invalid attribute",
            format!("{} must be a bool, got {}", what, v.kind()),
        ))
    })
}

pub(crate) fn literal_int(expr: &Expr, what: &str) -> Result<i64, Diagnostics> {
    let v = literal(expr, what)?;
    v.as_i64().ok_or_else(|| {
        Diagnostics::from(Diagnostic::error(
            "invalid attribute",
            format!("{} must be a whole number, got {}", what, v.kind()),
        ))
    })
}

pub(crate) fn literal_string(expr: &Expr, what: &str) -> Result<String, Diagnostics> {
    let v = literal(expr, what)?;
    v.coerce_string().ok_or_else(|| {
        Diagnostics::from(Diagnostic::error(
            "invalid attribute",
            format!("{} must be a string, got {}", what, v.kind()),
        ))
    })
}
