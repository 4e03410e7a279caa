//! Block runtimes: stage execution, macro publication, container seam.

pub mod container;
pub mod options;
pub mod stage;

pub use options::{Parent, RunnableOptions, Status};

use crate::blocks::Macro;
use crate::RunContext;
use togomak_expr::eval::evaluate;
use togomak_expr::{Diagnostics, Value};
use tracing::debug;

/// A macro's "run" only publishes its inline files under `macro.<id>` so
/// sibling blocks can reference them; expansion into a stage happens inside
/// the using stage.
pub fn run_macro(m: &Macro, run: &RunContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    debug!(macro_ = %m.identifier(), "publishing macro");
    let files = match &m.files {
        Some(files) => match evaluate(&run.ctx, files, &[]) {
            Ok(v) => v,
            Err(d) => {
                diags.extend(d);
                return diags;
            }
        },
        None => Value::NULL,
    };
    run.ctx.publish_macro(
        &m.id,
        Value::object_of(vec![("files".to_string(), files)]),
    );
    diags
}
