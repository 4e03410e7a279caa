//! Construction of the root evaluation context: the function table plus the
//! pre-seeded variables. Installed once at startup and never mutated.

use crate::config::Config;
use crate::pipeline::PARAM_ENV_PREFIX;
use chrono::Utc;
use std::path::Path;
use togomak_expr::funcs::standard_functions;
use togomak_expr::{EvalContext, SharedContext, Value};
use uuid::Uuid;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn create_eval_context(cfg: &Config, pipeline_id: Uuid, tempdir: &Path) -> SharedContext {
    let mut ctx = EvalContext::with_functions(standard_functions(cfg.paths.cwd.clone()));

    ctx.set_variable("true", Value::Bool(true));
    ctx.set_variable("false", Value::Bool(false));
    ctx.set_variable("null", Value::NULL);

    ctx.set_variable("owd", Value::from(cfg.paths.owd.to_string_lossy().as_ref()));
    ctx.set_variable("cwd", Value::from(cfg.paths.cwd.to_string_lossy().as_ref()));
    ctx.set_variable("hostname", Value::from(cfg.hostname.as_str()));
    ctx.set_variable("hostuser", Value::from(cfg.user.as_str()));

    ctx.set_variable(
        "pipeline",
        Value::object_of(vec![
            ("id".to_string(), Value::from(pipeline_id.to_string())),
            (
                "path".to_string(),
                Value::from(cfg.paths.pipeline.to_string_lossy().as_ref()),
            ),
            (
                "tempDir".to_string(),
                Value::from(tempdir.to_string_lossy().as_ref()),
            ),
        ]),
    );

    let now = Utc::now();
    ctx.set_variable(
        "togomak",
        Value::object_of(vec![
            ("version".to_string(), Value::from(APP_VERSION)),
            (
                "boot_time".to_string(),
                Value::from(now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            ),
            ("boot_time_unix".to_string(), Value::from(now.timestamp())),
            ("pipeline_id".to_string(), Value::from(pipeline_id.to_string())),
            ("ci".to_string(), Value::Bool(cfg.behavior.ci)),
            ("unattended".to_string(), Value::Bool(cfg.behavior.unattended)),
        ]),
    );

    ctx.set_variable("ansi", ansi_palette());

    let shared = SharedContext::new(ctx);
    seed_params(&shared, cfg);
    shared
}

/// Literal escape sequences exposed as `ansi.fg.*`, `ansi.bg.*`, `ansi.reset`.
fn ansi_palette() -> Value {
    let fg = vec![
        ("red", "\x1b[31m"),
        ("green", "\x1b[32m"),
        ("yellow", "\x1b[33m"),
        ("blue", "\x1b[34m"),
        ("purple", "\x1b[35m"),
        ("cyan", "\x1b[36m"),
        ("white", "\x1b[37m"),
        ("grey", "\x1b[90m"),
        ("bold", "\x1b[1m"),
        ("italic", "\x1b[3m"),
        ("underline", "\x1b[4m"),
    ];
    let bg = vec![
        ("red", "\x1b[41m"),
        ("green", "\x1b[42m"),
        ("yellow", "\x1b[43m"),
        ("blue", "\x1b[44m"),
        ("purple", "\x1b[45m"),
        ("cyan", "\x1b[46m"),
        ("white", "\x1b[47m"),
        ("grey", "\x1b[100m"),
    ];
    Value::object_of(vec![
        (
            "fg".to_string(),
            Value::object_of(
                fg.into_iter()
                    .map(|(k, v)| (k.to_string(), Value::from(v)))
                    .collect::<Vec<_>>(),
            ),
        ),
        (
            "bg".to_string(),
            Value::object_of(
                bg.into_iter()
                    .map(|(k, v)| (k.to_string(), Value::from(v)))
                    .collect::<Vec<_>>(),
            ),
        ),
        ("reset".to_string(), Value::from("\x1b[0m")),
    ])
}

/// Seed the `param` namespace. In a child invocation every
/// `TOGOMAK__param__<name>` environment variable becomes `param.<name>`.
fn seed_params(shared: &SharedContext, cfg: &Config) {
    let mut params: Vec<(String, Value)> = Vec::new();
    if cfg.behavior.child.enabled {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(PARAM_ENV_PREFIX) {
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    params.push((name.to_string(), Value::String(value)));
                }
            }
        }
    }
    shared.set_namespace("param", Value::object_of(params));
}

#[cfg(test)]
mod tests {
    use super::*;
    use togomak_expr::eval::evaluate;
    use togomak_expr::lower::lower;

    fn eval_in(shared: &SharedContext, src: &str) -> Value {
        let body: hcl::Body = hcl::parse(&format!("a = {}\n", src)).unwrap();
        let expr = lower(body.attributes().next().unwrap().expr());
        evaluate(shared, &expr, &[]).unwrap()
    }

    #[test]
    fn test_preseeded_variables() {
        let cfg = Config::default();
        let id = Uuid::new_v4();
        let shared = create_eval_context(&cfg, id, Path::new("/tmp/x"));

        assert_eq!(eval_in(&shared, "togomak.pipeline_id"), Value::from(id.to_string()));
        assert_eq!(eval_in(&shared, "pipeline.tempDir"), Value::from("/tmp/x"));
        assert_eq!(eval_in(&shared, "ansi.reset"), Value::from("\x1b[0m"));
        assert_eq!(eval_in(&shared, "togomak.version"), Value::from(APP_VERSION));
    }

    #[test]
    fn test_functions_installed() {
        let cfg = Config::default();
        let shared = create_eval_context(&cfg, Uuid::new_v4(), Path::new("/tmp/x"));
        assert_eq!(eval_in(&shared, "upper(\"x\")"), Value::from("X"));
    }
}
