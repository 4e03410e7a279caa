//! The `prompt` data provider: ask the user for a value.
//!
//! Resolution order: a pre-answered `TOGOMAK__prompt__<id>` environment
//! variable wins; unattended runs fall back to `default`; otherwise the user
//! is prompted interactively. Failures reading the terminal downgrade to a
//! warning and return the default.

use super::DataProvider;
use crate::blocks::Data;
use crate::pipeline::PROMPT_ENV_PREFIX;
use crate::RunContext;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::io::Write;
use togomak_expr::eval::evaluate;
use togomak_expr::{Diagnostic, Diagnostics, Value};
use tracing::{debug, warn};

pub struct PromptProvider;

impl PromptProvider {
    fn decode(&self, data: &Data, run: &RunContext) -> Result<(String, String), Diagnostics> {
        let mut decoded = (String::new(), String::new());
        if let Some(expr) = data.body.attr("prompt") {
            decoded.0 = evaluate(&run.ctx, expr, &[])?.render();
        }
        if let Some(expr) = data.body.attr("default") {
            decoded.1 = evaluate(&run.ctx, expr, &[])?.render();
        }
        Ok(decoded)
    }
}

#[async_trait]
impl DataProvider for PromptProvider {
    fn name(&self) -> &'static str {
        "prompt"
    }

    fn schema(&self) -> &'static [&'static str] {
        &["prompt", "default"]
    }

    async fn evaluate(
        &self,
        data: &Data,
        run: &RunContext,
    ) -> Result<(String, IndexMap<String, Value>, Diagnostics), Diagnostics> {
        let (prompt, default) = self.decode(data, run)?;
        let mut diags = Diagnostics::new();

        let env_var = format!("{}{}", PROMPT_ENV_PREFIX, data.name);
        debug!("checking for environment variable {}", env_var);
        let value = if let Ok(answer) = std::env::var(&env_var) {
            debug!("environment variable found, using that");
            answer
        } else if run.config.behavior.unattended {
            warn!("--unattended/--ci mode enabled, falling back to default");
            default.clone()
        } else {
            let message = if prompt.is_empty() {
                format!("Enter a value for {}:", self.name())
            } else {
                prompt.clone()
            };
            match ask(&message, &default) {
                Ok(answer) => answer,
                Err(e) => {
                    warn!("unable to get value from prompt: {}", e);
                    diags.push(Diagnostic::warning(
                        "unable to get value from prompt",
                        e.to_string(),
                    ));
                    default.clone()
                }
            }
        };

        let mut attributes = IndexMap::new();
        attributes.insert("prompt".to_string(), Value::from(prompt));
        attributes.insert("default".to_string(), Value::from(default));
        Ok((value, attributes, diags))
    }
}

fn ask(message: &str, default: &str) -> std::io::Result<String> {
    let mut stderr = std::io::stderr();
    if default.is_empty() {
        write!(stderr, "{} ", message)?;
    } else {
        write!(stderr, "{} [{}] ", message, default)?;
    }
    stderr.flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim_end_matches(['\r', '\n']);
    if answer.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(answer.to_string())
    }
}
