//! Data providers.
//!
//! A provider decodes a data block's body against the shared evaluation
//! context, computes a primary value plus an attribute map, and the engine
//! publishes `data.<provider>.<name>` as the attribute map merged with
//! `{ value = <value> }`.

pub mod git;
pub mod prompt;

use crate::blocks::Data;
use crate::RunContext;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use togomak_expr::{Diagnostic, Diagnostics, Value};
use tracing::debug;

#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn identifier(&self) -> String {
        format!("data.{}", self.name())
    }

    /// Attribute and block names the provider understands, used to reject
    /// typos at decode time.
    fn schema(&self) -> &'static [&'static str];

    /// Decode the block body and produce `(value, attributes, warnings)`.
    async fn evaluate(
        &self,
        data: &Data,
        run: &RunContext,
    ) -> Result<(String, IndexMap<String, Value>, Diagnostics), Diagnostics>;
}

/// Dispatch table keyed by provider name.
pub fn lookup(name: &str) -> Option<Arc<dyn DataProvider>> {
    match name {
        "prompt" => Some(Arc::new(prompt::PromptProvider)),
        "git" => Some(Arc::new(git::GitProvider)),
        _ => None,
    }
}

/// Run a data block: dispatch to its provider and publish the result.
pub async fn run_data(data: &Data, run: &RunContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(provider) = lookup(&data.provider) else {
        diags.push(Diagnostic::error(
            "unknown data provider",
            format!(
                "{} references provider \"{}\", which is not registered",
                data.identifier(),
                data.provider
            ),
        ));
        return diags;
    };

    for attr in data.body.attrs.keys() {
        if !provider.schema().contains(&attr.as_str()) {
            diags.push(Diagnostic::error(
                "unsupported attribute",
                format!("{} has no attribute named \"{}\"", data.identifier(), attr),
            ));
        }
    }
    if diags.has_errors() {
        return diags;
    }

    debug!(data = %data.identifier(), "running data provider");
    match provider.evaluate(data, run).await {
        Ok((value, mut attributes, warnings)) => {
            diags.extend(warnings);
            attributes.insert("value".to_string(), Value::from(value));
            run.ctx
                .publish("data", &[&data.provider, &data.name], Value::Object(attributes));
        }
        Err(d) => diags.extend(d),
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_providers() {
        assert_eq!(lookup("prompt").unwrap().name(), "prompt");
        assert_eq!(lookup("git").unwrap().name(), "git");
        assert!(lookup("vault").is_none());
    }
}
