//! Pipeline loading: parse, import expansion and local expansion.

use crate::blocks::{Data, Import, Local, Macro, Stage};
use crate::graph::DepGraph;
use crate::resolver;
use crate::RunContext;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use togomak_expr::eval::evaluate;
use togomak_expr::{Diagnostic, Diagnostics};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "togomak.hcl";
pub const OUTPUT_ENV_FILE: &str = "togomak.env";
pub const OUTPUT_ENV_VAR: &str = "TOGOMAK_OUTPUTS";
pub const PARAM_ENV_PREFIX: &str = "TOGOMAK__param__";
pub const PROMPT_ENV_PREFIX: &str = "TOGOMAK__prompt__";

/// A parsed, import-expanded pipeline.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub stages: Vec<Arc<Stage>>,
    pub data: Vec<Arc<Data>>,
    pub macros: Vec<Arc<Macro>>,
    pub locals: Vec<Local>,
    /// Concatenated source of every merged file, written to the run's temp
    /// directory as a debugging snapshot.
    pub source: String,
}

/// The runtime face of a block the scheduler can dispatch.
#[derive(Clone)]
pub enum RunnableRef {
    Stage(Arc<Stage>),
    Data(Arc<Data>),
    Macro(Arc<Macro>),
}

impl RunnableRef {
    pub fn identifier(&self) -> String {
        match self {
            RunnableRef::Stage(s) => s.identifier(),
            RunnableRef::Data(d) => d.identifier(),
            RunnableRef::Macro(m) => m.identifier(),
        }
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self, RunnableRef::Stage(s) if s.is_daemon())
    }
}

impl Pipeline {
    /// Read and parse the pipeline at `path`, expanding imports recursively.
    pub fn load(path: &Path) -> Result<Pipeline, Diagnostics> {
        let mut pipeline = Pipeline::default();
        let mut visited = HashSet::new();
        pipeline.merge_file(path, &mut visited)?;
        pipeline.check_duplicates()?;
        Ok(pipeline)
    }

    fn merge_file(&mut self, path: &Path, visited: &mut HashSet<PathBuf>) -> Result<(), Diagnostics> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !visited.insert(canonical) {
            // Importing the same file twice through different routes is fine;
            // its blocks are already merged.
            return Ok(());
        }
        debug!(file = %path.display(), "reading pipeline file");

        let source = std::fs::read_to_string(path).map_err(|e| {
            Diagnostics::from(Diagnostic::error(
                "cannot read pipeline file",
                format!("{}: {}", path.display(), e),
            ))
        })?;
        let body: hcl::Body = hcl::parse(&source).map_err(|e| {
            Diagnostics::from(Diagnostic::error(
                "invalid pipeline file",
                format!("{}: {}", path.display(), e),
            ))
        })?;
        self.source.push_str(&source);
        if !source.ends_with('\n') {
            self.source.push('\n');
        }

        let mut diags = Diagnostics::new();
        let mut imports = Vec::new();
        for block in body.blocks() {
            let labels = block.labels();
            match block.identifier() {
                crate::blocks::STAGE_BLOCK => match labels {
                    [label] => match Stage::decode(label.as_str(), block.body()) {
                        Ok(stage) => self.stages.push(Arc::new(stage)),
                        Err(d) => diags.extend(d),
                    },
                    _ => diags.push(Diagnostic::error(
                        "invalid stage block",
                        "stage blocks take exactly one label: stage \"<id>\" { ... }",
                    )),
                },
                crate::blocks::DATA_BLOCK => match labels {
                    [provider, name] => {
                        match Data::decode(provider.as_str(), name.as_str(), block.body()) {
                            Ok(data) => self.data.push(Arc::new(data)),
                            Err(d) => diags.extend(d),
                        }
                    }
                    _ => diags.push(Diagnostic::error(
                        "invalid data block",
                        "data blocks take two labels: data \"<provider>\" \"<name>\" { ... }",
                    )),
                },
                crate::blocks::MACRO_BLOCK => match labels {
                    [label] => match Macro::decode(label.as_str(), block.body()) {
                        Ok(m) => self.macros.push(Arc::new(m)),
                        Err(d) => diags.extend(d),
                    },
                    _ => diags.push(Diagnostic::error(
                        "invalid macro block",
                        "macro blocks take exactly one label: macro \"<id>\" { ... }",
                    )),
                },
                crate::blocks::LOCALS_BLOCK => {
                    self.locals.extend(Local::decode_all(block.body()));
                }
                crate::blocks::IMPORT_BLOCK => match Import::decode(block.body()) {
                    Ok(import) => imports.push(import),
                    Err(d) => diags.extend(d),
                },
                // Pipeline settings; only the schema version lives here.
                "togomak" => {}
                other => diags.push(Diagnostic::error(
                    "unsupported block",
                    format!("unknown top-level block type \"{}\"", other),
                )),
            }
        }
        if diags.has_errors() {
            return Err(diags);
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for import in imports {
            let mut target = base.join(&import.source);
            if target.is_dir() {
                target = target.join(CONFIG_FILE_NAME);
            }
            self.merge_file(&target, visited)?;
        }
        Ok(())
    }

    /// Ids must be unique within a kind, across every merged file.
    fn check_duplicates(&self) -> Result<(), Diagnostics> {
        let mut diags = Diagnostics::new();
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.identifier()) {
                diags.push(Diagnostic::error(
                    "duplicate block",
                    format!("{} is defined more than once", stage.identifier()),
                ));
            }
        }
        for data in &self.data {
            if !seen.insert(data.identifier()) {
                diags.push(Diagnostic::error(
                    "duplicate block",
                    format!("{} is defined more than once", data.identifier()),
                ));
            }
        }
        for m in &self.macros {
            if !seen.insert(m.identifier()) {
                diags.push(Diagnostic::error(
                    "duplicate block",
                    format!("{} is defined more than once", m.identifier()),
                ));
            }
        }
        for local in &self.locals {
            if !seen.insert(local.identifier()) {
                diags.push(Diagnostic::error(
                    "duplicate block",
                    format!("{} is defined more than once", local.identifier()),
                ));
            }
        }
        if diags.has_errors() {
            Err(diags)
        } else {
            Ok(())
        }
    }

    /// Resolve a graph node key to its runnable.
    pub fn resolve(&self, node_key: &str) -> Option<RunnableRef> {
        if let Some(id) = node_key.strip_prefix("stage.") {
            // Stage ids may themselves contain dots, so match exactly.
            return self
                .stages
                .iter()
                .find(|s| s.id == id)
                .cloned()
                .map(RunnableRef::Stage);
        }
        if let Some(id) = node_key.strip_prefix("data.") {
            return self
                .data
                .iter()
                .find(|d| d.id() == id)
                .cloned()
                .map(RunnableRef::Data);
        }
        if let Some(id) = node_key.strip_prefix("macro.") {
            return self
                .macros
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .map(RunnableRef::Macro);
        }
        None
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id.clone()).collect()
    }

    pub fn local_names(&self) -> HashSet<String> {
        self.locals.iter().map(|l| l.name.clone()).collect()
    }

    /// Evaluate local blocks in dependency order and publish them under the
    /// `local` namespace. Locals may reference pre-seeded variables and other
    /// locals only.
    pub fn expand_locals(&self, run: &RunContext) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let names = self.local_names();

        let mut graph = DepGraph::new();
        for local in &self.locals {
            graph.add_node(local.identifier());
            for traversal in local.variables() {
                if let Some(resolver::Resolved::Local(name)) = resolver::resolve(&traversal) {
                    if names.contains(&name) {
                        graph.add_edge(local.identifier(), format!("local.{}", name));
                    } else {
                        diags.push(Diagnostic::error(
                            "unknown reference",
                            format!("{} references undefined local.{}", local.identifier(), name),
                        ));
                    }
                }
            }
        }
        if diags.has_errors() {
            return diags;
        }

        let layers = match graph.sorted_layers() {
            Ok(layers) => layers,
            Err(d) => return d,
        };
        for layer in layers {
            for key in layer {
                let Some(local) = self.locals.iter().find(|l| l.identifier() == key) else {
                    continue;
                };
                debug!(local = %key, "evaluating local");
                match evaluate(&run.ctx, &local.expr, &[]) {
                    Ok(value) => run.ctx.publish("local", &[&local.name], value),
                    Err(d) => {
                        diags.extend(d);
                        return diags;
                    }
                }
            }
        }
        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_simple_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "togomak.hcl",
            r#"
            stage "a" {
              script = "echo a"
            }
            stage "b" {
              depends_on = [stage.a]
              script     = "echo b"
            }
            "#,
        );
        let pipeline = Pipeline::load(&path).unwrap();
        assert_eq!(pipeline.stage_ids(), vec!["a", "b"]);
        assert!(pipeline.resolve("stage.a").is_some());
        assert!(pipeline.resolve("stage.zzz").is_none());
    }

    #[test]
    fn test_import_expansion_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "common.hcl",
            r#"
            stage "shared" {
              script = "echo shared"
            }
            "#,
        );
        let path = write_file(
            dir.path(),
            "togomak.hcl",
            r#"
            import {
              source = "./common.hcl"
            }
            stage "main" {
              script = "echo main"
            }
            "#,
        );
        let pipeline = Pipeline::load(&path).unwrap();
        assert_eq!(pipeline.stages.len(), 2);

        // A duplicate id across files is fatal.
        write_file(
            dir.path(),
            "common.hcl",
            r#"
            stage "main" {
              script = "echo dup"
            }
            "#,
        );
        let err = Pipeline::load(&path).unwrap_err();
        assert!(err.has_errors());
    }

    #[test]
    fn test_parse_error_is_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "togomak.hcl", "stage \"x\" {");
        let err = Pipeline::load(&path).unwrap_err();
        assert!(err.has_errors());
    }
}
