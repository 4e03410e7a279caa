//! Dependency graph with layered topological sort.
//!
//! Nodes are block addresses (`stage.build`, `data.git.repo`, `macro.lint`).
//! An edge runs prerequisite → dependent. Layer L contains every node whose
//! prerequisites all sit in layers < L; members of a layer may execute in
//! parallel and their relative order is undefined.

use crate::pipeline::Pipeline;
use crate::resolver::{self, Resolved};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use togomak_expr::{Diagnostic, Diagnostics};

#[derive(Debug, Default, Clone)]
pub struct DepGraph {
    nodes: BTreeSet<String>,
    /// dependent -> prerequisites
    prerequisites: BTreeMap<String, BTreeSet<String>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, key: impl Into<String>) {
        self.nodes.insert(key.into());
    }

    pub fn add_edge(&mut self, dependent: impl Into<String>, prerequisite: impl Into<String>) {
        let dependent = dependent.into();
        let prerequisite = prerequisite.into();
        self.nodes.insert(dependent.clone());
        self.nodes.insert(prerequisite.clone());
        self.prerequisites
            .entry(dependent)
            .or_default()
            .insert(prerequisite);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains(key)
    }

    pub fn prerequisites_of(&self, key: &str) -> impl Iterator<Item = &String> {
        self.prerequisites.get(key).into_iter().flatten()
    }

    /// All transitive prerequisites of `key`.
    pub fn transitive_prerequisites(&self, key: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<&String> = self.prerequisites_of(key).collect();
        while let Some(node) = stack.pop() {
            if out.insert(node.clone()) {
                stack.extend(self.prerequisites_of(node));
            }
        }
        out
    }

    /// Topologically sort into parallel layers. A cycle produces one error
    /// diagnostic naming the ids involved.
    pub fn sorted_layers(&self) -> Result<Vec<Vec<String>>, Diagnostics> {
        let mut in_degree: BTreeMap<&String, usize> =
            self.nodes.iter().map(|node| (node, 0)).collect();
        for (dependent, prerequisites) in &self.prerequisites {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree = prerequisites.len();
            }
        }

        let mut layers = Vec::new();
        let mut processed: HashSet<&String> = HashSet::new();
        while processed.len() < self.nodes.len() {
            let ready: Vec<&String> = in_degree
                .iter()
                .filter(|(node, degree)| **degree == 0 && !processed.contains(*node))
                .map(|(node, _)| *node)
                .collect();

            if ready.is_empty() {
                let stuck: Vec<String> = self
                    .nodes
                    .iter()
                    .filter(|node| !processed.contains(node))
                    .cloned()
                    .collect();
                return Err(Diagnostics::from(Diagnostic::error(
                    "dependency cycle detected",
                    format!("these blocks depend on each other: {}", stuck.join(", ")),
                )));
            }

            for node in &ready {
                processed.insert(node);
                in_degree.remove(node);
                for (dependent, prerequisites) in &self.prerequisites {
                    if prerequisites.contains(node.as_str()) {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
            layers.push(ready.into_iter().cloned().collect());
        }
        Ok(layers)
    }

    /// Human-readable execution plan, for verbose logging.
    pub fn execution_plan(&self) -> Result<String, Diagnostics> {
        Ok(self
            .sorted_layers()?
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                if layer.len() > 1 {
                    format!("layer {}: {} (parallel)", i + 1, layer.join(", "))
                } else {
                    format!("layer {}: {}", i + 1, layer[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Build the main run graph: every stage, data and macro block is a node;
/// references found in expressions plus explicit `depends_on` entries are
/// edges. Locals must already be expanded. References to unknown blocks are
/// fatal.
pub fn build(pipeline: &Pipeline) -> Result<DepGraph, Diagnostics> {
    let mut graph = DepGraph::new();
    let mut diags = Diagnostics::new();
    let locals = pipeline.local_names();

    let blocks: Vec<(String, Vec<togomak_expr::Traversal>)> = pipeline
        .stages
        .iter()
        .map(|s| (s.identifier(), s.variables()))
        .chain(pipeline.data.iter().map(|d| (d.identifier(), d.variables())))
        .chain(pipeline.macros.iter().map(|m| (m.identifier(), m.variables())))
        .collect();

    for (key, _) in &blocks {
        graph.add_node(key.clone());
    }

    for (key, traversals) in &blocks {
        for traversal in traversals {
            let Some(resolved) = resolver::resolve(traversal) else {
                continue;
            };
            match &resolved {
                Resolved::Local(name) => {
                    // Locals were folded into the context before graph
                    // construction; only validate the reference.
                    if !locals.contains(name) {
                        diags.push(Diagnostic::error(
                            "unknown reference",
                            format!("{} references undefined local.{}", key, name),
                        ));
                    }
                }
                _ => {
                    let target = resolved.node_key();
                    if target == *key {
                        // Self references (e.g. a stage echoing its own
                        // published outputs) do not create edges.
                        continue;
                    }
                    if !graph.contains(&target) {
                        diags.push(Diagnostic::error(
                            "unknown reference",
                            format!("{} references {}, which does not exist", key, target),
                        ));
                        continue;
                    }
                    graph.add_edge(key.clone(), target);
                }
            }
        }
    }

    if diags.has_errors() {
        Err(diags)
    } else {
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_respect_dependencies() {
        let mut graph = DepGraph::new();
        graph.add_edge("stage.b", "stage.a");
        graph.add_edge("stage.c", "stage.a");
        graph.add_edge("stage.d", "stage.b");
        graph.add_edge("stage.d", "stage.c");

        let layers = graph.sorted_layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["stage.a"]);
        assert_eq!(layers[1].len(), 2);
        assert_eq!(layers[2], vec!["stage.d"]);
    }

    #[test]
    fn test_cycle_is_one_diagnostic_naming_ids() {
        let mut graph = DepGraph::new();
        graph.add_edge("stage.a", "stage.b");
        graph.add_edge("stage.b", "stage.a");

        let err = graph.sorted_layers().unwrap_err();
        assert_eq!(err.error_count(), 1);
        let text = err.to_string();
        assert!(text.contains("stage.a"));
        assert!(text.contains("stage.b"));
    }

    #[test]
    fn test_independent_nodes_share_a_layer() {
        let mut graph = DepGraph::new();
        graph.add_node("stage.x");
        graph.add_node("stage.y");
        let layers = graph.sorted_layers().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 2);
    }

    #[test]
    fn test_transitive_prerequisites() {
        let mut graph = DepGraph::new();
        graph.add_edge("stage.c", "stage.b");
        graph.add_edge("stage.b", "stage.a");
        let prereqs = graph.transitive_prerequisites("stage.c");
        assert!(prereqs.contains("stage.a"));
        assert!(prereqs.contains("stage.b"));
        assert!(!prereqs.contains("stage.c"));
    }

    #[test]
    fn test_build_reports_unknown_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("togomak.hcl");
        std::fs::write(
            &path,
            r#"
            stage "a" {
              depends_on = [stage.ghost]
              script     = "true"
            }
            "#,
        )
        .unwrap();
        let pipeline = crate::Pipeline::load(&path).unwrap();
        let err = build(&pipeline).unwrap_err();
        assert!(err.to_string().contains("stage.ghost"));
    }

    #[test]
    fn test_build_creates_edges_from_expressions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("togomak.hcl");
        std::fs::write(
            &path,
            r#"
            stage "a" {
              script = "echo hi"
            }
            stage "b" {
              script = "echo ${stage.a.output}"
            }
            "#,
        )
        .unwrap();
        let pipeline = crate::Pipeline::load(&path).unwrap();
        let graph = build(&pipeline).unwrap();
        let layers = graph.sorted_layers().unwrap();
        assert_eq!(layers[0], vec!["stage.a"]);
        assert_eq!(layers[1], vec!["stage.b"]);
    }
}
