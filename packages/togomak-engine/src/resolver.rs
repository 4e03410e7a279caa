//! Traversal resolution: mapping expression references to block addresses.
//!
//! A traversal whose root names a block kind resolves to that block's graph
//! node. Anything else (`togomak`, `pipeline`, `this`, `each`, `output`,
//! `param`, ...) is a context variable, not a block.

use togomak_expr::Traversal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Stage(String),
    /// Data ids are two-segment: provider, then name.
    Data(String, String),
    Macro(String),
    Local(String),
}

impl Resolved {
    pub fn node_key(&self) -> String {
        match self {
            Resolved::Stage(id) => format!("stage.{}", id),
            Resolved::Data(provider, name) => format!("data.{}.{}", provider, name),
            Resolved::Macro(id) => format!("macro.{}", id),
            Resolved::Local(name) => format!("local.{}", name),
        }
    }
}

/// Resolve a traversal to a block address, or `None` when the root is a
/// plain context variable.
pub fn resolve(traversal: &Traversal) -> Option<Resolved> {
    let mut attrs = traversal.attrs();
    match traversal.root.as_str() {
        "stage" => attrs.next().map(|id| Resolved::Stage(id.to_string())),
        "data" => {
            let provider = attrs.next()?;
            let name = attrs.next()?;
            Some(Resolved::Data(provider.to_string(), name.to_string()))
        }
        "macro" => attrs.next().map(|id| Resolved::Macro(id.to_string())),
        "local" => attrs.next().map(|name| Resolved::Local(name.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use togomak_expr::{TraversalStep, Value};

    fn traversal(root: &str, attrs: &[&str]) -> Traversal {
        let mut t = Traversal::root(root);
        for attr in attrs {
            t.steps.push(TraversalStep::Attr(attr.to_string()));
        }
        t
    }

    #[test]
    fn test_resolve_stage() {
        let r = resolve(&traversal("stage", &["build", "output"])).unwrap();
        assert_eq!(r, Resolved::Stage("build".to_string()));
        assert_eq!(r.node_key(), "stage.build");
    }

    #[test]
    fn test_resolve_data_two_segments() {
        let r = resolve(&traversal("data", &["git", "repo", "sha"])).unwrap();
        assert_eq!(r.node_key(), "data.git.repo");
        // A bare `data.git` is not a complete address.
        assert_eq!(resolve(&traversal("data", &["git"])), None);
    }

    #[test]
    fn test_context_roots_resolve_to_nothing() {
        for root in ["togomak", "pipeline", "this", "each", "output", "param", "ansi"] {
            assert_eq!(resolve(&traversal(root, &["x"])), None);
        }
    }

    #[test]
    fn test_index_steps_are_ignored_for_addressing() {
        let mut t = traversal("stage", &[]);
        t.steps.push(TraversalStep::Index(Value::from(0)));
        t.steps.push(TraversalStep::Attr("build".to_string()));
        // The first attribute step names the block, wherever it sits.
        assert_eq!(resolve(&t), Some(Resolved::Stage("build".to_string())));
    }
}
