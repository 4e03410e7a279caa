//! Stage run filters.
//!
//! Positional arguments to `togomak run` whitelist stages. A bare `id`
//! whitelists the stage, `+id` additionally overrides its `if` condition,
//! `^id` skip-marks it, and `&id` runs it as daemon-only. When the filter is
//! non-empty, transitive prerequisites of whitelisted stages are promoted to
//! whitelisted so the selected stages can actually run.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterBehavior {
    /// Run if the condition allows it.
    Run,
    /// Run regardless of the `if` condition.
    Force,
    /// Never run.
    Skip,
    /// Run, but do not block pipeline completion on it.
    DaemonOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterItem {
    pub id: String,
    pub behavior: FilterBehavior,
}

impl FilterItem {
    pub fn parse(raw: &str) -> FilterItem {
        let (behavior, id) = if let Some(rest) = raw.strip_prefix('+').filter(|r| !r.is_empty()) {
            (FilterBehavior::Force, rest)
        } else if let Some(rest) = raw.strip_prefix('^').filter(|r| !r.is_empty()) {
            (FilterBehavior::Skip, rest)
        } else if let Some(rest) = raw.strip_prefix('&').filter(|r| !r.is_empty()) {
            (FilterBehavior::DaemonOnly, rest)
        } else {
            (FilterBehavior::Run, raw)
        };
        FilterItem {
            id: id.to_string(),
            behavior,
        }
    }
}

/// The decision for a single runnable after consulting the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDecision {
    pub ok: bool,
    /// The `if` condition is bypassed.
    pub overridden: bool,
    pub daemon_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilterList {
    items: Vec<FilterItem>,
    /// Stage node keys promoted because a whitelisted stage depends on them.
    promoted: HashSet<String>,
}

impl FilterList {
    pub fn parse<I: IntoIterator<Item = S>, S: AsRef<str>>(raw: I) -> FilterList {
        FilterList {
            items: raw.into_iter().map(|s| FilterItem::parse(s.as_ref())).collect(),
            promoted: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterItem> {
        self.items.iter()
    }

    pub fn promote(&mut self, node_key: String) {
        self.promoted.insert(node_key);
    }

    /// Decide whether the stage with the given id (and graph node key) runs.
    /// Non-stage runnables are never filtered out.
    pub fn decide(&self, id: &str, node_key: &str, is_stage: bool) -> FilterDecision {
        let mut decision = FilterDecision {
            ok: true,
            overridden: false,
            daemon_only: false,
        };
        if !is_stage {
            return decision;
        }
        let mut listed = false;
        for item in &self.items {
            if item.id != id {
                continue;
            }
            listed = true;
            match item.behavior {
                FilterBehavior::Run => {}
                FilterBehavior::Force => decision.overridden = true,
                FilterBehavior::Skip => decision.ok = false,
                FilterBehavior::DaemonOnly => decision.daemon_only = true,
            }
        }
        if !self.is_empty() && !listed && !self.promoted.contains(node_key) {
            decision.ok = false;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        assert_eq!(FilterItem::parse("build").behavior, FilterBehavior::Run);
        assert_eq!(FilterItem::parse("+build").behavior, FilterBehavior::Force);
        assert_eq!(FilterItem::parse("^build").behavior, FilterBehavior::Skip);
        assert_eq!(FilterItem::parse("&server").behavior, FilterBehavior::DaemonOnly);
        assert_eq!(FilterItem::parse("+build").id, "build");
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = FilterList::default();
        assert!(filter.decide("x", "stage.x", true).ok);
    }

    #[test]
    fn test_non_listed_stage_is_skipped() {
        let filter = FilterList::parse(["build"]);
        assert!(filter.decide("build", "stage.build", true).ok);
        assert!(!filter.decide("test", "stage.test", true).ok);
    }

    #[test]
    fn test_promotion_allows_prerequisite() {
        let mut filter = FilterList::parse(["deploy"]);
        filter.promote("stage.build".to_string());
        assert!(filter.decide("build", "stage.build", true).ok);
    }

    #[test]
    fn test_force_overrides() {
        let filter = FilterList::parse(["+build"]);
        let decision = filter.decide("build", "stage.build", true);
        assert!(decision.ok);
        assert!(decision.overridden);
    }

    #[test]
    fn test_data_blocks_never_filtered() {
        let filter = FilterList::parse(["build"]);
        assert!(filter.decide("git.repo", "data.git.repo", false).ok);
    }
}
