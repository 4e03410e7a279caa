//! Run configuration assembled by the CLI.

use crate::filter::FilterList;
use std::path::PathBuf;

/// Behavioral switches: interactivity, CI mode, dry runs, child invocations.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Never prompt or wait for user input.
    pub unattended: bool,
    pub ci: bool,
    pub dry_run: bool,
    pub child: Child,
}

/// Set when this process is a recursive invocation started by a stage that
/// uses a directory macro.
#[derive(Debug, Clone, Default)]
pub struct Child {
    pub enabled: bool,
    pub parent: Option<String>,
    pub parent_params: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Paths {
    /// The pipeline file.
    pub pipeline: PathBuf,
    /// Working directory for stages and relative paths.
    pub cwd: PathBuf,
    /// The directory togomak was invoked from.
    pub owd: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Paths {
            pipeline: cwd.join(crate::pipeline::CONFIG_FILE_NAME),
            owd: cwd.clone(),
            cwd,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub behavior: Behavior,
    pub paths: Paths,
    pub hostname: String,
    pub user: String,
    pub filter: FilterList,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            behavior: Behavior::default(),
            paths: Paths::default(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            user: std::env::var("USER").unwrap_or_default(),
            filter: FilterList::default(),
        }
    }
}
