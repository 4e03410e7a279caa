//! Command implementations.

use crate::cli::GlobalArgs;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use togomak_engine::filter::FilterList;
use togomak_engine::pipeline::{CONFIG_FILE_NAME, PARAM_ENV_PREFIX};
use togomak_engine::{Behavior, Child, Config, Orchestrator, Paths};
use tracing::{error, trace};

const CACHE_DIR: &str = ".togomak";

/// Assemble the engine configuration from the CLI flags.
pub fn build_config(global: &GlobalArgs, stages: &[String]) -> Result<Config> {
    let owd = std::env::current_dir().context("cannot determine working directory")?;
    let dir = global.dir.clone().unwrap_or_else(|| owd.clone());
    let pipeline = match &global.file {
        Some(file) => file.clone(),
        None => dir.join(CONFIG_FILE_NAME),
    };

    // Mirror --parent-param entries into the environment so the engine's
    // child-mode seeding sees them alongside inherited variables.
    for entry in &global.parent_params {
        if let Some((name, value)) = entry.split_once('=') {
            std::env::set_var(format!("{}{}", PARAM_ENV_PREFIX, name), value);
        }
    }

    let unattended = global.unattended
        || global.ci
        || std::env::var("CI").is_ok_and(|v| !v.is_empty() && v != "false")
        || !std::io::IsTerminal::is_terminal(&std::io::stdin());

    Ok(Config {
        behavior: Behavior {
            unattended,
            ci: global.ci || std::env::var("CI").is_ok_and(|v| !v.is_empty() && v != "false"),
            dry_run: global.dry_run,
            child: Child {
                enabled: global.child,
                parent: global.parent.clone(),
                parent_params: global.parent_params.clone(),
            },
        },
        paths: Paths {
            pipeline,
            cwd: dir,
            owd,
        },
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        user: std::env::var("USER").unwrap_or_default(),
        filter: FilterList::parse(stages),
    })
}

/// `togomak run [stage...]`
pub async fn run(global: &GlobalArgs, stages: &[String]) -> Result<i32> {
    let config = build_config(global, stages)?;
    let orchestrator = Orchestrator::new(config)?;
    Ok(orchestrator.perform().await)
}

/// `togomak list`
pub fn list(global: &GlobalArgs) -> Result<i32> {
    let config = build_config(global, &[])?;
    match togomak_engine::scheduler::load_pipeline(&config) {
        Ok(pipeline) => {
            for id in pipeline.stage_ids() {
                println!("{}", id);
            }
            Ok(0)
        }
        Err(diags) => {
            for diag in &diags {
                error!("{}", diag);
            }
            Ok(1)
        }
    }
}

/// `togomak init`
pub fn init(global: &GlobalArgs) -> Result<i32> {
    let owd = std::env::current_dir()?;
    let dir = global.dir.clone().unwrap_or(owd);
    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        bail!("{} already exists, refusing to overwrite", path.display());
    }
    std::fs::create_dir_all(&dir)?;
    std::fs::write(
        &path,
        r#"togomak {
  version = 2
}

stage "hello" {
  script = "echo hello world"
}
"#,
    )?;
    println!("created {}", path.display());
    Ok(0)
}

/// `togomak fmt [--check] [--recursive]`
pub fn fmt(global: &GlobalArgs, check: bool, recursive: bool) -> Result<i32> {
    let owd = std::env::current_dir()?;
    let dir = global.dir.clone().unwrap_or(owd);

    let mut targets: Vec<PathBuf> = Vec::new();
    if recursive {
        for entry in walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "hcl")
            {
                targets.push(entry.path().to_path_buf());
            }
        }
    } else {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "hcl") {
                targets.push(path);
            }
        }
    }

    let mut needs_rewrite = Vec::new();
    for path in targets {
        trace!("formatting {}", path.display());
        let formatted = canonicalize_file(&path)
            .with_context(|| format!("cannot format {}", path.display()))?;
        let current = std::fs::read_to_string(&path)?;
        if formatted != current {
            println!("{}", path.display());
            needs_rewrite.push((path, formatted));
        }
    }
    if check {
        return Ok(if needs_rewrite.is_empty() { 0 } else { 1 });
    }
    for (path, formatted) in needs_rewrite {
        std::fs::write(&path, formatted)?;
    }
    Ok(0)
}

/// Parse and re-render a pipeline file in canonical form.
fn canonicalize_file(path: &Path) -> Result<String> {
    let source = std::fs::read_to_string(path)?;
    let body: hcl::Body = hcl::parse(&source).map_err(|e| anyhow::anyhow!("{}", e))?;
    hcl::to_string(&body).map_err(|e| anyhow::anyhow!("{}", e))
}

/// `togomak cache clean [--recursive]`
pub fn cache_clean(global: &GlobalArgs, recursive: bool) -> Result<i32> {
    let owd = std::env::current_dir()?;
    let dir = global.dir.clone().unwrap_or(owd);

    if recursive {
        for entry in walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() && entry.file_name() == CACHE_DIR {
                trace!("removing {}", entry.path().display());
                std::fs::remove_dir_all(entry.path())?;
            }
        }
    } else {
        let cache = dir.join(CACHE_DIR);
        if cache.is_dir() {
            std::fs::remove_dir_all(&cache)?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalArgs {
        GlobalArgs {
            file: None,
            dir: None,
            verbose: 0,
            unattended: true,
            ci: false,
            dry_run: false,
            json_log: false,
            child: false,
            parent: None,
            parent_params: Vec::new(),
        }
    }

    #[test]
    fn test_build_config_defaults() {
        let config = build_config(&global(), &["a".to_string()]).unwrap();
        assert!(config.behavior.unattended);
        assert!(!config.filter.is_empty());
        assert!(config.paths.pipeline.ends_with(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = global();
        g.dir = Some(dir.path().to_path_buf());
        assert_eq!(init(&g).unwrap(), 0);
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert!(init(&g).is_err());
    }

    #[test]
    fn test_cache_clean() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".togomak")).unwrap();
        let mut g = global();
        g.dir = Some(dir.path().to_path_buf());
        assert_eq!(cache_clean(&g, false).unwrap(), 0);
        assert!(!dir.path().join(".togomak").exists());
    }
}
