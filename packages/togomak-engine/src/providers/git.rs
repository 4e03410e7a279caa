//! The `git` data provider: shallow-clone a repository and expose metadata.
//!
//! The provider shells out to the `git` client. Published attributes:
//! `url`, `branch`, `tag`, `is_tag`, `ref`, `sha`, `last_tag`,
//! `commits_since_last_tag`, `files` and `destination`.

use super::DataProvider;
use crate::blocks::{Data, DataBody};
use crate::RunContext;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use togomak_expr::eval::evaluate;
use togomak_expr::{Diagnostic, Diagnostics, Value, ValueKind};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone)]
struct GitAuth {
    username: String,
    password: String,
    ssh_password: String,
    ssh_private_key: String,
}

#[derive(Debug, Default, Clone)]
struct GitConfig {
    url: String,
    tag: String,
    branch: String,
    commit: String,
    git_ref: String,
    destination: String,
    depth: i64,
    ca_bundle: String,
    files: Vec<String>,
    auth: GitAuth,
}

pub struct GitProvider;

impl GitProvider {
    fn decode(&self, body: &DataBody, run: &RunContext) -> Result<GitConfig, Diagnostics> {
        let mut cfg = GitConfig::default();
        let eval_str = |expr| -> Result<String, Diagnostics> {
            Ok(evaluate(&run.ctx, expr, &[])?.render())
        };

        match body.attr("url") {
            Some(expr) => cfg.url = eval_str(expr)?,
            None => {
                return Err(Diagnostics::from(Diagnostic::error(
                    "missing attribute",
                    "data.git requires a \"url\" attribute",
                )))
            }
        }
        if let Some(expr) = body.attr("tag") {
            cfg.tag = eval_str(expr)?;
        }
        if let Some(expr) = body.attr("branch") {
            cfg.branch = eval_str(expr)?;
        }
        if let Some(expr) = body.attr("commit") {
            cfg.commit = eval_str(expr)?;
        }
        if let Some(expr) = body.attr("ref") {
            cfg.git_ref = eval_str(expr)?;
        }
        if let Some(expr) = body.attr("destination") {
            cfg.destination = eval_str(expr)?;
        }
        if let Some(expr) = body.attr("ca_bundle") {
            cfg.ca_bundle = eval_str(expr)?;
        }
        if let Some(expr) = body.attr("depth") {
            let v = evaluate(&run.ctx, expr, &[])?;
            cfg.depth = v.as_i64().unwrap_or(0);
        }
        if let Some(expr) = body.attr("files") {
            let v = evaluate(&run.ctx, expr, &[])?;
            if let Some(items) = v.as_slice() {
                cfg.files = items.iter().map(Value::render).collect();
            }
        }
        if let Some(auth) = body.block("auth") {
            for (key, expr) in auth {
                let value = evaluate(&run.ctx, expr, &[])?.render();
                match key.as_str() {
                    "username" => cfg.auth.username = value,
                    "password" => cfg.auth.password = value,
                    "ssh_password" => cfg.auth.ssh_password = value,
                    "ssh_private_key" => cfg.auth.ssh_private_key = value,
                    other => {
                        return Err(Diagnostics::from(Diagnostic::error(
                            "unsupported attribute",
                            format!("data.git auth block has no attribute named \"{}\"", other),
                        )))
                    }
                }
            }
        }
        Ok(cfg)
    }

    fn resolve_destination(
        &self,
        cfg: &GitConfig,
        data: &Data,
        run: &RunContext,
        diags: &mut Diagnostics,
    ) -> PathBuf {
        if cfg.destination.is_empty() || cfg.destination == "memory" {
            if cfg.destination == "memory" {
                warn!("git provider destination is set to memory, this mode is deprecated, currently it writes to a temporary directory");
                diags.push(Diagnostic::warning(
                    "deprecated git destination",
                    "git provider destination is set to memory, this mode is deprecated, currently it writes to a temporary directory",
                ));
            }
            run.tempdir.join(self.identifier()).join(&data.name)
        } else {
            PathBuf::from(&cfg.destination)
        }
    }
}

#[async_trait]
impl DataProvider for GitProvider {
    fn name(&self) -> &'static str {
        "git"
    }

    fn schema(&self) -> &'static [&'static str] {
        &[
            "url",
            "tag",
            "branch",
            "commit",
            "ref",
            "destination",
            "depth",
            "ca_bundle",
            "files",
        ]
    }

    async fn evaluate(
        &self,
        data: &Data,
        run: &RunContext,
    ) -> Result<(String, IndexMap<String, Value>, Diagnostics), Diagnostics> {
        let mut diags = Diagnostics::new();
        let cfg = self.decode(&data.body, run)?;
        let destination = self.resolve_destination(&cfg, data, run, &mut diags);

        info!("pulling git repo {}", data.identifier());

        let mut clone_env: Vec<(String, String)> = Vec::new();
        if !cfg.ca_bundle.is_empty() {
            let bundle_path = run.tempdir.join(format!("{}.ca.pem", data.name));
            if let Err(e) = std::fs::write(&bundle_path, &cfg.ca_bundle) {
                return Err(join(diags, Diagnostic::error(
                    "failed to write ca bundle",
                    e.to_string(),
                )));
            }
            clone_env.push((
                "GIT_SSL_CAINFO".to_string(),
                bundle_path.to_string_lossy().into_owned(),
            ));
        }
        if !cfg.auth.ssh_password.is_empty() || !cfg.auth.ssh_private_key.is_empty() {
            diags.push(Diagnostic::warning(
                "unsupported auth",
                "ssh credentials are not supported by the git client integration; use an ssh agent instead",
            ));
        }

        let url = authenticated_url(&cfg);

        // Shallow clone at the first non-empty of tag/branch/ref.
        let checkout_ref = if !cfg.tag.is_empty() {
            cfg.tag.clone()
        } else if !cfg.branch.is_empty() {
            cfg.branch.clone()
        } else {
            cfg.git_ref.clone()
        };
        let mut clone_args: Vec<String> =
            vec!["clone".into(), "--quiet".into(), "--no-single-branch".into()];
        if cfg.depth > 0 {
            clone_args.push("--depth".into());
            clone_args.push(cfg.depth.to_string());
        }
        if !checkout_ref.is_empty() {
            clone_args.push("--branch".into());
            clone_args.push(checkout_ref.clone());
        }
        clone_args.push(url);
        clone_args.push(destination.to_string_lossy().into_owned());

        debug!("cloning git repo to {}", destination.display());
        if let Err(e) = git(None, &clone_args, &clone_env).await {
            return Err(join(diags, Diagnostic::error("failed to clone git repo", e)));
        }

        if !cfg.commit.is_empty() {
            if let Err(e) = git(Some(&destination), &["checkout".into(), cfg.commit.clone()], &[])
                .await
            {
                return Err(join(diags, Diagnostic::error("failed to checkout commit", e)));
            }
        }

        let branch = match git(
            Some(&destination),
            &["symbolic-ref".into(), "--short".into(), "-q".into(), "HEAD".into()],
            &[],
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                diags.push(Diagnostic::warning("failed to get git branch", e));
                String::new()
            }
        };

        let last_tag = git(
            Some(&destination),
            &["describe".into(), "--tags".into(), "--abbrev=0".into()],
            &[],
        )
        .await
        .unwrap_or_default();

        let commits_since_last_tag = if last_tag.is_empty() {
            Value::Null(ValueKind::Number)
        } else {
            match git(
                Some(&destination),
                &[
                    "rev-list".into(),
                    format!("{}..HEAD", last_tag),
                    "--count".into(),
                ],
                &[],
            )
            .await
            {
                Ok(out) => out
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or(Value::Null(ValueKind::Number)),
                Err(e) => {
                    diags.push(Diagnostic::warning(
                        "failed to get commits since last tag",
                        e,
                    ));
                    Value::Null(ValueKind::Number)
                }
            }
        };

        let sha = match git(Some(&destination), &["rev-parse".into(), "HEAD".into()], &[]).await {
            Ok(out) => out,
            Err(e) => return Err(join(diags, Diagnostic::error("failed to get git sha", e))),
        };

        let head_ref = match git(
            Some(&destination),
            &["symbolic-ref".into(), "-q".into(), "HEAD".into()],
            &[],
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                diags.push(Diagnostic::warning("failed to resolve git reference", e));
                "HEAD".to_string()
            }
        };

        let is_tag = git(
            Some(&destination),
            &[
                "describe".into(),
                "--exact-match".into(),
                "--tags".into(),
                "HEAD".into(),
            ],
            &[],
        )
        .await
        .is_ok();

        // Whitelisted files; missing entries are silently omitted.
        let mut files: IndexMap<String, Value> = IndexMap::new();
        for file in &cfg.files {
            let path = destination.join(file);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    files.insert(file.clone(), Value::from(content));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(join(diags, Diagnostic::error(
                        "failed to read file",
                        format!("{}: {}", path.display(), e),
                    )))
                }
            }
        }
        let files_value = if files.is_empty() {
            Value::Null(ValueKind::Map)
        } else {
            Value::Map(files)
        };

        let mut attributes = IndexMap::new();
        attributes.insert("url".to_string(), Value::from(cfg.url.as_str()));
        attributes.insert("branch".to_string(), Value::from(branch));
        attributes.insert("tag".to_string(), Value::from(cfg.tag.as_str()));
        attributes.insert("is_tag".to_string(), Value::Bool(is_tag));
        attributes.insert("ref".to_string(), Value::from(head_ref));
        attributes.insert("sha".to_string(), Value::from(sha));
        attributes.insert("last_tag".to_string(), Value::from(last_tag));
        attributes.insert("commits_since_last_tag".to_string(), commits_since_last_tag);
        attributes.insert("files".to_string(), files_value);
        attributes.insert(
            "destination".to_string(),
            Value::from(destination.to_string_lossy().as_ref()),
        );
        Ok((String::new(), attributes, diags))
    }
}

/// Embed basic-auth credentials into an https remote.
fn authenticated_url(cfg: &GitConfig) -> String {
    if !cfg.auth.username.is_empty() && !cfg.auth.password.is_empty() {
        if let Some(rest) = cfg.url.strip_prefix("https://") {
            return format!("https://{}:{}@{}", cfg.auth.username, cfg.auth.password, rest);
        }
    }
    cfg.url.clone()
}

/// Run a git command, optionally inside a repository.
async fn git(
    repo: Option<&Path>,
    args: &[String],
    env: &[(String, String)],
) -> Result<String, String> {
    let mut cmd = tokio::process::Command::new("git");
    if let Some(repo) = repo {
        cmd.arg("-C").arg(repo);
    }
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let output = cmd
        .output()
        .await
        .map_err(|e| format!("could not invoke git: {}", e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

fn join(mut diags: Diagnostics, diag: Diagnostic) -> Diagnostics {
    diags.push(diag);
    diags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_url() {
        let mut cfg = GitConfig {
            url: "https://example.com/repo.git".to_string(),
            ..Default::default()
        };
        assert_eq!(authenticated_url(&cfg), "https://example.com/repo.git");
        cfg.auth.username = "u".to_string();
        cfg.auth.password = "p".to_string();
        assert_eq!(authenticated_url(&cfg), "https://u:p@example.com/repo.git");
    }
}
