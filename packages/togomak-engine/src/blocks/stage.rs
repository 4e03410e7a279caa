//! The `stage` block.

use super::{literal_bool, literal_int, literal_string};
use std::sync::atomic::{AtomicBool, AtomicI32};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use togomak_expr::{lower::lower, Diagnostic, Diagnostics, Expr, Traversal};

#[derive(Debug, Clone)]
pub struct StageUse {
    /// Reference to a `macro` block, or an expression yielding a directory
    /// (or deprecated `.hcl` file) for a sub-pipeline.
    pub macro_ref: Expr,
    pub parameters: Option<Expr>,
    pub chdir: Option<Expr>,
}

#[derive(Debug, Clone, Default)]
pub struct StageRetry {
    pub enabled: bool,
    pub attempts: i64,
    pub exponential_backoff: bool,
    /// Seconds.
    pub min_backoff: i64,
    pub max_backoff: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StageDaemon {
    pub enabled: bool,
    /// Seconds; 0 disables the timeout.
    pub timeout: i64,
    pub lifecycle: Option<DaemonLifecycle>,
}

#[derive(Debug, Clone)]
pub struct DaemonLifecycle {
    /// References to runnables whose completion stops this daemon.
    pub stop_when_complete: Expr,
}

#[derive(Debug, Clone)]
pub struct StageEnv {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct ContainerVolume {
    pub source: Expr,
    pub destination: Expr,
}

#[derive(Debug, Clone)]
pub struct ContainerPort {
    pub host: Option<Expr>,
    pub container_port: Expr,
    pub port: Expr,
}

#[derive(Debug, Clone)]
pub struct StageContainer {
    pub image: Expr,
    pub entrypoint: Option<Expr>,
    pub stdin: bool,
    pub volumes: Vec<ContainerVolume>,
    pub ports: Vec<ContainerPort>,
}

/// Mutable per-run state. The spawned process (or container) is exclusively
/// owned by the stage while running; terminate/kill reach it through here.
#[derive(Debug, Default)]
pub struct StageState {
    pub terminated: AtomicBool,
    /// Child process id, 0 when no process is running.
    pub pid: AtomicI32,
    pub container_id: Mutex<Option<String>>,
    pub terminate_token: CancellationToken,
    pub kill_token: CancellationToken,
}

#[derive(Debug)]
pub struct Stage {
    pub id: String,
    pub name: Option<String>,
    pub depends_on: Option<Expr>,
    pub condition: Option<Expr>,
    pub for_each: Option<Expr>,
    pub use_: Option<StageUse>,
    pub daemon: Option<StageDaemon>,
    pub retry: Option<StageRetry>,
    pub dir: Option<Expr>,
    pub script: Option<Expr>,
    pub shell: Option<Expr>,
    pub args: Option<Expr>,
    pub container: Option<StageContainer>,
    pub env: Vec<StageEnv>,
    pub pre_hook: Vec<Stage>,
    pub post_hook: Vec<Stage>,
    /// Traversals contributed by an inline macro template's `depends_on`;
    /// they create graph edges but are never re-evaluated.
    pub macro_depends_on: Vec<Traversal>,
    pub state: StageState,
}

impl Clone for Stage {
    fn clone(&self) -> Self {
        Stage {
            id: self.id.clone(),
            name: self.name.clone(),
            depends_on: self.depends_on.clone(),
            condition: self.condition.clone(),
            for_each: self.for_each.clone(),
            use_: self.use_.clone(),
            daemon: self.daemon.clone(),
            retry: self.retry.clone(),
            dir: self.dir.clone(),
            script: self.script.clone(),
            shell: self.shell.clone(),
            args: self.args.clone(),
            container: self.container.clone(),
            env: self.env.clone(),
            pre_hook: self.pre_hook.clone(),
            post_hook: self.post_hook.clone(),
            macro_depends_on: self.macro_depends_on.clone(),
            // Run state never travels with a clone.
            state: StageState::default(),
        }
    }
}

impl Stage {
    pub fn is_daemon(&self) -> bool {
        self.daemon.as_ref().is_some_and(|d| d.enabled)
    }

    pub fn identifier(&self) -> String {
        format!("stage.{}", self.id)
    }

    /// Decode a `stage "<id>" { ... }` body.
    pub fn decode(id: &str, body: &hcl::Body) -> Result<Stage, Diagnostics> {
        let mut diags = Diagnostics::new();
        let mut stage = Stage {
            id: id.to_string(),
            name: None,
            depends_on: None,
            condition: None,
            for_each: None,
            use_: None,
            daemon: None,
            retry: None,
            dir: None,
            script: None,
            shell: None,
            args: None,
            container: None,
            env: Vec::new(),
            pre_hook: Vec::new(),
            post_hook: Vec::new(),
            macro_depends_on: Vec::new(),
            state: StageState::default(),
        };

        for attr in body.attributes() {
            let expr = lower(attr.expr());
            match attr.key() {
                "name" => match literal_string(&expr, "stage name") {
                    Ok(name) => stage.name = Some(name),
                    Err(d) => diags.extend(d),
                },
                "depends_on" => stage.depends_on = Some(expr),
                "if" => stage.condition = Some(expr),
                "for_each" => stage.for_each = Some(expr),
                "dir" => stage.dir = Some(expr),
                "script" => stage.script = Some(expr),
                "shell" => stage.shell = Some(expr),
                "args" => stage.args = Some(expr),
                other => diags.push(Diagnostic::error(
                    "unsupported attribute",
                    format!("stage.{} has no attribute named \"{}\"", id, other),
                )),
            }
        }

        for block in body.blocks() {
            match block.identifier() {
                "use" => match decode_use(block.body()) {
                    Ok(use_) => stage.use_ = Some(use_),
                    Err(d) => diags.extend(d),
                },
                "daemon" => match decode_daemon(block.body()) {
                    Ok(daemon) => stage.daemon = Some(daemon),
                    Err(d) => diags.extend(d),
                },
                "retry" => match decode_retry(block.body()) {
                    Ok(retry) => stage.retry = Some(retry),
                    Err(d) => diags.extend(d),
                },
                "container" => match decode_container(id, block.body()) {
                    Ok(container) => stage.container = Some(container),
                    Err(d) => diags.extend(d),
                },
                "env" => match decode_env(id, block.body()) {
                    Ok(env) => stage.env.push(env),
                    Err(d) => diags.extend(d),
                },
                "pre_hook" => match decode_hook(id, block.body()) {
                    Ok(hook) => stage.pre_hook.push(hook),
                    Err(d) => diags.extend(d),
                },
                "post_hook" => match decode_hook(id, block.body()) {
                    Ok(hook) => stage.post_hook.push(hook),
                    Err(d) => diags.extend(d),
                },
                other => diags.push(Diagnostic::error(
                    "unsupported block",
                    format!("stage.{} has no block type named \"{}\"", id, other),
                )),
            }
        }

        if diags.has_errors() {
            Err(diags)
        } else {
            Ok(stage)
        }
    }

    /// Every traversal this stage's expressions reference, including hooks,
    /// container configuration and the daemon lifecycle. Together with
    /// `depends_on` these form the stage's inbound edges.
    pub fn variables(&self) -> Vec<Traversal> {
        let mut out = Vec::new();
        let exprs = [
            &self.depends_on,
            &self.condition,
            &self.for_each,
            &self.dir,
            &self.script,
            &self.shell,
            &self.args,
        ];
        for expr in exprs.into_iter().flatten() {
            out.extend(expr.variables());
        }
        if let Some(use_) = &self.use_ {
            out.extend(use_.macro_ref.variables());
            if let Some(parameters) = &use_.parameters {
                out.extend(parameters.variables());
            }
        }
        for env in &self.env {
            out.extend(env.value.variables());
        }
        if let Some(container) = &self.container {
            out.extend(container.image.variables());
            if let Some(entrypoint) = &container.entrypoint {
                out.extend(entrypoint.variables());
            }
            for volume in &container.volumes {
                out.extend(volume.source.variables());
                out.extend(volume.destination.variables());
            }
            for port in &container.ports {
                if let Some(host) = &port.host {
                    out.extend(host.variables());
                }
                out.extend(port.container_port.variables());
                out.extend(port.port.variables());
            }
        }
        // Daemon lifecycle references intentionally contribute no edges: a
        // daemon watching a stage that depends on it would otherwise be a
        // cycle. The scheduler resolves them at dispatch time instead.
        for hook in self.pre_hook.iter().chain(&self.post_hook) {
            out.extend(hook.variables());
        }
        out.extend(self.macro_depends_on.clone());
        out
    }
}

fn decode_use(body: &hcl::Body) -> Result<StageUse, Diagnostics> {
    let mut macro_ref = None;
    let mut parameters = None;
    let mut chdir = None;
    let mut diags = Diagnostics::new();
    for attr in body.attributes() {
        let expr = lower(attr.expr());
        match attr.key() {
            "macro" => macro_ref = Some(expr),
            "parameters" => parameters = Some(expr),
            "chdir" => chdir = Some(expr),
            other => diags.push(Diagnostic::error(
                "unsupported attribute",
                format!("use block has no attribute named \"{}\"", other),
            )),
        }
    }
    let Some(macro_ref) = macro_ref else {
        diags.push(Diagnostic::error(
            "missing attribute",
            "use block requires a \"macro\" attribute",
        ));
        return Err(diags);
    };
    if diags.has_errors() {
        return Err(diags);
    }
    Ok(StageUse {
        macro_ref,
        parameters,
        chdir,
    })
}

fn decode_daemon(body: &hcl::Body) -> Result<StageDaemon, Diagnostics> {
    let mut daemon = StageDaemon::default();
    let mut diags = Diagnostics::new();
    for attr in body.attributes() {
        let expr = lower(attr.expr());
        match attr.key() {
            "enabled" => daemon.enabled = literal_bool(&expr, "daemon.enabled")?,
            "timeout" => daemon.timeout = literal_int(&expr, "daemon.timeout")?,
            other => diags.push(Diagnostic::error(
                "unsupported attribute",
                format!("daemon block has no attribute named \"{}\"", other),
            )),
        }
    }
    for block in body.blocks() {
        match block.identifier() {
            "lifecycle" => {
                for attr in block.body().attributes() {
                    match attr.key() {
                        "stop_when_complete" => {
                            daemon.lifecycle = Some(DaemonLifecycle {
                                stop_when_complete: lower(attr.expr()),
                            })
                        }
                        other => diags.push(Diagnostic::error(
                            "unsupported attribute",
                            format!("lifecycle block has no attribute named \"{}\"", other),
                        )),
                    }
                }
            }
            other => diags.push(Diagnostic::error(
                "unsupported block",
                format!("daemon block has no block type named \"{}\"", other),
            )),
        }
    }
    if diags.has_errors() {
        Err(diags)
    } else {
        Ok(daemon)
    }
}

fn decode_retry(body: &hcl::Body) -> Result<StageRetry, Diagnostics> {
    let mut retry = StageRetry::default();
    let mut diags = Diagnostics::new();
    for attr in body.attributes() {
        let expr = lower(attr.expr());
        match attr.key() {
            "enabled" => retry.enabled = literal_bool(&expr, "retry.enabled")?,
            "attempts" => retry.attempts = literal_int(&expr, "retry.attempts")?,
            "exponential_backoff" => {
                retry.exponential_backoff = literal_bool(&expr, "retry.exponential_backoff")?
            }
            "min_backoff" => retry.min_backoff = literal_int(&expr, "retry.min_backoff")?,
            "max_backoff" => retry.max_backoff = literal_int(&expr, "retry.max_backoff")?,
            other => diags.push(Diagnostic::error(
                "unsupported attribute",
                format!("retry block has no attribute named \"{}\"", other),
            )),
        }
    }
    if diags.has_errors() {
        Err(diags)
    } else {
        Ok(retry)
    }
}

fn decode_container(stage_id: &str, body: &hcl::Body) -> Result<StageContainer, Diagnostics> {
    let mut image = None;
    let mut entrypoint = None;
    let mut stdin = false;
    let mut volumes = Vec::new();
    let mut ports = Vec::new();
    let mut diags = Diagnostics::new();

    for attr in body.attributes() {
        let expr = lower(attr.expr());
        match attr.key() {
            "image" => image = Some(expr),
            "entrypoint" => entrypoint = Some(expr),
            "stdin" => stdin = literal_bool(&expr, "container.stdin")?,
            other => diags.push(Diagnostic::error(
                "unsupported attribute",
                format!("container block has no attribute named \"{}\"", other),
            )),
        }
    }
    for block in body.blocks() {
        match block.identifier() {
            "volume" => {
                let mut source = None;
                let mut destination = None;
                for attr in block.body().attributes() {
                    match attr.key() {
                        "source" => source = Some(lower(attr.expr())),
                        "destination" => destination = Some(lower(attr.expr())),
                        other => diags.push(Diagnostic::error(
                            "unsupported attribute",
                            format!("volume block has no attribute named \"{}\"", other),
                        )),
                    }
                }
                match (source, destination) {
                    (Some(source), Some(destination)) => volumes.push(ContainerVolume {
                        source,
                        destination,
                    }),
                    _ => diags.push(Diagnostic::error(
                        "missing attribute",
                        format!(
                            "stage.{} container volume requires source and destination",
                            stage_id
                        ),
                    )),
                }
            }
            "ports" => {
                let mut host = None;
                let mut container_port = None;
                let mut port = None;
                for attr in block.body().attributes() {
                    match attr.key() {
                        "host" => host = Some(lower(attr.expr())),
                        "container_port" => container_port = Some(lower(attr.expr())),
                        "port" => port = Some(lower(attr.expr())),
                        other => diags.push(Diagnostic::error(
                            "unsupported attribute",
                            format!("ports block has no attribute named \"{}\"", other),
                        )),
                    }
                }
                match (container_port, port) {
                    (Some(container_port), Some(port)) => ports.push(ContainerPort {
                        host,
                        container_port,
                        port,
                    }),
                    _ => diags.push(Diagnostic::error(
                        "missing attribute",
                        format!(
                            "stage.{} ports block requires container_port and port",
                            stage_id
                        ),
                    )),
                }
            }
            other => diags.push(Diagnostic::error(
                "unsupported block",
                format!("container block has no block type named \"{}\"", other),
            )),
        }
    }

    let Some(image) = image else {
        diags.push(Diagnostic::error(
            "missing attribute",
            format!("stage.{} container requires an image", stage_id),
        ));
        return Err(diags);
    };
    if diags.has_errors() {
        return Err(diags);
    }
    Ok(StageContainer {
        image,
        entrypoint,
        stdin,
        volumes,
        ports,
    })
}

fn decode_env(stage_id: &str, body: &hcl::Body) -> Result<StageEnv, Diagnostics> {
    let mut name = None;
    let mut value = None;
    let mut diags = Diagnostics::new();
    for attr in body.attributes() {
        let expr = lower(attr.expr());
        match attr.key() {
            "name" => name = Some(literal_string(&expr, "env.name")?),
            "value" => value = Some(expr),
            other => diags.push(Diagnostic::error(
                "unsupported attribute",
                format!("env block has no attribute named \"{}\"", other),
            )),
        }
    }
    match (name, value) {
        (Some(name), Some(value)) => Ok(StageEnv { name, value }),
        _ => {
            diags.push(Diagnostic::error(
                "missing attribute",
                format!("stage.{} env block requires name and value", stage_id),
            ));
            Err(diags)
        }
    }
}

/// Hooks are nested stage bodies; they inherit the parent's id and surface
/// as `this.hook == true` at run time.
fn decode_hook(parent_id: &str, body: &hcl::Body) -> Result<Stage, Diagnostics> {
    for block in body.blocks() {
        if block.identifier() == "stage" {
            return Stage::decode(parent_id, block.body());
        }
    }
    Err(Diagnostics::from(Diagnostic::error(
        "missing block",
        format!("stage.{} hook requires a nested stage block", parent_id),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_stage(src: &str) -> Result<Stage, Diagnostics> {
        let body: hcl::Body = hcl::parse(src).unwrap();
        let block = body.blocks().next().unwrap();
        let id = block.labels().first().unwrap().as_str().to_string();
        Stage::decode(&id, block.body())
    }

    #[test]
    fn test_decode_minimal_stage() {
        let stage = parse_stage(
            r#"
            stage "build" {
              script = "echo hello"
            }
            "#,
        )
        .unwrap();
        assert_eq!(stage.id, "build");
        assert!(stage.script.is_some());
        assert!(!stage.is_daemon());
    }

    #[test]
    fn test_decode_full_stage() {
        let stage = parse_stage(
            r#"
            stage "deploy" {
              name       = "Deploy"
              depends_on = [stage.build]
              if         = true
              script     = "echo ${stage.build.output}"

              retry {
                enabled             = true
                attempts            = 3
                exponential_backoff = true
                min_backoff         = 1
                max_backoff         = 10
              }

              daemon {
                enabled = true
                timeout = 30
                lifecycle {
                  stop_when_complete = [stage.test]
                }
              }

              env {
                name  = "TARGET"
                value = "prod"
              }

              pre_hook {
                stage {
                  script = "echo before"
                }
              }
            }
            "#,
        )
        .unwrap();
        assert_eq!(stage.name.as_deref(), Some("Deploy"));
        assert!(stage.is_daemon());
        assert_eq!(stage.retry.as_ref().unwrap().attempts, 3);
        assert_eq!(stage.env.len(), 1);
        assert_eq!(stage.pre_hook.len(), 1);

        let vars: Vec<String> = stage.variables().iter().map(|t| t.to_string()).collect();
        assert!(vars.contains(&"stage.build".to_string()));
        assert!(vars.contains(&"stage.build.output".to_string()));
        // Lifecycle references are resolved at dispatch time, not as edges.
        assert!(!vars.contains(&"stage.test".to_string()));
    }

    #[test]
    fn test_decode_container() {
        let stage = parse_stage(
            r#"
            stage "in_container" {
              container {
                image = "alpine:latest"
                stdin = false
                volume {
                  source      = "/tmp"
                  destination = "/data"
                }
              }
            }
            "#,
        )
        .unwrap();
        let container = stage.container.unwrap();
        assert_eq!(container.volumes.len(), 1);
        assert!(!container.stdin);
    }

    #[test]
    fn test_unknown_attribute_is_error() {
        let err = parse_stage(
            r#"
            stage "x" {
              scriptt = "typo"
            }
            "#,
        )
        .unwrap_err();
        assert!(err.has_errors());
    }

    #[test]
    fn test_retry_must_be_literal() {
        let err = parse_stage(
            r#"
            stage "x" {
              retry {
                enabled  = stage.other.output
                attempts = 1
              }
            }
            "#,
        )
        .unwrap_err();
        assert!(err.has_errors());
    }
}
