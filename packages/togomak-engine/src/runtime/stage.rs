//! Stage execution: macro expansion, environment construction, command
//! building, process and container launch, hooks and for-each dispatch.

use crate::blocks::{Macro, Stage, StageEnv};
use crate::pipeline::{Pipeline, CONFIG_FILE_NAME, OUTPUT_ENV_VAR, PARAM_ENV_PREFIX};
use crate::resolver::{self, Resolved};
use crate::runtime::container::{ContainerSpec, PortMapping};
use crate::runtime::options::{Parent, RunnableOptions, Status};
use crate::{outputs, RunContext};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use togomak_expr::eval::{evaluate, iterate, truthiness};
use togomak_expr::{Diagnostic, Diagnostics, Expr, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// A fully evaluated command line.
#[derive(Debug, Clone, Default)]
struct ExecCommand {
    program: String,
    args: Vec<String>,
    /// Both script and args were unset; only valid with a container, which
    /// may rely on its entrypoint.
    is_empty: bool,
}

impl ExecCommand {
    fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn argv(&self) -> Vec<String> {
        if self.is_empty {
            return Vec::new();
        }
        let mut argv = vec![self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl Stage {
    /// User-visible announcement, called for every stage in a layer whether
    /// it runs or not.
    pub fn prepare(&self, skip: bool, overridden: bool) {
        if overridden {
            info!(stage = %self.id, "overridden");
        } else if skip {
            info!(stage = %self.id, "skipped");
        } else {
            info!(stage = %self.id, "starting");
        }
    }

    /// Evaluate the `if` condition. Macro parameters are folded into the
    /// `param` namespace first, so conditions may reference `param.*`.
    pub fn can_run(&self, run: &RunContext, opts: &RunnableOptions) -> (bool, Diagnostics) {
        let mut diags = Diagnostics::new();
        debug!(stage = %self.id, "checking if stage can run");

        let this_frame = self.this_frame(opts, None);
        let params = match self.macro_params(run, &this_frame) {
            Ok(params) => params,
            Err(d) => return (false, d),
        };
        let Some(condition) = &self.condition else {
            return (true, diags);
        };

        let mut frames = vec![this_frame];
        frames.push(param_frame(params));
        match evaluate(&run.ctx, condition, &frames) {
            Ok(value) => match truthiness(&value) {
                Ok(ok) => (ok, diags),
                Err(d) => {
                    diags.extend(d);
                    (false, diags)
                }
            },
            Err(d) => {
                diags.extend(d);
                (false, diags)
            }
        }
    }

    /// Run the stage: expand macros, then dispatch once or once per
    /// `for_each` element.
    ///
    /// Returns a boxed future (rather than `async fn`) because `run_hooks`
    /// recurses back into `run`; an opaque `impl Future` return type here
    /// would make that recursion self-referential and the compiler cannot
    /// prove such a type `Send`.
    pub fn run<'a>(
        &'a self,
        run: &'a RunContext,
        pipeline: &'a Pipeline,
        opts: &'a RunnableOptions,
    ) -> futures::future::BoxFuture<'a, Diagnostics> {
        Box::pin(async move {
        let mut diags = Diagnostics::new();
        debug!(stage = %self.id, "expanding macros");
        let Some(expanded) = self.expand_macros(run, pipeline, opts, &mut diags) else {
            return diags;
        };

        let Some(for_each) = &expanded.for_each else {
            diags.extend(expanded.run_single(run, pipeline, opts, None).await);
            return diags;
        };

        let items = match evaluate(&run.ctx, for_each, &[]) {
            Ok(items) => items,
            Err(d) => {
                diags.extend(d);
                return diags;
            }
        };
        if items.is_null() {
            diags.extend(expanded.run_single(run, pipeline, opts, None).await);
            return diags;
        }
        if !items.can_iterate() {
            diags.push(Diagnostic::error(
                "invalid type for for_each",
                format!(
                    "stage.{} for_each must be a list, set or map, got {}",
                    self.id,
                    items.kind()
                ),
            ));
            return diags;
        }

        // One runnable per element, all dispatched concurrently within the
        // stage's slot in the current layer.
        let elements = match iterate(&items) {
            Ok(elements) => elements,
            Err(d) => {
                diags.extend(d);
                return diags;
            }
        };
        let runs = elements
            .into_iter()
            .map(|(key, value)| expanded.run_single(run, pipeline, opts, Some((key, value))));
        for d in futures::future::join_all(runs).await {
            diags.extend(d);
        }
        diags
        })
    }

    /// Execute one instance of the stage (one for_each element, or the whole
    /// stage). Pre-hooks run first; post-hooks always run, with
    /// `this.status` reflecting the body's outcome.
    async fn run_single(
        &self,
        run: &RunContext,
        pipeline: &Pipeline,
        opts: &RunnableOptions,
        instance: Option<(Value, Value)>,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let display_id = match &instance {
            Some((key, _)) => format!("{}[{}]", self.id, key),
            None => self.id.clone(),
        };
        debug!(stage = %display_id, "running stage");

        diags.extend(
            self.run_hooks(&self.pre_hook, run, pipeline, Status::Running)
                .await,
        );

        let body_diags = self.run_body(run, opts, &display_id, instance).await;
        let status = if body_diags.has_errors() || diags.has_errors() {
            Status::Failure
        } else {
            Status::Success
        };
        diags.extend(body_diags);

        debug!(stage = %display_id, "running post hooks");
        diags.extend(
            self.run_hooks(&self.post_hook, run, pipeline, status)
                .await,
        );
        diags
    }

    async fn run_hooks(
        &self,
        hooks: &[Stage],
        run: &RunContext,
        pipeline: &Pipeline,
        status: Status,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for hook in hooks {
            let hook_opts = RunnableOptions {
                status,
                hook: true,
                parent: Some(Parent {
                    id: self.id.clone(),
                    name: self.name.clone().unwrap_or_else(|| self.id.clone()),
                }),
            };
            // Hooks are stages, so this recurses; erase the future type to
            // keep the async state machine finite.
            let fut: futures::future::BoxFuture<'_, Diagnostics> =
                Box::pin(hook.run(run, pipeline, &hook_opts));
            diags.extend(fut.await);
        }
        diags
    }

    async fn run_body(
        &self,
        run: &RunContext,
        opts: &RunnableOptions,
        display_id: &str,
        instance: Option<(Value, Value)>,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();

        if run.terminate.is_cancelled() || run.kill.is_cancelled() {
            diags.push(Diagnostic::warning(
                "cancelled",
                format!("stage.{} was cancelled before it started", display_id),
            ));
            return diags;
        }

        let this_frame = self.this_frame(opts, instance);
        let params = match self.macro_params(run, &this_frame) {
            Ok(params) => params,
            Err(d) => {
                diags.extend(d);
                return diags;
            }
        };
        let frames = vec![this_frame, param_frame(params.clone())];

        // Environment.
        let env = match self.parse_environment(run, &frames) {
            Ok(env) => env,
            Err(d) => {
                diags.extend(d);
                return diags;
            }
        };
        let mut env = env;
        env.push((
            OUTPUT_ENV_VAR.to_string(),
            outputs::env_file_path(&run.tempdir).to_string_lossy().into_owned(),
        ));
        if self.use_.as_ref().is_some_and(|u| u.parameters.is_some()) {
            for (key, value) in &params {
                env.push((format!("{}{}", PARAM_ENV_PREFIX, key), value.render()));
            }
        }
        if run.config.behavior.dry_run {
            for (key, value) in &env {
                println!("export {}={}", key, value);
            }
        }

        // Command line.
        let Some((command, dir)) = self.parse_exec_command(run, &frames, &mut diags) else {
            return diags;
        };

        if let Some(container) = &self.container {
            let d = self
                .execute_container(run, &frames, container, &command, &dir, &env, display_id)
                .await;
            diags.extend(d);
            return diags;
        }

        if command.is_empty {
            diags.push(Diagnostic::error(
                "no commands specified",
                format!("stage.{}: either script or args must be specified", display_id),
            ));
            return diags;
        }
        if run.config.behavior.dry_run {
            println!("{}", command.display());
            return diags;
        }

        diags.extend(self.exec_process(run, &command, &dir, &env, display_id).await);
        diags
    }

    async fn exec_process(
        &self,
        run: &RunContext,
        command: &ExecCommand,
        dir: &PathBuf,
        env: &[(String, String)],
        display_id: &str,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();
        debug!(stage = %display_id, "running command: {:.30}...", command.display());

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                diags.push(Diagnostic::error(
                    format!("failed to run command (stage.{})", display_id),
                    e.to_string(),
                ));
                return diags;
            }
        };
        self.state
            .pid
            .store(child.id().unwrap_or_default() as i32, Ordering::SeqCst);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let id_out = display_id.to_string();
        let out_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(stage = %id_out, "{}", line);
                }
            }
        });
        let id_err = display_id.to_string();
        let err_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(stage = %id_err, "{}", line);
                }
            }
        });

        let stage_terminate = self.state.terminate_token.clone();
        let stage_kill = self.state.kill_token.clone();
        let global_terminate = run.terminate.clone();
        let global_kill = run.kill.clone();
        let mut terminate_armed = true;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = stage_terminate.cancelled(), if terminate_armed => {
                    terminate_armed = false;
                    self.signal_child(libc_sigterm());
                }
                _ = global_terminate.cancelled(), if terminate_armed => {
                    terminate_armed = false;
                    self.state.terminated.store(true, Ordering::SeqCst);
                    self.signal_child(libc_sigterm());
                }
                _ = stage_kill.cancelled() => {
                    let _ = child.start_kill();
                }
                _ = global_kill.cancelled() => {
                    let _ = child.start_kill();
                }
            }
        };
        self.state.pid.store(0, Ordering::SeqCst);
        let _ = out_task.await;
        let _ = err_task.await;

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                if self.was_terminated() && exited_by_signal(&status) {
                    warn!(stage = %display_id, "command terminated with signal: {}", status);
                } else {
                    diags.push(Diagnostic::error(
                        format!("failed to run command (stage.{})", display_id),
                        format!("process exited with {}", status),
                    ));
                }
            }
            Err(e) => diags.push(Diagnostic::error(
                format!("failed to run command (stage.{})", display_id),
                e.to_string(),
            )),
        }
        diags
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_container(
        &self,
        run: &RunContext,
        frames: &[HashMap<String, Value>],
        container: &crate::blocks::StageContainer,
        command: &ExecCommand,
        dir: &PathBuf,
        env: &[(String, String)],
        display_id: &str,
    ) -> Diagnostics {
        let mut diags = Diagnostics::new();

        let image = match evaluate(&run.ctx, &container.image, frames) {
            Ok(v) => match v.as_str() {
                Some(image) => image.to_string(),
                None => {
                    diags.push(Diagnostic::error(
                        "image must be a string",
                        format!("stage.{}: received image='''{}'''", display_id, v),
                    ));
                    return diags;
                }
            },
            Err(d) => {
                diags.extend(d);
                return diags;
            }
        };

        let entrypoint = match &container.entrypoint {
            None => None,
            Some(expr) => match evaluate(&run.ctx, expr, frames) {
                Ok(Value::Null(_)) => None,
                Ok(v) => match v.as_slice() {
                    Some(items) => {
                        let mut out = Vec::new();
                        for item in items {
                            match item.as_str() {
                                Some(s) => out.push(s.to_string()),
                                None => {
                                    diags.push(Diagnostic::error(
                                        "entrypoint must be a list of strings",
                                        format!("stage.{}: received entrypoint='''{}'''", display_id, v),
                                    ));
                                    return diags;
                                }
                            }
                        }
                        Some(out)
                    }
                    None => {
                        diags.push(Diagnostic::error(
                            "entrypoint must be a list of strings",
                            format!("stage.{}: received entrypoint='''{}'''", display_id, v),
                        ));
                        return diags;
                    }
                },
                Err(d) => {
                    diags.extend(d);
                    return diags;
                }
            },
        };

        let mut binds = vec![format!("{}:/workspace", dir.display())];
        for volume in &container.volumes {
            let source = match evaluate(&run.ctx, &volume.source, frames) {
                Ok(v) => v.render(),
                Err(d) => {
                    diags.extend(d);
                    continue;
                }
            };
            let destination = match evaluate(&run.ctx, &volume.destination, frames) {
                Ok(v) => v.render(),
                Err(d) => {
                    diags.extend(d);
                    continue;
                }
            };
            binds.push(format!("{}:{}", source, destination));
        }
        if diags.has_errors() {
            return diags;
        }

        let mut ports = Vec::new();
        for port in &container.ports {
            let host = match &port.host {
                Some(host) => match evaluate(&run.ctx, host, frames) {
                    Ok(Value::Null(_)) => None,
                    Ok(v) => Some(v.render()),
                    Err(d) => {
                        diags.extend(d);
                        continue;
                    }
                },
                None => None,
            };
            let container_port = match evaluate(&run.ctx, &port.container_port, frames) {
                Ok(v) => v.render(),
                Err(d) => {
                    diags.extend(d);
                    continue;
                }
            };
            let host_port = match evaluate(&run.ctx, &port.port, frames) {
                Ok(v) => v.render(),
                Err(d) => {
                    diags.extend(d);
                    continue;
                }
            };
            ports.push(PortMapping {
                host,
                container_port,
                port: host_port,
            });
        }
        if diags.has_errors() {
            return diags;
        }

        if run.config.behavior.dry_run {
            println!("docker:run.image {}", image);
            println!("docker:run.workdir /workspace");
            println!("docker:run.volume {}:/workspace", dir.display());
            println!("docker:run.stdin {}", container.stdin);
            println!("docker:run.args {}", command.display());
            return diags;
        }

        let runtime = run.container.clone();
        match runtime.image_exists(&image).await {
            Ok(true) => {}
            Ok(false) => {
                info!(stage = %display_id, "image {} does not exist, pulling...", image);
                if let Err(e) = runtime.pull(&image).await {
                    diags.push(Diagnostic::error("could not pull image", e));
                    return diags;
                }
            }
            Err(e) => {
                diags.push(Diagnostic::error("could not inspect image", e));
                return diags;
            }
        }

        let spec = ContainerSpec {
            image: image.clone(),
            cmd: command.argv(),
            workdir: "/workspace".to_string(),
            env: env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            binds,
            ports,
            entrypoint,
            stdin: container.stdin,
        };
        let container_id = match runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                diags.push(Diagnostic::error("could not create container", e));
                return diags;
            }
        };
        if let Err(e) = runtime.start(&container_id).await {
            diags.push(Diagnostic::error("could not start container", e));
            return diags;
        }
        *self.state.container_id.lock().expect("container id lock") = Some(container_id.clone());

        if let Err(e) = runtime.logs(&container_id, display_id).await {
            diags.push(Diagnostic::error("could not get container logs", e));
        }
        match runtime.wait(&container_id).await {
            Ok(0) => {}
            Ok(code) => {
                if self.was_terminated() {
                    warn!(stage = %display_id, "container stopped with exit code {}", code);
                } else {
                    diags.push(Diagnostic::error(
                        format!("failed to run command (stage.{})", display_id),
                        format!("container exited with code {}", code),
                    ));
                }
            }
            Err(e) => diags.push(Diagnostic::error("could not wait for container", e)),
        }

        // Removal failures are warnings, never errors.
        if let Err(e) = runtime.remove(&container_id).await {
            diags.push(Diagnostic::warning("failed to remove container", e));
        }
        *self.state.container_id.lock().expect("container id lock") = None;
        diags
    }

    /// The `this` object visible to hooks, conditions and expressions, plus
    /// the `each` object for for_each instances.
    fn this_frame(
        &self,
        opts: &RunnableOptions,
        instance: Option<(Value, Value)>,
    ) -> HashMap<String, Value> {
        let (id, name) = match &opts.parent {
            Some(parent) => (parent.id.clone(), parent.name.clone()),
            None => (
                self.id.clone(),
                self.name.clone().unwrap_or_else(|| self.id.clone()),
            ),
        };
        let mut frame = HashMap::new();
        frame.insert(
            "this".to_string(),
            Value::object_of(vec![
                ("name".to_string(), Value::from(name)),
                ("id".to_string(), Value::from(id)),
                ("hook".to_string(), Value::Bool(opts.hook)),
                ("status".to_string(), Value::from(opts.status.as_str())),
            ]),
        );
        if let Some((key, value)) = instance {
            frame.insert(
                "each".to_string(),
                Value::object_of(vec![
                    ("key".to_string(), key),
                    ("value".to_string(), value),
                ]),
            );
        }
        frame
    }

    /// The effective `param` map: the global namespace (seeded from a parent
    /// invocation) merged with this stage's evaluated `use.parameters`.
    fn macro_params(
        &self,
        run: &RunContext,
        this_frame: &HashMap<String, Value>,
    ) -> Result<IndexMap<String, Value>, Diagnostics> {
        let mut params: IndexMap<String, Value> = IndexMap::new();
        {
            let ctx = run.ctx.read();
            if let Some(existing) = ctx.variable("param").and_then(Value::as_entries) {
                params.extend(existing.clone());
            }
        }
        let Some(parameters) = self.use_.as_ref().and_then(|u| u.parameters.as_ref()) else {
            return Ok(params);
        };
        let frames = vec![this_frame.clone(), param_frame(params.clone())];
        let value = evaluate(&run.ctx, parameters, &frames)?;
        if let Some(entries) = value.as_entries() {
            params.extend(entries.clone());
        }
        Ok(params)
    }

    fn parse_environment(
        &self,
        run: &RunContext,
        frames: &[HashMap<String, Value>],
    ) -> Result<Vec<(String, String)>, Diagnostics> {
        let mut diags = Diagnostics::new();
        let mut env = Vec::with_capacity(self.env.len());
        for StageEnv { name, value } in &self.env {
            match evaluate(&run.ctx, value, frames) {
                Ok(v) => {
                    if v.is_null() {
                        diags.push(Diagnostic::error(
                            "invalid environment variable",
                            format!("environment variable {} is null", name),
                        ));
                    } else if let Some(s) = v.as_str() {
                        env.push((name.clone(), s.to_string()));
                    } else {
                        diags.push(Diagnostic::error(
                            "invalid environment variable",
                            format!("environment variable {} is not a string", name),
                        ));
                    }
                }
                Err(d) => diags.extend(d),
            }
        }
        if diags.has_errors() {
            Err(diags)
        } else {
            Ok(env)
        }
    }

    /// Evaluate script/shell/args and the working directory into a concrete
    /// command line.
    fn parse_exec_command(
        &self,
        run: &RunContext,
        frames: &[HashMap<String, Value>],
        diags: &mut Diagnostics,
    ) -> Option<(ExecCommand, PathBuf)> {
        let script = match &self.script {
            None => None,
            Some(expr) => match evaluate(&run.ctx, expr, frames) {
                Ok(v) => v.as_str().map(str::to_string),
                Err(d) => {
                    if run.config.behavior.dry_run {
                        // Outputs of earlier stages are absent in a dry run;
                        // show a placeholder instead of failing.
                        Some("(will be evaluated later)".to_string())
                    } else {
                        diags.extend(d);
                        return None;
                    }
                }
            },
        };
        let shell = match &self.shell {
            None => "bash".to_string(),
            Some(expr) => match evaluate(&run.ctx, expr, frames) {
                Ok(v) if v.is_null() => "bash".to_string(),
                Ok(v) => v.render(),
                Err(d) => {
                    diags.extend(d);
                    return None;
                }
            },
        };
        let args: Vec<String> = match &self.args {
            None => Vec::new(),
            Some(expr) => match evaluate(&run.ctx, expr, frames) {
                Ok(v) => match v.as_slice() {
                    Some(items) => items.iter().map(Value::render).collect(),
                    None => Vec::new(),
                },
                Err(d) => {
                    diags.extend(d);
                    return None;
                }
            },
        };

        let command = if let Some(script) = script {
            let shell_args = match shell.as_str() {
                "bash" => vec!["-e".to_string(), "-u".to_string(), "-c".to_string(), script],
                "sh" => vec!["-e".to_string(), "-c".to_string(), script],
                _ => vec![script],
            };
            ExecCommand {
                program: shell,
                args: shell_args,
                is_empty: false,
            }
        } else if !args.is_empty() {
            ExecCommand {
                program: args[0].clone(),
                args: args[1..].to_vec(),
                is_empty: false,
            }
        } else {
            ExecCommand {
                program: shell,
                args: Vec::new(),
                is_empty: true,
            }
        };

        // Working directory: literal if absolute, joined with cwd otherwise.
        let mut dir = run.config.paths.cwd.clone();
        if let Some(expr) = &self.dir {
            match evaluate(&run.ctx, expr, frames) {
                Ok(v) if v.is_null() => {}
                Ok(v) => {
                    if let Some(s) = v.as_str() {
                        if !s.is_empty() {
                            let p = PathBuf::from(s);
                            dir = if p.is_absolute() {
                                p
                            } else {
                                run.config.paths.cwd.join(p)
                            };
                        }
                    }
                }
                Err(d) => {
                    diags.extend(d);
                    return None;
                }
            }
        }
        if run.config.behavior.dry_run {
            println!("cd {}", dir.display());
        }
        Some((command, dir))
    }

    /// Resolve the stage's `use` block into an executable shape: an inline
    /// template merge, or a rewritten argv that re-invokes togomak on a
    /// sub-pipeline.
    fn expand_macros(
        &self,
        run: &RunContext,
        pipeline: &Pipeline,
        opts: &RunnableOptions,
        diags: &mut Diagnostics,
    ) -> Option<Stage> {
        let Some(use_) = &self.use_ else {
            return Some(self.clone());
        };
        debug!(stage = %self.id, "running stage.use");

        // A bare `macro.<name>` reference selects a macro block; any other
        // expression evaluates to a sub-pipeline path.
        let mut selected: Option<Macro> = None;
        let variables = use_.macro_ref.variables();
        if variables.len() == 1 && variables[0].root == "macro" {
            if let Some(Resolved::Macro(name)) = resolver::resolve(&variables[0]) {
                debug!(stage = %self.id, "stage.{} uses macro.{}", self.id, name);
                match pipeline.macros.iter().find(|m| m.id == name) {
                    Some(m) => selected = Some((**m).clone()),
                    None => {
                        diags.push(Diagnostic::error(
                            "unknown reference",
                            format!("stage.{} uses undefined macro.{}", self.id, name),
                        ));
                        return None;
                    }
                }
            }
        }
        let selected = match selected {
            Some(m) => m,
            None => {
                let this_frame = self.this_frame(opts, None);
                let source = match evaluate(&run.ctx, &use_.macro_ref, &[this_frame]) {
                    Ok(v) => v,
                    Err(d) => {
                        diags.extend(d);
                        return None;
                    }
                };
                let Some(source) = source.as_str().map(str::to_string) else {
                    diags.push(Diagnostic::error(
                        "invalid macro",
                        format!("stage.{} uses a macro with an invalid source", self.id),
                    ));
                    return None;
                };
                Macro {
                    id: uuid::Uuid::new_v4().to_string(),
                    source: Some(Expr::literal(source)),
                    stage: None,
                    files: None,
                }
            }
        };

        if let Some(template) = &selected.stage {
            debug!("merging stage.{} with {}", self.id, selected.identifier());
            return Some(self.merge_template(template));
        }
        if let Some(source) = &selected.source {
            return self.expand_source_macro(run, source, diags);
        }
        if let Some(files) = &selected.files {
            return self.expand_files_macro(run, files, diags);
        }
        diags.push(Diagnostic::error(
            "invalid macro",
            format!(
                "{} does not define a stage, source or files",
                selected.identifier()
            ),
        ));
        None
    }

    /// Inline template merge. This stage's fields take precedence; the
    /// macro's `depends_on` contributes graph edges only.
    fn merge_template(&self, template: &Stage) -> Stage {
        let mut merged = self.clone();
        // `use` stays on the merged stage; run_body reads use.parameters.
        merged.condition = merged.condition.or_else(|| template.condition.clone());
        merged.for_each = merged.for_each.or_else(|| template.for_each.clone());
        merged.dir = merged.dir.or_else(|| template.dir.clone());
        merged.script = merged.script.or_else(|| template.script.clone());
        merged.shell = merged.shell.or_else(|| template.shell.clone());
        merged.args = merged.args.or_else(|| template.args.clone());
        merged.container = merged.container.or_else(|| template.container.clone());
        merged.daemon = merged.daemon.or_else(|| template.daemon.clone());
        merged.retry = merged.retry.or_else(|| template.retry.clone());
        let mut env = template.env.clone();
        env.extend(std::mem::take(&mut merged.env));
        merged.env = env;
        let mut pre = template.pre_hook.clone();
        pre.extend(std::mem::take(&mut merged.pre_hook));
        merged.pre_hook = pre;
        let mut post = template.post_hook.clone();
        post.extend(std::mem::take(&mut merged.post_hook));
        merged.post_hook = post;
        if let Some(depends_on) = &template.depends_on {
            merged.macro_depends_on.extend(depends_on.variables());
        }
        merged
    }

    /// `use { macro = "<dir-or-file>" }` → re-invoke ourselves on the
    /// sub-pipeline with `--child`.
    fn expand_source_macro(
        &self,
        run: &RunContext,
        source: &Expr,
        diags: &mut Diagnostics,
    ) -> Option<Stage> {
        let source = match evaluate(&run.ctx, source, &[]) {
            Ok(v) if v.as_str().is_some() => v.render(),
            Ok(_) => {
                diags.push(Diagnostic::error(
                    "invalid macro",
                    format!("stage.{} uses a macro with an invalid source", self.id),
                ));
                return None;
            }
            Err(d) => {
                diags.extend(d);
                return None;
            }
        };

        let (dir, file) = if source.ends_with(".hcl") {
            warn!(
                "macro source pointing to a .hcl file is deprecated, use a directory instead"
            );
            diags.push(Diagnostic::warning(
                "deprecated",
                format!(
                    "stage.{} uses a macro with a .hcl file. use a directory instead",
                    self.id
                ),
            ));
            let path = PathBuf::from(&source);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            (dir, Some(path))
        } else {
            (PathBuf::from(&source), None)
        };

        let dir_abs = run
            .config
            .paths
            .cwd
            .join(&dir)
            .canonicalize()
            .unwrap_or_else(|_| dir.clone());
        let cwd_abs = run
            .config
            .paths
            .cwd
            .canonicalize()
            .unwrap_or_else(|_| run.config.paths.cwd.clone());
        if dir_abs == cwd_abs {
            diags.push(Diagnostic::error(
                "infinite recursion",
                format!(
                    "stage.{} uses a macro with a source pointing to the same directory as the current directory",
                    self.id
                ),
            ));
            return None;
        }

        let mut merged = self.clone();
        // `use` stays on the merged stage; run_body reads use.parameters.
        if merged.dir.is_none() {
            merged.dir = Some(Expr::literal(
                run.config.paths.cwd.to_string_lossy().as_ref(),
            ));
        }
        merged.args = Some(self.child_invocation_args(run, &dir, file.as_deref()));
        merged.script = None;
        Some(merged)
    }

    /// `macro { files = {...} }` → materialise the files under the run temp
    /// directory and re-invoke ourselves on the default entry point.
    fn expand_files_macro(
        &self,
        run: &RunContext,
        files: &Expr,
        diags: &mut Diagnostics,
    ) -> Option<Stage> {
        let value = match evaluate(&run.ctx, files, &[]) {
            Ok(v) => v,
            Err(d) => {
                diags.extend(d);
                return None;
            }
        };
        if value.is_null() {
            return Some(self.clone());
        }
        let Some(entries) = value.as_entries() else {
            diags.push(Diagnostic::error(
                "invalid macro",
                format!("stage.{} uses a macro whose files are not a map", self.id),
            ));
            return None;
        };

        let stage_dir = run.tempdir.join(&self.id);
        if let Err(e) = std::fs::create_dir_all(&stage_dir) {
            diags.push(Diagnostic::error(
                "failed to create temporary directory",
                format!("failed to create temporary directory for stage {}: {}", self.id, e),
            ));
            return None;
        }
        debug!("using {} files from the macro", entries.len());

        let mut default_entry: Option<PathBuf> = None;
        let mut last_entry: Option<PathBuf> = None;
        for (file_name, content) in entries {
            let Some(content) = content.as_str() else {
                diags.push(Diagnostic::error(
                    "invalid macro",
                    format!("stage.{} uses a macro with an invalid file {}", self.id, file_name),
                ));
                return None;
            };
            let path = stage_dir.join(file_name);
            debug!("writing {} to {}", file_name, path.display());
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&path, content) {
                diags.push(Diagnostic::error(
                    "invalid macro",
                    format!(
                        "stage.{} could not write macro file {}: {}",
                        self.id, file_name, e
                    ),
                ));
                return None;
            }
            if PathBuf::from(file_name).file_name().and_then(|n| n.to_str())
                == Some(CONFIG_FILE_NAME)
            {
                default_entry = Some(path.clone());
            }
            last_entry = Some(path);
        }
        let entry = match default_entry.or(if entries.len() == 1 { last_entry } else { None }) {
            Some(entry) => entry,
            None => {
                diags.push(Diagnostic::error(
                    "invalid macro",
                    format!(
                        "stage.{} uses a macro without a default execution file. include a file named {} to avoid this error",
                        self.id, CONFIG_FILE_NAME
                    ),
                ));
                return None;
            }
        };

        let chdir = match self.use_.as_ref().and_then(|u| u.chdir.as_ref()) {
            Some(expr) => match evaluate(&run.ctx, expr, &[]) {
                Ok(v) => v.coerce_bool().unwrap_or(false),
                Err(d) => {
                    diags.extend(d);
                    return None;
                }
            },
            None => false,
        };
        let dir = if chdir {
            stage_dir
        } else {
            run.config.paths.cwd.clone()
        };

        let mut merged = self.clone();
        // `use` stays on the merged stage; run_body reads use.parameters.
        merged.args = Some(self.child_invocation_args(run, &dir, Some(&entry)));
        merged.script = None;
        Some(merged)
    }

    /// `<exe> --child --dir <dir> [--file <file>] --parent <id> [--ci]
    /// [--unattended]` as a literal args expression.
    fn child_invocation_args(
        &self,
        run: &RunContext,
        dir: &std::path::Path,
        file: Option<&std::path::Path>,
    ) -> Expr {
        let exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "togomak".to_string());
        let mut argv = vec![
            Value::from(exe),
            Value::from("--child"),
            Value::from("--dir"),
            Value::from(dir.to_string_lossy().as_ref()),
        ];
        if let Some(file) = file {
            argv.push(Value::from("--file"));
            argv.push(Value::from(file.to_string_lossy().as_ref()));
        }
        argv.push(Value::from("--parent"));
        argv.push(Value::from(self.id.as_str()));
        if run.config.behavior.ci {
            argv.push(Value::from("--ci"));
        }
        if run.config.behavior.unattended {
            argv.push(Value::from("--unattended"));
        }
        Expr::Literal(Value::List(argv))
    }

    fn signal_child(&self, signal: i32) {
        #[cfg(unix)]
        {
            let pid = self.state.pid.load(Ordering::SeqCst);
            if pid > 0 {
                unsafe {
                    libc::kill(pid, signal);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            self.state.kill_token.cancel();
        }
    }
}

fn param_frame(params: IndexMap<String, Value>) -> HashMap<String, Value> {
    let mut frame = HashMap::new();
    frame.insert(
        "param".to_string(),
        Value::Object(params),
    );
    frame
}

fn libc_sigterm() -> i32 {
    #[cfg(unix)]
    {
        libc::SIGTERM
    }
    #[cfg(not(unix))]
    {
        15
    }
}

#[cfg(unix)]
fn exited_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn exited_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}
