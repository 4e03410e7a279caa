//! The scheduler: layered, concurrent execution of the dependency graph.
//!
//! Per layer: refresh the `output` namespace from the env file, decide for
//! each node whether it runs (filter, then `if` condition), announce it,
//! and dispatch every non-daemon runnable concurrently. The layer completes
//! when all non-daemon tasks have returned; daemons keep running and are
//! awaited (or cancelled) after the final layer.

use crate::blocks::Stage;
use crate::config::Config;
use crate::graph;
use crate::handler::Handler;
use crate::outputs;
use crate::pipeline::{Pipeline, RunnableRef, CONFIG_FILE_NAME};
use crate::providers::run_data;
use crate::resolver;
use crate::runtime::container::DockerCli;
use crate::runtime::{run_macro, RunnableOptions};
use crate::{globals, RunContext, SharedRun};
use std::sync::Arc;
use std::time::Duration;
use togomak_expr::{Diagnostic, Diagnostics};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    run: SharedRun,
    handler: Arc<Handler>,
}

impl Orchestrator {
    pub fn new(config: Config) -> crate::Result<Orchestrator> {
        let handler = Handler::new();
        let pipeline_id = Uuid::new_v4();
        let tempdir = std::env::temp_dir().join(format!(".togomak-{}", pipeline_id));
        std::fs::create_dir_all(&tempdir)?;

        let ctx = globals::create_eval_context(&config, pipeline_id, &tempdir);
        let run = Arc::new(RunContext {
            ctx,
            config,
            tempdir,
            pipeline_id,
            container: Arc::new(DockerCli),
            terminate: handler.terminate.clone(),
            kill: handler.kill.clone(),
        });
        Ok(Orchestrator { run, handler })
    }

    pub fn run_context(&self) -> &SharedRun {
        &self.run
    }

    /// Execute the pipeline and return the process exit code.
    pub async fn perform(&self) -> i32 {
        self.handler.start_signal_listener();

        if let Err(diags) = self.perform_inner().await {
            self.handler.extend_diags(diags);
        }

        // The temp directory is kept when the run died from a signal, for
        // debugging.
        if !self.handler.interrupted() {
            let _ = std::fs::remove_dir_all(&self.run.tempdir);
        }
        self.handler.finish()
    }

    async fn perform_inner(&self) -> Result<(), Diagnostics> {
        let run = &self.run;
        debug!("reading pipeline from {}", run.config.paths.pipeline.display());
        let pipeline = Arc::new(Pipeline::load(&run.config.paths.pipeline)?);

        // Snapshot the merged pipeline into the run's temp directory.
        let snapshot = run.tempdir.join(CONFIG_FILE_NAME);
        if let Err(e) = std::fs::write(&snapshot, &pipeline.source) {
            return Err(Diagnostics::from(Diagnostic::error(
                "could not write pipeline snapshot",
                format!("{}: {}", snapshot.display(), e),
            )));
        }

        debug!("expanding local blocks");
        let local_diags = pipeline.expand_locals(run);
        if local_diags.has_errors() {
            return Err(local_diags);
        }
        self.handler.extend_diags(local_diags);

        debug!("generating dependency graph");
        let graph = graph::build(&pipeline)?;
        if let Ok(plan) = graph.execution_plan() {
            debug!("execution plan:\n{}", plan);
        }
        let layers = graph.sorted_layers()?;

        // Promote transitive prerequisites of whitelisted stages so a filter
        // like `togomak run deploy` still runs what deploy needs.
        let mut filter = run.config.filter.clone();
        if !filter.is_empty() {
            let items: Vec<String> = filter
                .iter()
                .filter(|item| item.behavior != crate::filter::FilterBehavior::Skip)
                .map(|item| format!("stage.{}", item.id))
                .collect();
            for key in items {
                for prerequisite in graph.transitive_prerequisites(&key) {
                    filter.promote(prerequisite);
                }
            }
        }

        // (daemon stage, node keys whose completion stops it)
        let mut daemon_watches: Vec<(Arc<Stage>, Vec<String>)> = Vec::new();

        debug!("starting runnables");
        'layers: for layer in layers {
            // Values exported during the previous layer become visible now.
            let refresh_diags = outputs::refresh(run);
            let refresh_failed = refresh_diags.has_errors();
            self.handler.extend_diags(refresh_diags);
            if refresh_failed {
                break;
            }

            let mut layer_tasks: Vec<JoinHandle<()>> = Vec::new();
            for node_key in layer {
                let Some(runnable) = pipeline.resolve(&node_key) else {
                    // Graph nodes come from the pipeline, so this is a bug
                    // rather than a user error; surface it as a diagnostic.
                    self.handler.extend_diags(
                        Diagnostic::error(
                            "unresolvable block",
                            format!("{} could not be resolved to a runnable", node_key),
                        )
                        .into(),
                    );
                    break 'layers;
                };

                match runnable {
                    RunnableRef::Macro(m) => {
                        // Publishing a macro is quick and synchronous.
                        let diags = run_macro(&m, run);
                        let failed = diags.has_errors();
                        self.handler.extend_diags(diags);
                        self.handler.mark_completed(&node_key);
                        if failed {
                            break 'layers;
                        }
                    }
                    RunnableRef::Data(data) => {
                        let task_run = run.clone();
                        let handler = self.handler.clone();
                        let key = node_key.clone();
                        let handle = tokio::spawn(async move {
                            let diags = run_data(&data, &task_run).await;
                            handler.extend_diags(diags);
                            handler.mark_completed(&key);
                        });
                        if run.config.behavior.dry_run {
                            let _ = handle.await;
                        } else {
                            layer_tasks.push(handle);
                        }
                    }
                    RunnableRef::Stage(stage) => {
                        let decision = filter.decide(&stage.id, &node_key, true);
                        let (ok, overridden) = if !decision.ok {
                            (false, false)
                        } else if decision.overridden {
                            (true, true)
                        } else {
                            let (ok, diags) = stage.can_run(run, &RunnableOptions::default());
                            let failed = diags.has_errors();
                            self.handler.extend_diags(diags);
                            if failed {
                                break 'layers;
                            }
                            (ok, false)
                        };

                        // The announcement runs even for skipped stages.
                        stage.prepare(!ok, overridden);
                        if !ok {
                            debug!("skipping {}, condition evaluated to false", node_key);
                            self.handler.mark_completed(&node_key);
                            continue;
                        }

                        let is_daemon = stage.is_daemon() || decision.daemon_only;
                        if is_daemon {
                            if let Some(lifecycle) =
                                stage.daemon.as_ref().and_then(|d| d.lifecycle.as_ref())
                            {
                                let watched = lifecycle
                                    .stop_when_complete
                                    .variables()
                                    .iter()
                                    .filter_map(resolver::resolve)
                                    .map(|r| r.node_key())
                                    .collect();
                                daemon_watches.push((stage.clone(), watched));
                            }
                            if let Some(timeout) =
                                stage.daemon.as_ref().map(|d| d.timeout).filter(|t| *t > 0)
                            {
                                let stage = stage.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(Duration::from_secs(timeout as u64)).await;
                                    warn!(stage = %stage.id, "daemon timeout reached, stopping");
                                    stage.request_terminate();
                                });
                            }
                        }

                        let handle = self.dispatch_stage(stage.clone(), pipeline.clone(), node_key.clone());
                        if is_daemon {
                            self.handler.track_daemon(stage, handle);
                        } else if run.config.behavior.dry_run {
                            let _ = handle.await;
                        } else {
                            layer_tasks.push(handle);
                        }
                    }
                }
            }

            // Layer barrier: every non-daemon runnable of this layer.
            for handle in layer_tasks {
                let _ = handle.await;
            }
            self.check_daemon_lifecycles(&daemon_watches);

            if self.handler.has_errors() {
                if self.handler.has_daemons() && !run.config.behavior.dry_run {
                    if run.config.behavior.unattended {
                        info!("pipeline failed, waiting for daemons to shut down...");
                        self.handler.request_terminate();
                    } else {
                        info!("pipeline failed, waiting for daemons to shut down");
                        info!("hit Ctrl+C to force stop them");
                    }
                }
                break;
            }
        }

        self.check_daemon_lifecycles(&daemon_watches);
        self.handler.daemon_wait().await;
        Ok(())
    }

    /// Dispatch a stage on a fresh task, wrapped with the retry policy.
    fn dispatch_stage(
        &self,
        stage: Arc<Stage>,
        pipeline: Arc<Pipeline>,
        node_key: String,
    ) -> JoinHandle<()> {
        let run = self.run.clone();
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let diags = run_stage_with_retries(&stage, &run, &pipeline).await;
            handler.extend_diags(diags);
            handler.mark_completed(&node_key);
        })
    }

    /// Stop every daemon whose watched runnables have all completed.
    fn check_daemon_lifecycles(&self, watches: &[(Arc<Stage>, Vec<String>)]) {
        for (stage, watched) in watches {
            if !watched.is_empty()
                && self.handler.all_completed(watched)
                && !stage.was_terminated()
            {
                info!(stage = %stage.id, "all watched runnables completed, stopping daemon");
                stage.request_terminate();
            }
        }
    }
}

/// Run a stage, re-dispatching on failure according to its retry block.
/// Back-off doubles per attempt when exponential, clamped to `max_backoff`.
async fn run_stage_with_retries(
    stage: &Arc<Stage>,
    run: &SharedRun,
    pipeline: &Arc<Pipeline>,
) -> Diagnostics {
    let opts = RunnableOptions::default();
    let mut diags = Diagnostics::new();
    let mut attempt: i64 = 1;
    loop {
        let d = stage.run(run, pipeline, &opts).await;
        let failed = d.has_errors();
        diags.extend(d);
        if !failed {
            // Publish the stage's namespace entry; anything the stage
            // exported through TOGOMAK_OUTPUTS lands in `output` at the
            // next layer refresh.
            run.ctx.publish(
                "stage",
                &[&stage.id],
                togomak_expr::Value::object_of(vec![
                    ("id".to_string(), togomak_expr::Value::from(stage.id.as_str())),
                    (
                        "name".to_string(),
                        togomak_expr::Value::from(
                            stage.name.clone().unwrap_or_else(|| stage.id.clone()),
                        ),
                    ),
                    (
                        "status".to_string(),
                        togomak_expr::Value::from(crate::runtime::Status::Success.as_str()),
                    ),
                ]),
            );
            return diags;
        }
        let Some(retry) = stage.retry.as_ref().filter(|r| r.enabled) else {
            return diags;
        };
        if attempt >= retry.attempts {
            return diags;
        }

        let backoff = if retry.exponential_backoff {
            let doubled = retry
                .min_backoff
                .saturating_mul(1i64 << (attempt - 1).min(32));
            doubled.min(retry.max_backoff.max(retry.min_backoff))
        } else {
            retry.min_backoff
        };
        warn!(
            stage = %stage.id,
            "attempt {}/{} failed, retrying in {}s", attempt, retry.attempts, backoff
        );
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(backoff.max(0) as u64)) => {}
            _ = run.kill.cancelled() => return diags,
        }
        attempt += 1;
    }
}

/// Build an orchestrator-free engine entry point used by `togomak list`.
pub fn load_pipeline(config: &Config) -> Result<Pipeline, Diagnostics> {
    Pipeline::load(&config.paths.pipeline)
}
