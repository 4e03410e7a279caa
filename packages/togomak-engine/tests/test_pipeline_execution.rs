//! End-to-end pipeline execution tests.
//!
//! Each test writes a pipeline into a temp directory and drives the
//! orchestrator the same way the CLI does, with unattended behavior so no
//! test ever blocks on a prompt.

use std::path::Path;
use std::time::{Duration, Instant};
use togomak_engine::filter::FilterList;
use togomak_engine::{Behavior, Child, Config, Orchestrator, Paths};

fn test_config(dir: &Path, filter: &[&str]) -> Config {
    Config {
        behavior: Behavior {
            unattended: true,
            ci: false,
            dry_run: false,
            child: Child::default(),
        },
        paths: Paths {
            pipeline: dir.join("togomak.hcl"),
            cwd: dir.to_path_buf(),
            owd: dir.to_path_buf(),
        },
        hostname: "testhost".to_string(),
        user: "tester".to_string(),
        filter: FilterList::parse(filter.iter().copied()),
    }
}

async fn perform_in(dir: &Path, source: &str, filter: &[&str]) -> i32 {
    std::fs::write(dir.join("togomak.hcl"), source).unwrap();
    let orchestrator = Orchestrator::new(test_config(dir, filter)).unwrap();
    orchestrator.perform().await
}

async fn perform(source: &str) -> (i32, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let code = perform_in(dir.path(), source, &[]).await;
    (code, dir)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_linear_stages_share_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let result = dir.path().join("result.txt");
    let source = format!(
        r#"
stage "a" {{
  script = "echo MSG=hi >> $TOGOMAK_OUTPUTS"
}}

stage "b" {{
  depends_on = [stage.a]
  script     = "printf %s '${{output.MSG}}' > {result}"
}}
"#,
        result = result.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&result).unwrap(), "hi");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conditional_skip_is_not_a_failure() {
    let (code, _dir) = perform(
        r#"
stage "x" {
  if     = false
  script = "exit 1"
}
"#,
    )
    .await;
    assert_eq!(code, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cycle_is_fatal_before_any_stage_runs() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran.txt");
    let source = format!(
        r#"
stage "a" {{
  depends_on = [stage.b]
  script     = "touch {marker}"
}}

stage "b" {{
  depends_on = [stage.a]
  script     = "touch {marker}"
}}
"#,
        marker = marker.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_ne!(code, 0);
    assert!(!marker.exists(), "no stage may run when the graph is cyclic");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_runs_attempts_times_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts.txt");
    let source = format!(
        r#"
stage "f" {{
  retry {{
    enabled             = true
    attempts            = 3
    exponential_backoff = false
    min_backoff         = 1
    max_backoff         = 5
  }}
  script = "echo run >> {counter}; exit 2"
}}
"#,
        counter = counter.display()
    );
    let started = Instant::now();
    let code = perform_in(dir.path(), &source, &[]).await;
    let elapsed = started.elapsed();

    assert_ne!(code, 0);
    let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(attempts, 3);
    assert!(elapsed >= Duration::from_secs(2), "two backoffs of 1s each");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prompt_unattended_uses_default() {
    let dir = tempfile::tempdir().unwrap();
    let result = dir.path().join("greeting.txt");
    let source = format!(
        r#"
data "prompt" "name" {{
  prompt  = "Name?"
  default = "anon"
}}

stage "greet" {{
  script = "printf %s '${{data.prompt.name.value}}' > {result}"
}}
"#,
        result = result.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&result).unwrap(), "anon");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prompt_env_override_wins() {
    std::env::set_var("TOGOMAK__prompt__city", "berlin");
    let dir = tempfile::tempdir().unwrap();
    let result = dir.path().join("city.txt");
    let source = format!(
        r#"
data "prompt" "city" {{
  default = "nowhere"
}}

stage "echo" {{
  script = "printf %s '${{data.prompt.city.value}}' > {result}"
}}
"#,
        result = result.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    std::env::remove_var("TOGOMAK__prompt__city");
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&result).unwrap(), "berlin");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_daemon_stops_when_watched_stage_completes() {
    let source = r#"
stage "server" {
  daemon {
    enabled = true
    lifecycle {
      stop_when_complete = [stage.test]
    }
  }
  script = "sleep 60"
}

stage "test" {
  depends_on = [stage.server]
  script     = "true"
}
"#;
    let started = Instant::now();
    let (code, _dir) = perform(source).await;
    assert_eq!(code, 0);
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "pipeline must not wait for the daemon's full sleep"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_for_each_runs_one_instance_per_element() {
    let dir = tempfile::tempdir().unwrap();
    let source = format!(
        r#"
stage "emit" {{
  for_each = ["red", "green", "blue"]
  script   = "touch {dir}/${{each.value}}.txt"
}}
"#,
        dir = dir.path().display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_eq!(code, 0);
    for color in ["red", "green", "blue"] {
        assert!(dir.path().join(format!("{}.txt", color)).exists());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_locals_and_env_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let result = dir.path().join("release.txt");
    let source = format!(
        r#"
locals {{
  version = "1.2.3"
  tag     = "v${{local.version}}"
}}

stage "release" {{
  env {{
    name  = "RELEASE_TAG"
    value = local.tag
  }}
  script = "printf %s \"$RELEASE_TAG\" > {result}"
}}
"#,
        result = result.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&result).unwrap(), "v1.2.3");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inline_macro_template_merge() {
    let dir = tempfile::tempdir().unwrap();
    let result = dir.path().join("macro.txt");
    let source = format!(
        r#"
macro "greeter" {{
  stage {{
    script = "printf hello > {result}"
  }}
}}

stage "use_it" {{
  use {{
    macro = macro.greeter
  }}
}}
"#,
        result = result.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&result).unwrap(), "hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_hook_runs_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("hook-status.txt");
    let source = format!(
        r#"
stage "flaky" {{
  script = "exit 3"

  post_hook {{
    stage {{
      script = "printf %s '${{this.status}}' > {marker}"
    }}
  }}
}}
"#,
        marker = marker.display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_ne!(code, 0);
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "failure");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_filter_skips_unlisted_and_promotes_prerequisites() {
    let dir = tempfile::tempdir().unwrap();
    let source = format!(
        r#"
stage "base" {{
  script = "touch {dir}/base.txt"
}}

stage "deploy" {{
  depends_on = [stage.base]
  script     = "touch {dir}/deploy.txt"
}}

stage "unrelated" {{
  script = "touch {dir}/unrelated.txt"
}}
"#,
        dir = dir.path().display()
    );
    let code = perform_in(dir.path(), &source, &["deploy"]).await;
    assert_eq!(code, 0);
    assert!(dir.path().join("deploy.txt").exists());
    assert!(
        dir.path().join("base.txt").exists(),
        "prerequisites of whitelisted stages are promoted"
    );
    assert!(!dir.path().join("unrelated.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forced_filter_overrides_condition() {
    let dir = tempfile::tempdir().unwrap();
    let source = format!(
        r#"
stage "gated" {{
  if     = false
  script = "touch {dir}/gated.txt"
}}
"#,
        dir = dir.path().display()
    );
    let code = perform_in(dir.path(), &source, &["+gated"]).await;
    assert_eq!(code, 0);
    assert!(dir.path().join("gated.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_stops_later_layers() {
    let dir = tempfile::tempdir().unwrap();
    let source = format!(
        r#"
stage "broken" {{
  script = "exit 1"
}}

stage "after" {{
  depends_on = [stage.broken]
  script     = "touch {dir}/after.txt"
}}
"#,
        dir = dir.path().display()
    );
    let code = perform_in(dir.path(), &source, &[]).await;
    assert_ne!(code, 0);
    assert!(!dir.path().join("after.txt").exists());
}
