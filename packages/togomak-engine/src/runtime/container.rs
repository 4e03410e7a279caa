//! Container execution seam.
//!
//! The engine never links a container daemon client; it talks to a
//! [`ContainerRuntime`] trait with pull/create/start/logs/wait/remove
//! operations. The default implementation shells out to the `docker` CLI.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct PortMapping {
    pub host: Option<String>,
    pub container_port: String,
    pub port: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub workdir: String,
    pub env: Vec<String>,
    /// `source:destination` bind mounts.
    pub binds: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub entrypoint: Option<Vec<String>>,
    pub stdin: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, String>;
    /// Pull an image, streaming progress to the log.
    async fn pull(&self, image: &str) -> Result<(), String>;
    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, String>;
    async fn start(&self, id: &str) -> Result<(), String>;
    /// Follow the container's output, streaming stdout at info and stderr at
    /// warn, until the container exits.
    async fn logs(&self, id: &str, stage: &str) -> Result<(), String>;
    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64, String>;
    /// Remove the container together with its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), String>;
}

/// `docker`-CLI-backed runtime.
pub struct DockerCli;

impl DockerCli {
    async fn run(args: &[&str]) -> Result<String, String> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("could not invoke docker: {}", e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool, String> {
        Ok(Self::run(&["image", "inspect", image]).await.is_ok())
    }

    async fn pull(&self, image: &str) -> Result<(), String> {
        let mut child = Command::new("docker")
            .args(["pull", image])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| format!("could not invoke docker: {}", e))?;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(image = image, "{}", line);
            }
        }
        let status = child
            .wait()
            .await
            .map_err(|e| format!("docker pull failed: {}", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("docker pull {} exited with {}", image, status))
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--tty".into(),
            "--workdir".into(),
            spec.workdir.clone(),
        ];
        if spec.stdin {
            args.push("--interactive".into());
        }
        for bind in &spec.binds {
            args.push("--volume".into());
            args.push(bind.clone());
        }
        for port in &spec.ports {
            args.push("--publish".into());
            match &port.host {
                Some(host) => {
                    args.push(format!("{}:{}:{}", host, port.port, port.container_port))
                }
                None => args.push(format!("{}:{}", port.port, port.container_port)),
            }
        }
        for env in &spec.env {
            args.push("--env".into());
            args.push(env.clone());
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.join(" "));
        }
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::run(&arg_refs).await
    }

    async fn start(&self, id: &str) -> Result<(), String> {
        Self::run(&["start", id]).await.map(|_| ())
    }

    async fn logs(&self, id: &str, stage: &str) -> Result<(), String> {
        let mut child = Command::new("docker")
            .args(["logs", "--follow", id])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| format!("could not follow container logs: {}", e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stage_out = stage.to_string();
        let out_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(stage = %stage_out, "{}", line);
                }
            }
        });
        let stage_err = stage.to_string();
        let err_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(stage = %stage_err, "{}", line);
                }
            }
        });
        let _ = child.wait().await;
        let _ = out_task.await;
        let _ = err_task.await;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, String> {
        let code = Self::run(&["wait", id]).await?;
        code.trim()
            .parse::<i64>()
            .map_err(|_| format!("unexpected docker wait output: {:?}", code))
    }

    async fn remove(&self, id: &str) -> Result<(), String> {
        Self::run(&["rm", "--volumes", id]).await.map(|_| ())
    }
}
