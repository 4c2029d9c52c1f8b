//! Chart deployer backed by the `helm` binary.
//!
//! Install deliberately runs without `--wait`/`--atomic`: chart init jobs
//! may take minutes, and blocking the install call would conflate readiness
//! with installation. Readiness is observed independently by the
//! provisioner's poll loop.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::deploy::{ChartDeployer, DeployError, InstallOutcome, InstallRequest, UninstallOutcome};

/// Default per-command timeout for chart tool invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// `helm` CLI wrapper.
pub struct HelmClient {
    timeout: Duration,
    kubeconfig: Option<PathBuf>,
}

impl HelmClient {
    /// Creates a client with an explicit command timeout.
    #[must_use]
    pub const fn new(timeout: Duration, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            timeout,
            kubeconfig,
        }
    }

    /// Creates a client from configuration with the default timeout.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT, config.kubeconfig.clone())
    }

    async fn run<I, S>(&self, args: I) -> Result<std::process::Output, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("helm");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => Err(DeployError::TimedOut(self.timeout)),
            Ok(Err(e)) => {
                let message = format!("failed to run helm: {e}");
                Err(DeployError::Io { message, source: e })
            }
            Ok(Ok(output)) => Ok(output),
        }
    }
}

#[async_trait]
impl ChartDeployer for HelmClient {
    async fn install(&self, request: InstallRequest) -> Result<InstallOutcome, DeployError> {
        if self
            .release_exists(&request.release, &request.namespace)
            .await?
        {
            debug!(release = %request.release, "release already exists, skipping install");
            return Ok(InstallOutcome::AlreadyExists);
        }

        let args = install_args(&request);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(DeployError::Failed(failure_text(&output)));
        }
        Ok(InstallOutcome::Installed {
            output: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        })
    }

    async fn uninstall(
        &self,
        release: &str,
        namespace: &str,
    ) -> Result<UninstallOutcome, DeployError> {
        if !self.release_exists(release, namespace).await? {
            return Ok(UninstallOutcome::AlreadyRemoved);
        }

        let output = self
            .run(["uninstall", release, "--namespace", namespace, "--wait"])
            .await?;
        if output.status.success() {
            return Ok(UninstallOutcome::Uninstalled);
        }
        let text = failure_text(&output);
        if text.contains("not found") {
            return Ok(UninstallOutcome::AlreadyRemoved);
        }
        Err(DeployError::Failed(text))
    }

    async fn release_exists(&self, release: &str, namespace: &str) -> Result<bool, DeployError> {
        let output = self
            .run(["status", release, "--namespace", namespace])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let text = failure_text(&output);
        if text.contains("not found") {
            return Ok(false);
        }
        Err(DeployError::Failed(text))
    }
}

/// Builds the argv for `helm install`. Values go through `--set` pairs so no
/// temporary values file is needed.
fn install_args(request: &InstallRequest) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        request.release.clone(),
        request.chart_path.display().to_string(),
        "--namespace".to_string(),
        request.namespace.clone(),
    ];
    if request.create_namespace {
        args.push("--create-namespace".to_string());
    }
    for (key, value) in &request.values {
        args.push("--set".to_string());
        args.push(format!("{key}={value}"));
    }
    args
}

/// stderr, falling back to stdout, falling back to the exit status.
fn failure_text(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("exited with {}", output.status)
}
