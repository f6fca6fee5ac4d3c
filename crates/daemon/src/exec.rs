use std::future::Future;
use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use gitops_core::deployment::Operation;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::config::ExecutorConfig;

/// What an evaluation produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvalOutput {
    /// Derivation to realise.
    pub drv_path: String,
    /// Output path of the system closure.
    pub out_path: String,
    /// Machine id the configuration is meant for, if it declares one.
    #[serde(default)]
    pub machine_id: Option<String>,
}

/// What an activation reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeployOutput {
    /// The host should be rebooted.
    #[serde(default)]
    pub restart_required: bool,
    /// Profile the activation updated.
    #[serde(default)]
    pub profile_path: Option<String>,
}

/// Evaluates, builds and activates configurations.
///
/// Futures are dropped on cancellation; implementations must not leave work
/// running behind them.
pub trait Executor: Send + Sync + 'static {
    /// Evaluates the configuration of `hostname` at `flake_url`.
    fn eval(&self, flake_url: &str, hostname: &str) -> impl Future<Output = Result<EvalOutput>> + Send;

    /// Builds an evaluated derivation.
    fn build(&self, drv_path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Activates a built output.
    fn deploy(
        &self,
        out_path: &str,
        operation: Operation,
    ) -> impl Future<Output = Result<DeployOutput>> + Send;
}

/// Flake reference pinning the local mirror at `commit`.
pub fn flake_url(repo: &Path, commit: &str) -> String {
    format!("git+file://{}?rev={commit}", repo.display())
}

/// Runs the configured shell templates.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    eval_command: String,
    build_command: String,
    deploy_command: String,
}

impl CommandExecutor {
    /// Executor for the `[executor]` templates.
    pub fn new(cfg: &ExecutorConfig) -> Self {
        Self {
            eval_command: cfg.eval_command.clone(),
            build_command: cfg.build_command.clone(),
            deploy_command: cfg.deploy_command.clone(),
        }
    }

    async fn run(&self, what: &str, template: &str, vars: &[(&str, &str)]) -> Result<String> {
        let command = render(template, vars);
        debug!(%what, %command, "running");
        let out = sh(&command, vars).await?;
        if !out.status.success() {
            bail!(
                "{what} command exited with {}: {}",
                out.status,
                tail(&String::from_utf8_lossy(&out.stderr))
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

impl Executor for CommandExecutor {
    async fn eval(&self, flake_url: &str, hostname: &str) -> Result<EvalOutput> {
        let flake_ref = format!("{flake_url}#nixosConfigurations.{hostname}");
        let vars = [
            ("flake_url", flake_url),
            ("flake_ref", flake_ref.as_str()),
            ("hostname", hostname),
        ];
        let stdout = self.run("eval", &self.eval_command, &vars).await?;
        serde_json::from_str(last_line(&stdout)).context("parsing eval output")
    }

    async fn build(&self, drv_path: &str) -> Result<()> {
        self.run("build", &self.build_command, &[("drv_path", drv_path)])
            .await?;
        Ok(())
    }

    async fn deploy(&self, out_path: &str, operation: Operation) -> Result<DeployOutput> {
        let vars = [("out_path", out_path), ("operation", operation.as_str())];
        let stdout = self.run("deploy", &self.deploy_command, &vars).await?;
        let line = last_line(&stdout);
        if line.is_empty() {
            return Ok(DeployOutput::default());
        }
        match serde_json::from_str(line) {
            Ok(out) => Ok(out),
            Err(e) => {
                debug!(error = %e, "deploy output is not json, assuming defaults");
                Ok(DeployOutput::default())
            }
        }
    }
}

/// Replaces `${name}` placeholders with shell-quoted values.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("${{{key}}}"), &shell_quote(value))
    })
}

/// Single-quotes `value` unless it only has shell-safe characters.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Runs `command` through `sh -c`, exporting every var as `GITOPS_<NAME>`.
pub(crate) async fn sh(command: &str, vars: &[(&str, &str)]) -> Result<Output> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in vars {
        cmd.env(format!("GITOPS_{}", key.to_ascii_uppercase()), value);
    }
    cmd.output()
        .await
        .with_context(|| format!("spawning sh -c {command}"))
}

fn last_line(s: &str) -> &str {
    s.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn tail(s: &str) -> String {
    let lines: Vec<&str> = s.trim().lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}
