use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use gitops_core::deployment::Deployment;
use tracing::debug;

use crate::exec::{render, sh};

/// A shell command run against a finished deployment.
#[derive(Debug, Clone)]
pub struct Hook {
    name: &'static str,
    template: String,
    timeout: Duration,
}

impl Hook {
    /// `name` is used in logs and errors.
    pub fn new(name: &'static str, template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name,
            template: template.into(),
            timeout,
        }
    }

    /// Runs the hook. A non-zero exit or a timeout is an error.
    pub async fn run(&self, deployment: &Deployment) -> Result<()> {
        let vars = deployment_vars(deployment);
        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let command = render(&self.template, &vars);
        debug!(hook = self.name, deployment_id = %deployment.id, %command, "running hook");

        let out = tokio::time::timeout(self.timeout, sh(&command, &vars))
            .await
            .map_err(|_| anyhow!("{} timed out after {}s", self.name, self.timeout.as_secs()))??;
        if !out.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.name,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Template variables describing a deployment. Exported as `GITOPS_<NAME>` too.
pub fn deployment_vars(d: &Deployment) -> Vec<(&'static str, String)> {
    let g = &d.generation;
    vec![
        ("deployment_id", d.id.clone()),
        ("generation_id", g.id.clone()),
        ("commit_id", g.commit_id().to_string()),
        ("remote", g.selection.remote_name.clone()),
        ("branch", g.selection.branch_name.clone()),
        ("operation", d.operation.as_str().to_string()),
        ("out_path", g.out_path().unwrap_or_default().to_string()),
        ("profile_path", d.profile_path.clone().unwrap_or_default()),
        ("status", d.status.as_str().to_string()),
    ]
}
