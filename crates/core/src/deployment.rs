use std::fmt;

use serde::{Deserialize, Serialize};

use crate::generation::Generation;
use crate::{new_id, now_ms};

/// How a built generation is activated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Activate and make it the boot default.
    Switch,
    /// Activate without touching the boot default.
    Test,
}

impl Operation {
    /// Testing selections are only tried, main selections are switched to.
    pub fn for_testing(is_testing: bool) -> Self {
        if is_testing {
            Operation::Test
        } else {
            Operation::Switch
        }
    }

    /// Argument passed to the activation command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Switch => "switch",
            Operation::Test => "test",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a deployment is in its run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Not started.
    Init,
    /// Activation in progress.
    Running,
    /// Activated and passed the liveliness check.
    Done,
    /// Activation or liveliness check failed.
    Failed,
}

impl DeploymentStatus {
    /// Lowercase name, as exported to hooks.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Init => "init",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Done => "done",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// One attempt to activate a built generation on the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Deployment id.
    pub id: String,
    /// The generation being activated.
    pub generation: Generation,
    /// Switch or test.
    pub operation: Operation,
    /// Start time.
    pub started_at_ms: i64,
    /// End time, once finished.
    pub ended_at_ms: Option<i64>,
    /// Current status.
    pub status: DeploymentStatus,
    /// Activation asked for a reboot.
    pub restart_required: bool,
    /// System profile the activation wrote.
    pub profile_path: Option<String>,
    /// Failure message.
    pub error: Option<String>,
}

impl Deployment {
    /// Starts a deployment of `generation`; the operation follows its testing flag.
    pub fn start(generation: Generation) -> Self {
        let operation = Operation::for_testing(generation.is_testing());
        Self {
            id: new_id(),
            generation,
            operation,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            status: DeploymentStatus::Running,
            restart_required: false,
            profile_path: None,
            error: None,
        }
    }

    /// Marks the activation as successful.
    pub fn succeed(&mut self, restart_required: bool, profile_path: Option<String>) {
        self.ended_at_ms = Some(now_ms());
        self.status = DeploymentStatus::Done;
        self.restart_required = restart_required;
        self.profile_path = profile_path;
    }

    /// Marks the deployment failed. Keeps an earlier end time.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.ended_at_ms.get_or_insert_with(now_ms);
        self.status = DeploymentStatus::Failed;
        self.error = Some(error.into());
    }

    /// Done or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, DeploymentStatus::Done | DeploymentStatus::Failed)
    }

    /// True when `generation` targets the same commit with the same operation.
    pub fn targets(&self, generation: &Generation) -> bool {
        self.generation.commit_id() == generation.commit_id()
            && self.generation.is_testing() == generation.is_testing()
    }
}
