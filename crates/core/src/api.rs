use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::deployment::Deployment;
use crate::generation::Generation;
use crate::model::RepositoryStatus;

/// The two confirmation checkpoints of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Gates evaluated generations before they are built.
    Build,
    /// Gates built generations before they are deployed.
    Deploy,
}

impl GateKind {
    /// Name used in routes and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Build => "build",
            GateKind::Deploy => "deploy",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(GateKind::Build),
            "deploy" => Ok(GateKind::Deploy),
            other => Err(format!("unknown gate '{other}' (expected build or deploy)")),
        }
    }
}

/// Fetch request. An empty list means every configured remote.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FetchRequest {
    /// Remote names to fetch.
    #[serde(default)]
    pub remotes: Vec<String>,
}

/// Builder snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BuilderState {
    /// An evaluation is in flight.
    pub evaluating: bool,
    /// A build is in flight.
    pub building: bool,
    /// Most recent generation, finished or not.
    pub generation: Option<Generation>,
}

/// Confirmer snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConfirmationStatus {
    /// `without`, `manual` or `auto`.
    pub mode: String,
    /// Auto-confirm delay in seconds, `auto` mode only.
    pub auto_confirm_secs: Option<u64>,
    /// Generation id waiting for confirmation.
    pub submitted: Option<String>,
    /// Generation id confirmed ahead of its submission.
    pub confirmed: Option<String>,
    /// The auto-confirm timer is running.
    pub auto_armed: bool,
    /// When the auto-confirm timer was armed.
    pub auto_started_at_ms: Option<i64>,
}

/// Controller lane snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LaneStatus {
    /// Disabled lanes pass every id straight through.
    pub enabled: bool,
    /// Id the pipeline is waiting on.
    pub needed: Option<String>,
    /// Id approved to pass.
    pub allowed: Option<String>,
}

/// One confirmation gate: confirmer plus controller lane.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GateStatus {
    /// Confirmer state.
    pub confirmation: ConfirmationStatus,
    /// Controller lane state.
    pub lane: LaneStatus,
}

/// Deployment queue snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeployerStatus {
    /// Current (or last) deployment.
    pub deployment: Option<Deployment>,
    /// Deployment before `deployment`.
    pub previous: Option<Deployment>,
    /// Generation id waiting in the queue slot.
    pub pending: Option<String>,
    /// A deployment is running right now.
    pub is_deploying: bool,
    /// Suspend was requested.
    pub is_suspended: bool,
    /// The worker is parked by a suspend.
    pub is_parked: bool,
}

/// Aggregated daemon state returned by `GET /api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Host this daemon reconciles.
    pub hostname: String,
    /// Remotes and selection.
    pub repository: RepositoryStatus,
    /// Evaluation and build.
    pub builder: BuilderState,
    /// Gate in front of the build.
    pub build_gate: GateStatus,
    /// Gate in front of the deployment.
    pub deploy_gate: GateStatus,
    /// Deployment queue.
    pub deployer: DeployerStatus,
}

/// Generic acknowledgement for control actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResponse {
    /// Whether the action was accepted.
    pub ok: bool,
    /// Human-readable outcome.
    pub message: Option<String>,
}

impl ActionResponse {
    /// Successful response with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
        }
    }
}
