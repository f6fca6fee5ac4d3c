use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CommitId, Selection};
use crate::{new_id, now_ms};

/// Result of comparing the machine id a configuration expects with the local one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineIdCheck {
    /// Machine id the evaluated configuration targets.
    pub expected: String,
    /// Machine id of this host, if known.
    pub actual: Option<String>,
}

impl MachineIdCheck {
    /// True only when the local id is known and equal.
    pub fn matches(&self) -> bool {
        self.actual.as_deref() == Some(self.expected.as_str())
    }
}

/// A successful evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evaluation {
    /// Evaluation start.
    pub started_at_ms: i64,
    /// Evaluation end.
    pub ended_at_ms: i64,
    /// Derivation to build.
    pub drv_path: String,
    /// Output path the build produces.
    pub out_path: String,
}

/// Evaluate then build, as one tagged lifecycle.
///
/// Transitions:
/// `Init -> Evaluating -> {EvalFailed, Evaluated}`,
/// `Evaluated | BuildFailed -> Building -> {BuildFailed, Built}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created, not started.
    Init,
    /// Evaluation running.
    Evaluating {
        started_at_ms: i64,
    },
    /// Evaluation failed, timed out or was cancelled.
    EvalFailed {
        started_at_ms: i64,
        ended_at_ms: i64,
        error: String,
    },
    /// Evaluation succeeded; ready to build.
    Evaluated {
        eval: Evaluation,
    },
    /// Build running.
    Building {
        eval: Evaluation,
        started_at_ms: i64,
    },
    /// Build failed; may be retried.
    BuildFailed {
        eval: Evaluation,
        started_at_ms: i64,
        ended_at_ms: i64,
        error: String,
    },
    /// Build succeeded; ready to deploy.
    Built {
        eval: Evaluation,
        started_at_ms: i64,
        ended_at_ms: i64,
    },
}

impl Lifecycle {
    /// Snake-case state name, as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Init => "init",
            Lifecycle::Evaluating { .. } => "evaluating",
            Lifecycle::EvalFailed { .. } => "eval_failed",
            Lifecycle::Evaluated { .. } => "evaluated",
            Lifecycle::Building { .. } => "building",
            Lifecycle::BuildFailed { .. } => "build_failed",
            Lifecycle::Built { .. } => "built",
        }
    }
}

/// Flattened evaluation status, for display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    /// No evaluation yet.
    Init,
    /// Evaluation running.
    Evaluating,
    /// Evaluation succeeded.
    Evaluated,
    /// Evaluation failed.
    Failed,
}

/// Flattened build status, for display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// No build yet.
    Init,
    /// Build running.
    Building,
    /// Build succeeded.
    Built,
    /// Build failed.
    Failed,
}

/// A lifecycle transition that is not allowed from the current state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// Build requested before a successful evaluation.
    #[error("generation {0} is not evaluated")]
    NotEvaluated(String),
    /// Build requested while one is running.
    #[error("generation {0} is already building")]
    AlreadyBuilding(String),
    /// Build requested after a successful build.
    #[error("generation {0} is already built")]
    AlreadyBuilt(String),
    /// Any other out-of-order transition.
    #[error("generation {id} cannot {action} while {state}")]
    Invalid {
        id: String,
        action: &'static str,
        state: &'static str,
    },
}

/// One evaluate+build attempt for one selected commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generation {
    /// Generation id.
    pub id: String,
    /// Creation time.
    pub created_at_ms: i64,
    /// Host the configuration is evaluated for.
    pub hostname: String,
    /// Flake reference pinned to the selected commit.
    pub flake_url: String,

    /// Selection valid when the generation was created.
    pub selection: Selection,
    /// Accepted main commit at creation time.
    pub main_commit_id: Option<CommitId>,

    /// Evaluate/build progress.
    pub lifecycle: Lifecycle,
    /// Machine id check, when the configuration declares one.
    pub machine_id: Option<MachineIdCheck>,
}

impl Generation {
    /// New generation in `Init` for `selection`.
    pub fn new(
        selection: Selection,
        main_commit_id: Option<CommitId>,
        flake_url: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            created_at_ms: now_ms(),
            hostname: hostname.into(),
            flake_url: flake_url.into(),
            selection,
            main_commit_id,
            lifecycle: Lifecycle::Init,
            machine_id: None,
        }
    }

    /// Selected commit.
    pub fn commit_id(&self) -> &str {
        &self.selection.commit_id
    }

    /// Selected from a testing branch.
    pub fn is_testing(&self) -> bool {
        self.selection.is_testing
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::Invalid {
            id: self.id.clone(),
            action,
            state: self.lifecycle.name(),
        }
    }

    /// Moves `Init` to `Evaluating`.
    pub fn begin_eval(&mut self, now: i64) -> Result<(), TransitionError> {
        match self.lifecycle {
            Lifecycle::Init => {
                self.lifecycle = Lifecycle::Evaluating { started_at_ms: now };
                Ok(())
            }
            _ => Err(self.invalid("start evaluating")),
        }
    }

    /// Records the end of the evaluation. `Ok` carries `(drv_path, out_path)`.
    pub fn finish_eval(
        &mut self,
        now: i64,
        result: Result<(String, String), String>,
    ) -> Result<(), TransitionError> {
        let Lifecycle::Evaluating { started_at_ms } = self.lifecycle else {
            return Err(self.invalid("finish evaluating"));
        };
        self.lifecycle = match result {
            Ok((drv_path, out_path)) => Lifecycle::Evaluated {
                eval: Evaluation {
                    started_at_ms,
                    ended_at_ms: now,
                    drv_path,
                    out_path,
                },
            },
            Err(error) => Lifecycle::EvalFailed {
                started_at_ms,
                ended_at_ms: now,
                error,
            },
        };
        Ok(())
    }

    /// Moves to `Building` and returns the derivation to build.
    ///
    /// A failed build may be retried.
    pub fn begin_build(&mut self, now: i64) -> Result<String, TransitionError> {
        let eval = match &self.lifecycle {
            Lifecycle::Evaluated { eval } | Lifecycle::BuildFailed { eval, .. } => eval.clone(),
            Lifecycle::Building { .. } => {
                return Err(TransitionError::AlreadyBuilding(self.id.clone()))
            }
            Lifecycle::Built { .. } => return Err(TransitionError::AlreadyBuilt(self.id.clone())),
            Lifecycle::Init | Lifecycle::Evaluating { .. } | Lifecycle::EvalFailed { .. } => {
                return Err(TransitionError::NotEvaluated(self.id.clone()))
            }
        };
        let drv_path = eval.drv_path.clone();
        self.lifecycle = Lifecycle::Building {
            eval,
            started_at_ms: now,
        };
        Ok(drv_path)
    }

    /// Records the end of the build.
    pub fn finish_build(&mut self, now: i64, result: Result<(), String>) -> Result<(), TransitionError> {
        let Lifecycle::Building { eval, started_at_ms } = &self.lifecycle else {
            return Err(self.invalid("finish building"));
        };
        let (eval, started_at_ms) = (eval.clone(), *started_at_ms);
        self.lifecycle = match result {
            Ok(()) => Lifecycle::Built {
                eval,
                started_at_ms,
                ended_at_ms: now,
            },
            Err(error) => Lifecycle::BuildFailed {
                eval,
                started_at_ms,
                ended_at_ms: now,
                error,
            },
        };
        Ok(())
    }

    /// Evaluation part of the lifecycle.
    pub fn eval_status(&self) -> EvalStatus {
        match self.lifecycle {
            Lifecycle::Init => EvalStatus::Init,
            Lifecycle::Evaluating { .. } => EvalStatus::Evaluating,
            Lifecycle::EvalFailed { .. } => EvalStatus::Failed,
            _ => EvalStatus::Evaluated,
        }
    }

    /// Build part of the lifecycle.
    pub fn build_status(&self) -> BuildStatus {
        match self.lifecycle {
            Lifecycle::Building { .. } => BuildStatus::Building,
            Lifecycle::BuildFailed { .. } => BuildStatus::Failed,
            Lifecycle::Built { .. } => BuildStatus::Built,
            _ => BuildStatus::Init,
        }
    }

    /// The successful evaluation, if any.
    pub fn evaluation(&self) -> Option<&Evaluation> {
        match &self.lifecycle {
            Lifecycle::Evaluated { eval }
            | Lifecycle::Building { eval, .. }
            | Lifecycle::BuildFailed { eval, .. }
            | Lifecycle::Built { eval, .. } => Some(eval),
            _ => None,
        }
    }

    /// Output path, once evaluated.
    pub fn out_path(&self) -> Option<&str> {
        self.evaluation().map(|e| e.out_path.as_str())
    }

    /// Error of a failed evaluation or build.
    pub fn error(&self) -> Option<&str> {
        match &self.lifecycle {
            Lifecycle::EvalFailed { error, .. } | Lifecycle::BuildFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Evaluated and not yet building.
    pub fn is_evaluated(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Evaluated { .. })
    }

    /// Build succeeded.
    pub fn is_built(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Built { .. })
    }

    /// Evaluation or build ended in an error.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.lifecycle,
            Lifecycle::EvalFailed { .. } | Lifecycle::BuildFailed { .. }
        )
    }
}
