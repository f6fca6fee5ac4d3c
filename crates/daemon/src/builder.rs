use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gitops_core::api::BuilderState;
use gitops_core::generation::{Generation, Lifecycle, MachineIdCheck};
use gitops_core::model::RepositoryStatus;
use gitops_core::now_ms;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::BuildError;
use crate::exec::{flake_url, EvalOutput, Executor};
use crate::task::{Exec, Outcome};

/// Static settings of a [`Builder`].
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Host whose configuration is evaluated.
    pub hostname: String,
    /// Local mirror the flake url points at.
    pub repo_path: PathBuf,
    /// This host's machine id, checked against the evaluated one.
    pub local_machine_id: Option<String>,
    /// Limit for one evaluation.
    pub eval_timeout: Duration,
    /// Limit for one build.
    pub build_timeout: Duration,
}

/// Turns selected commits into built generations.
///
/// At most one evaluation or build runs at a time. A new `eval` preempts
/// whatever is in flight for the previous generation.
pub struct Builder<E> {
    executor: Arc<E>,
    hostname: String,
    repo_path: PathBuf,
    local_machine_id: Option<String>,
    shared: Arc<Shared>,
    // Held for the whole of eval/build/stop, so those never interleave.
    execs: Mutex<Execs>,
}

struct Execs {
    eval: Exec,
    build: Exec,
}

struct Shared {
    current: Mutex<Option<Generation>>,
    evaluated: watch::Sender<Option<Generation>>,
    built: watch::Sender<Option<Generation>>,
}

impl<E: Executor> Builder<E> {
    /// Idle builder. Nothing runs until [`Builder::eval`].
    pub fn new(executor: Arc<E>, opts: BuilderOptions) -> Self {
        Self {
            executor,
            hostname: opts.hostname,
            repo_path: opts.repo_path,
            local_machine_id: opts.local_machine_id,
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                evaluated: watch::Sender::new(None),
                built: watch::Sender::new(None),
            }),
            execs: Mutex::new(Execs {
                eval: Exec::new("eval", opts.eval_timeout),
                build: Exec::new("build", opts.build_timeout),
            }),
        }
    }

    /// Receives every generation whose evaluation finished (success or failure).
    pub fn subscribe_evaluated(&self) -> watch::Receiver<Option<Generation>> {
        self.shared.evaluated.subscribe()
    }

    /// Receives every generation whose build finished (success or failure).
    pub fn subscribe_built(&self) -> watch::Receiver<Option<Generation>> {
        self.shared.built.subscribe()
    }

    /// Snapshot for the status endpoint.
    pub async fn state(&self) -> BuilderState {
        let generation = self.shared.current.lock().await.clone();
        BuilderState {
            evaluating: generation
                .as_ref()
                .is_some_and(|g| matches!(g.lifecycle, Lifecycle::Evaluating { .. })),
            building: generation
                .as_ref()
                .is_some_and(|g| matches!(g.lifecycle, Lifecycle::Building { .. })),
            generation,
        }
    }

    /// Copy of the newest generation.
    pub async fn current(&self) -> Option<Generation> {
        self.shared.current.lock().await.clone()
    }

    /// Starts evaluating the selected commit of `status` and returns the new
    /// generation as soon as the work is launched.
    pub async fn eval(&self, status: &RepositoryStatus) -> Result<Generation, BuildError> {
        let selection = status.selected.clone().ok_or(BuildError::NoSelection)?;

        let mut execs = self.execs.lock().await;
        execs.eval.stop().await;
        execs.build.stop().await;

        let flake = flake_url(&self.repo_path, &selection.commit_id);
        let mut generation = Generation::new(
            selection,
            status.main_commit_id().map(str::to_string),
            flake.clone(),
            self.hostname.clone(),
        );
        generation.begin_eval(now_ms())?;
        *self.shared.current.lock().await = Some(generation.clone());

        info!(
            generation_id = %generation.id,
            commit = %generation.commit_id(),
            testing = generation.is_testing(),
            "evaluation started"
        );

        let executor = self.executor.clone();
        let hostname = self.hostname.clone();
        let shared = self.shared.clone();
        let id = generation.id.clone();
        let local_machine_id = self.local_machine_id.clone();
        execs.eval.spawn(
            async move { executor.eval(&flake, &hostname).await },
            move |outcome| async move { shared.finish_eval(&id, local_machine_id, outcome).await },
        );

        Ok(generation)
    }

    /// Starts building the current generation.
    pub async fn build(&self) -> Result<Generation, BuildError> {
        let mut execs = self.execs.lock().await;

        let (drv_path, generation) = {
            let mut current = self.shared.current.lock().await;
            let generation = current.as_mut().ok_or(BuildError::NothingEvaluated)?;
            let drv_path = generation.begin_build(now_ms())?;
            (drv_path, generation.clone())
        };

        info!(generation_id = %generation.id, drv = %drv_path, "build started");

        let executor = self.executor.clone();
        let shared = self.shared.clone();
        let id = generation.id.clone();
        execs.build.spawn(
            async move { executor.build(&drv_path).await },
            move |outcome| async move { shared.finish_build(&id, outcome).await },
        );

        Ok(generation)
    }

    /// Cancels evaluation and build; returns once both have terminated.
    pub async fn stop(&self) {
        let mut execs = self.execs.lock().await;
        execs.eval.stop().await;
        execs.build.stop().await;
    }
}

impl Shared {
    async fn finish_eval(
        &self,
        id: &str,
        local_machine_id: Option<String>,
        outcome: Outcome<Result<EvalOutput>>,
    ) {
        let mut current = self.current.lock().await;
        let Some(generation) = current.as_mut().filter(|g| g.id == id) else {
            debug!(generation_id = %id, "dropping stale evaluation result");
            return;
        };

        let cancelled = matches!(outcome, Outcome::Cancelled);
        let result = match outcome {
            Outcome::Completed(Ok(out)) => match out.machine_id {
                Some(expected) => {
                    let check = MachineIdCheck {
                        expected,
                        actual: local_machine_id,
                    };
                    let verdict = if check.matches() {
                        Ok((out.drv_path, out.out_path))
                    } else {
                        Err(format!(
                            "machine id mismatch: configuration expects {}, host is {}",
                            check.expected,
                            check.actual.as_deref().unwrap_or("unknown")
                        ))
                    };
                    generation.machine_id = Some(check);
                    verdict
                }
                None => Ok((out.drv_path, out.out_path)),
            },
            Outcome::Completed(Err(e)) => Err(format!("{e:#}")),
            Outcome::Cancelled => Err("evaluation cancelled".to_string()),
            Outcome::TimedOut(limit) => {
                Err(format!("evaluation timed out after {}s", limit.as_secs()))
            }
        };

        if let Err(e) = generation.finish_eval(now_ms(), result) {
            warn!(generation_id = %id, error = %e, "unexpected evaluation result");
            return;
        }
        if cancelled {
            debug!(generation_id = %id, "evaluation cancelled");
            return;
        }
        match generation.error() {
            Some(error) => warn!(generation_id = %id, %error, "evaluation failed"),
            None => info!(
                generation_id = %id,
                out_path = generation.out_path().unwrap_or_default(),
                "evaluation finished"
            ),
        }
        self.evaluated.send_replace(Some(generation.clone()));
    }

    async fn finish_build(&self, id: &str, outcome: Outcome<Result<()>>) {
        let mut current = self.current.lock().await;
        let Some(generation) = current.as_mut().filter(|g| g.id == id) else {
            debug!(generation_id = %id, "dropping stale build result");
            return;
        };

        let cancelled = matches!(outcome, Outcome::Cancelled);
        let result = match outcome {
            Outcome::Completed(Ok(())) => Ok(()),
            Outcome::Completed(Err(e)) => Err(format!("{e:#}")),
            Outcome::Cancelled => Err("build cancelled".to_string()),
            Outcome::TimedOut(limit) => Err(format!("build timed out after {}s", limit.as_secs())),
        };

        if let Err(e) = generation.finish_build(now_ms(), result) {
            warn!(generation_id = %id, error = %e, "unexpected build result");
            return;
        }
        if cancelled {
            debug!(generation_id = %id, "build cancelled");
            return;
        }
        match generation.error() {
            Some(error) => warn!(generation_id = %id, %error, "build failed"),
            None => info!(generation_id = %id, "build finished"),
        }
        self.built.send_replace(Some(generation.clone()));
    }
}
