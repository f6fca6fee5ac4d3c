//! Wires selector, builder, gates and deployer together.

use std::sync::Arc;

use anyhow::Result;
use gitops_core::api::{GateKind, GateStatus, StatusResponse};
use gitops_core::deployment::Deployment;
use gitops_core::generation::Generation;
use gitops_core::model::RepositoryStatus;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::{Builder, BuilderOptions};
use crate::confirm::{ConfirmMode, Confirmer, Controller, LaneOutputs};
use crate::deployer::Deployer;
use crate::error::ConfirmError;
use crate::exec::Executor;
use crate::fetcher::Fetcher;
use crate::git::Repository;
use crate::history::History;
use crate::hooks::Hook;
use crate::selector::Selector;

/// Everything the manager needs, constructed by the caller.
pub struct Components<R, E> {
    /// Host being reconciled.
    pub hostname: String,
    /// Commit selector over the local mirror.
    pub selector: Selector<R>,
    /// Shared by the builder and the deployer.
    pub executor: Arc<E>,
    /// Builder settings.
    pub builder: BuilderOptions,
    /// Build gate mode.
    pub build_confirmation: ConfirmMode,
    /// Deploy gate mode.
    pub deploy_confirmation: ConfirmMode,
    /// Finished deployments.
    pub history: Arc<History>,
    /// Run after each activation.
    pub liveliness_check: Option<Hook>,
    /// Run after each finished deployment.
    pub post_deployment: Option<Hook>,
}

/// The running pipeline.
pub struct Manager<R, E> {
    hostname: String,
    selector: Arc<Selector<R>>,
    fetcher: Fetcher,
    builder: Builder<E>,
    controller: Controller,
    build_confirmer: Confirmer,
    deploy_confirmer: Confirmer,
    deployer: Arc<Deployer<E>>,
    history: Arc<History>,
    post_deployment: Option<Hook>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inputs {
    statuses: mpsc::Receiver<RepositoryStatus>,
    evaluated: watch::Receiver<Option<Generation>>,
    built: watch::Receiver<Option<Generation>>,
    build_confirmed: mpsc::Receiver<String>,
    deploy_confirmed: mpsc::Receiver<String>,
    lanes: LaneOutputs,
    deployments: mpsc::Receiver<Deployment>,
}

impl<R: Repository, E: Executor> Manager<R, E> {
    /// Builds the pipeline and spawns all of its tasks.
    pub async fn spawn(c: Components<R, E>) -> Arc<Self> {
        let selector = Arc::new(c.selector);
        let (statuses_tx, statuses) = mpsc::channel(1);
        let (fetcher, mut tasks) = Fetcher::spawn(selector.clone(), statuses_tx);

        let builder = Builder::new(c.executor.clone(), c.builder);
        let evaluated = builder.subscribe_evaluated();
        let built = builder.subscribe_built();

        let (build_confirmer, build_confirmed) =
            Confirmer::spawn(GateKind::Build, c.build_confirmation);
        let (deploy_confirmer, deploy_confirmed) =
            Confirmer::spawn(GateKind::Deploy, c.deploy_confirmation);
        let (controller, lanes) = Controller::new(
            c.build_confirmation.is_enabled(),
            c.deploy_confirmation.is_enabled(),
        );

        let last = c.history.last().await;
        let (deployer, deployments) =
            Deployer::new(c.executor, c.history.clone(), c.liveliness_check, last);
        let deployer = Arc::new(deployer);
        {
            let deployer = deployer.clone();
            tasks.push(tokio::spawn(async move { deployer.run().await }));
        }

        let manager = Arc::new(Self {
            hostname: c.hostname,
            selector,
            fetcher,
            builder,
            controller,
            build_confirmer,
            deploy_confirmer,
            deployer,
            history: c.history,
            post_deployment: c.post_deployment,
            tasks: Mutex::new(Vec::new()),
        });

        let inputs = Inputs {
            statuses,
            evaluated,
            built,
            build_confirmed,
            deploy_confirmed,
            lanes,
            deployments,
        };
        {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.run(inputs).await }));
        }
        *manager.tasks.lock().await = tasks;

        info!(hostname = %manager.hostname, "manager started");
        manager
    }

    async fn run(&self, mut inputs: Inputs) {
        loop {
            tokio::select! {
                Some(status) = inputs.statuses.recv() => self.on_status(status).await,
                Ok(()) = inputs.evaluated.changed() => {
                    let generation = inputs.evaluated.borrow_and_update().clone();
                    if let Some(g) = generation {
                        self.on_evaluated(g).await;
                    }
                }
                Ok(()) = inputs.built.changed() => {
                    let generation = inputs.built.borrow_and_update().clone();
                    if let Some(g) = generation {
                        self.on_built(g).await;
                    }
                }
                Some(id) = inputs.build_confirmed.recv() => self.controller.confirm_for_build(&id).await,
                Some(id) = inputs.deploy_confirmed.recv() => self.controller.confirm_for_deploy(&id).await,
                Some(id) = inputs.lanes.build.recv() => self.on_build_allowed(id).await,
                Some(id) = inputs.lanes.deploy.recv() => self.on_deploy_allowed(id).await,
                Some(deployment) = inputs.deployments.recv() => self.on_deployed(deployment).await,
                else => break,
            }
        }
        debug!("manager loop stopped");
    }

    async fn on_status(&self, status: RepositoryStatus) {
        let Some(selected) = &status.selected else {
            return;
        };
        if selected.should_be_signed && !selected.signed {
            warn!(commit = %selected.commit_id, "not deploying unsigned commit");
            return;
        }
        if let Some(current) = self.builder.current().await {
            if current.selection.same_target(selected) {
                if !current.is_failed() {
                    return;
                }
                info!(
                    generation_id = %current.id,
                    commit = %selected.commit_id,
                    error = current.error().unwrap_or_default(),
                    "retrying failed generation"
                );
            }
        }

        // Whatever waits for confirmation belongs to the superseded generation.
        for confirmer in [&self.build_confirmer, &self.deploy_confirmer] {
            if let Err(e) = confirmer.cancel().await {
                warn!(error = %e, "cancelling confirmation failed");
            }
        }
        if let Err(e) = self.builder.eval(&status).await {
            warn!(error = %e, "cannot start evaluation");
        }
    }

    async fn is_current(&self, id: &str) -> Option<Generation> {
        let current = self.builder.current().await?;
        if current.id == id {
            Some(current)
        } else {
            debug!(generation_id = %id, current = %current.id, "ignoring stale generation");
            None
        }
    }

    async fn on_evaluated(&self, generation: Generation) {
        if !generation.is_evaluated() || self.is_current(&generation.id).await.is_none() {
            return;
        }
        self.controller.ask_for_build(&generation.id).await;
        if self.controller.lane(GateKind::Build).status().await.enabled {
            if let Err(e) = self.build_confirmer.submit(&generation.id).await {
                warn!(error = %e, "submitting build confirmation failed");
            }
        }
    }

    async fn on_build_allowed(&self, id: String) {
        if self.is_current(&id).await.is_none() {
            return;
        }
        if let Err(e) = self.builder.build().await {
            warn!(generation_id = %id, error = %e, "cannot start build");
        }
    }

    async fn on_built(&self, generation: Generation) {
        if !generation.is_built() || self.is_current(&generation.id).await.is_none() {
            return;
        }
        self.controller.ask_for_deploy(&generation.id).await;
        if self.controller.lane(GateKind::Deploy).status().await.enabled {
            if let Err(e) = self.deploy_confirmer.submit(&generation.id).await {
                warn!(error = %e, "submitting deploy confirmation failed");
            }
        }
    }

    async fn on_deploy_allowed(&self, id: String) {
        let Some(generation) = self.is_current(&id).await else {
            return;
        };
        if !generation.is_built() {
            warn!(generation_id = %id, "deploy allowed for a generation that is not built");
            return;
        }
        self.deployer.submit(generation).await;
    }

    async fn on_deployed(&self, deployment: Deployment) {
        let Some(hook) = self.post_deployment.clone() else {
            return;
        };
        let task = tokio::spawn(async move {
            if let Err(e) = hook.run(&deployment).await {
                warn!(deployment_id = %deployment.id, error = %format!("{e:#}"), "post-deployment hook failed");
            }
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn confirmer(&self, gate: GateKind) -> &Confirmer {
        match gate {
            GateKind::Build => &self.build_confirmer,
            GateKind::Deploy => &self.deploy_confirmer,
        }
    }

    /// Aggregated snapshot of every component.
    pub async fn status(&self) -> StatusResponse {
        StatusResponse {
            hostname: self.hostname.clone(),
            repository: self.selector.status().await,
            builder: self.builder.state().await,
            build_gate: GateStatus {
                confirmation: self.build_confirmer.status(),
                lane: self.controller.lane(GateKind::Build).status().await,
            },
            deploy_gate: GateStatus {
                confirmation: self.deploy_confirmer.status(),
                lane: self.controller.lane(GateKind::Deploy).status().await,
            },
            deployer: self.deployer.status().await,
        }
    }

    /// Finished deployments, oldest first.
    pub async fn history(&self) -> Vec<Deployment> {
        self.history.list().await
    }

    /// Requests a fetch; empty means every remote.
    pub async fn fetch(&self, remotes: Vec<String>) -> Result<()> {
        self.fetcher.trigger(remotes).await
    }

    /// Parks the deployer before its next deployment.
    pub fn suspend(&self) {
        self.deployer.suspend();
    }

    /// Releases the deployer.
    pub fn resume(&self) {
        self.deployer.resume();
    }

    /// Confirms `id` on `gate`. `id` must be the current generation.
    pub async fn confirm(&self, gate: GateKind, id: &str) -> Result<(), ConfirmError> {
        if id.is_empty() {
            return Err(ConfirmError::EmptyId);
        }
        let Some(current) = self.builder.current().await else {
            return Err(ConfirmError::Unknown {
                gate,
                id: id.to_string(),
            });
        };
        if current.id != id {
            return Err(ConfirmError::Mismatch {
                requested: id.to_string(),
                current: current.id,
            });
        }
        info!(%gate, generation_id = %id, "confirmation received");
        self.confirmer(gate).confirm(id).await
    }

    /// Drops what `gate` is waiting on.
    pub async fn cancel(&self, gate: GateKind) -> Result<(), ConfirmError> {
        info!(%gate, "confirmation cancelled");
        self.confirmer(gate).cancel().await
    }

    /// Stops in-flight evaluation/build and every background task.
    pub async fn shutdown(&self) {
        self.builder.stop().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("manager stopped");
    }
}
