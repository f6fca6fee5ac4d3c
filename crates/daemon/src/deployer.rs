use std::sync::Arc;

use gitops_core::api::DeployerStatus;
use gitops_core::deployment::{Deployment, DeploymentStatus};
use gitops_core::generation::Generation;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::exec::Executor;
use crate::history::History;
use crate::hooks::Hook;

/// Applies built generations one at a time.
///
/// The queue has a single slot: a generation submitted while another one
/// waits replaces it.
pub struct Deployer<E> {
    executor: Arc<E>,
    history: Arc<History>,
    liveliness: Option<Hook>,
    state: Mutex<QueueState>,
    work: Notify,
    suspended: watch::Sender<bool>,
    done: mpsc::Sender<Deployment>,
}

#[derive(Default)]
struct QueueState {
    pending: Option<Generation>,
    current: Option<Deployment>,
    previous: Option<Deployment>,
    /// Last deployment that finished, successfully or not.
    last_finished: Option<Deployment>,
    is_deploying: bool,
    is_parked: bool,
}

impl<E: Executor> Deployer<E> {
    /// `last` seeds the idempotency check, typically from the history.
    pub fn new(
        executor: Arc<E>,
        history: Arc<History>,
        liveliness: Option<Hook>,
        last: Option<Deployment>,
    ) -> (Self, mpsc::Receiver<Deployment>) {
        let (done, done_rx) = mpsc::channel(1);
        let deployer = Self {
            executor,
            history,
            liveliness,
            state: Mutex::new(QueueState {
                current: last.clone(),
                last_finished: last,
                ..Default::default()
            }),
            work: Notify::new(),
            suspended: watch::Sender::new(false),
            done,
        };
        (deployer, done_rx)
    }

    /// Queues `generation`, unless it targets what the last finished
    /// deployment already applied. Returns whether it was queued.
    pub async fn submit(&self, generation: Generation) -> bool {
        let mut state = self.state.lock().await;
        let unchanged = state
            .last_finished
            .as_ref()
            .is_some_and(|last| last.targets(&generation));
        if unchanged {
            info!(
                generation_id = %generation.id,
                commit = %generation.commit_id(),
                "skipping deployment: target already deployed"
            );
            return false;
        }

        debug!(generation_id = %generation.id, "queued for deployment");
        if let Some(superseded) = state.pending.replace(generation) {
            info!(generation_id = %superseded.id, "queued generation superseded");
        }
        drop(state);
        self.work.notify_one();
        true
    }

    /// Parks the worker before its next deployment. A running deployment
    /// completes.
    pub fn suspend(&self) {
        if !self.suspended.send_replace(true) {
            info!("deployer suspended");
        }
    }

    /// Releases a parked worker.
    pub fn resume(&self) {
        if self.suspended.send_replace(false) {
            info!("deployer resumed");
        }
    }

    /// Snapshot for the status endpoint.
    pub async fn status(&self) -> DeployerStatus {
        let state = self.state.lock().await;
        DeployerStatus {
            deployment: state.current.clone(),
            previous: state.previous.clone(),
            pending: state.pending.as_ref().map(|g| g.id.clone()),
            is_deploying: state.is_deploying,
            is_suspended: *self.suspended.borrow(),
            is_parked: state.is_parked,
        }
    }

    /// Worker loop. Returns when the completion receiver is dropped.
    pub async fn run(&self) {
        let mut suspended = self.suspended.subscribe();
        loop {
            self.work.notified().await;

            let parked = *suspended.borrow_and_update();
            if parked {
                self.state.lock().await.is_parked = true;
                debug!("deployer parked");
                let resumed = suspended.wait_for(|s| !*s).await.is_ok();
                self.state.lock().await.is_parked = false;
                if !resumed {
                    return;
                }
            }

            let Some(generation) = self.state.lock().await.pending.take() else {
                continue;
            };
            let deployment = self.deploy(generation).await;

            self.history.record(deployment.clone()).await;
            if self.done.send(deployment).await.is_err() {
                debug!("deployment receiver dropped, stopping worker");
                return;
            }
        }
    }

    async fn deploy(&self, generation: Generation) -> Deployment {
        let mut deployment = Deployment::start(generation);
        {
            let mut state = self.state.lock().await;
            state.previous = state.current.replace(deployment.clone());
            state.is_deploying = true;
        }
        info!(
            deployment_id = %deployment.id,
            generation_id = %deployment.generation.id,
            commit = %deployment.generation.commit_id(),
            operation = %deployment.operation,
            "deployment started"
        );

        match deployment.generation.out_path().map(str::to_string) {
            Some(out_path) => {
                match self.executor.deploy(&out_path, deployment.operation).await {
                    Ok(out) => deployment.succeed(out.restart_required, out.profile_path),
                    Err(e) => deployment.fail(format!("{e:#}")),
                }
            }
            None => deployment.fail("generation has no output path"),
        }

        if deployment.status == DeploymentStatus::Done {
            if let Some(check) = &self.liveliness {
                if let Err(e) = check.run(&deployment).await {
                    deployment.fail(format!("{e:#}"));
                }
            }
        }

        match &deployment.error {
            Some(error) => warn!(deployment_id = %deployment.id, %error, "deployment failed"),
            None => info!(
                deployment_id = %deployment.id,
                restart_required = deployment.restart_required,
                "deployment done"
            ),
        }

        let mut state = self.state.lock().await;
        state.current = Some(deployment.clone());
        state.last_finished = Some(deployment.clone());
        state.is_deploying = false;
        deployment
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gitops_core::deployment::Operation;
    use tokio::time::timeout;

    use super::*;
    use crate::testing::{built_generation, FakeExecutor};

    fn deployer(
        executor: FakeExecutor,
        liveliness: Option<Hook>,
    ) -> (Arc<Deployer<FakeExecutor>>, mpsc::Receiver<Deployment>) {
        let (d, rx) = Deployer::new(
            Arc::new(executor),
            Arc::new(History::in_memory(10)),
            liveliness,
            None,
        );
        let d = Arc::new(d);
        let worker = d.clone();
        tokio::spawn(async move { worker.run().await });
        (d, rx)
    }

    async fn wait_deploying(d: &Deployer<FakeExecutor>) {
        while !d.status().await.is_deploying {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latest_submission_supersedes_queued_one() {
        let (d, mut done) = deployer(
            FakeExecutor::with(|s| s.deploy_delay = Duration::from_secs(10)),
            None,
        );
        let g1 = built_generation("c1", false);
        let g2 = built_generation("c2", false);
        let g3 = built_generation("c3", false);

        assert!(d.submit(g1.clone()).await);
        wait_deploying(&d).await;
        assert!(d.submit(g2).await);
        assert!(d.submit(g3.clone()).await);
        assert_eq!(d.status().await.pending, Some(g3.id.clone()));

        let first = done.recv().await.unwrap();
        assert_eq!(first.generation.id, g1.id);
        let second = done.recv().await.unwrap();
        assert_eq!(second.generation.id, g3.id);
        assert_eq!(second.status, DeploymentStatus::Done);

        assert!(timeout(Duration::from_secs(60), done.recv()).await.is_err());
        let deployed: Vec<_> = d.executor.deploys().into_iter().map(|(p, _)| p).collect();
        assert_eq!(deployed, vec!["/nix/store/c1", "/nix/store/c3"]);

        let status = d.status().await;
        assert_eq!(status.deployment.unwrap().generation.id, g3.id);
        assert_eq!(status.previous.unwrap().generation.id, g1.id);
    }

    #[tokio::test(start_paused = true)]
    async fn same_target_is_not_redeployed() {
        let (d, mut done) = deployer(FakeExecutor::default(), None);
        assert!(d.submit(built_generation("c1", false)).await);
        done.recv().await.unwrap();

        assert!(!d.submit(built_generation("c1", false)).await);
        assert!(timeout(Duration::from_secs(60), done.recv()).await.is_err());
        assert_eq!(d.executor.deploys().len(), 1);

        // Same commit from a testing branch is a different target.
        assert!(d.submit(built_generation("c1", true)).await);
        let deployment = done.recv().await.unwrap();
        assert_eq!(deployment.operation, Operation::Test);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_last_deployment_is_honoured() {
        let mut last = Deployment::start(built_generation("c1", false));
        last.succeed(false, None);
        let (d, _done) = Deployer::new(
            Arc::new(FakeExecutor::default()),
            Arc::new(History::in_memory(10)),
            None,
            Some(last),
        );
        assert!(!d.submit(built_generation("c1", false)).await);
        assert!(d.submit(built_generation("c2", false)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_parks_before_next_deployment() {
        let (d, mut done) = deployer(
            FakeExecutor::with(|s| s.deploy_delay = Duration::from_secs(5)),
            None,
        );
        d.submit(built_generation("c1", false)).await;
        wait_deploying(&d).await;
        d.suspend();

        // The in-flight deployment is not interrupted.
        let first = done.recv().await.unwrap();
        assert_eq!(first.status, DeploymentStatus::Done);

        d.submit(built_generation("c2", false)).await;
        assert!(timeout(Duration::from_secs(60), done.recv()).await.is_err());
        let status = d.status().await;
        assert!(status.is_suspended);
        assert!(status.is_parked);

        d.resume();
        let second = done.recv().await.unwrap();
        assert_eq!(second.generation.commit_id(), "c2");
        assert!(!d.status().await.is_parked);
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_error_is_recorded() {
        let (d, mut done) = deployer(
            FakeExecutor::with(|s| s.deploy_error = Some("activation failed".into())),
            None,
        );
        d.submit(built_generation("c1", false)).await;
        let deployment = done.recv().await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error.unwrap().contains("activation failed"));
        assert_eq!(d.history.list().await.len(), 1);
    }

    #[tokio::test]
    async fn failing_liveliness_check_fails_deployment() {
        let check = Hook::new("liveliness check", "exit 1", Duration::from_secs(10));
        let (d, mut done) = deployer(FakeExecutor::default(), Some(check));
        d.submit(built_generation("c1", false)).await;

        let deployment = done.recv().await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error.unwrap().contains("liveliness check"));
        assert!(deployment.ended_at_ms.is_some());
        assert_eq!(d.executor.deploys().len(), 1);
    }
}
