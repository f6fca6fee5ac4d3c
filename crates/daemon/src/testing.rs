//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use gitops_core::deployment::Operation;
use gitops_core::generation::Generation;
use gitops_core::model::{CommitId, RemoteSpec, Selection};

use crate::builder::BuilderOptions;
use crate::confirm::ConfirmMode;
use crate::exec::{DeployOutput, EvalOutput, Executor};
use crate::git::{Commit, Repository};
use crate::history::History;
use crate::manager::Components;
use crate::selector::Selector;

/// Commit graph plus per-remote upstream refs. `fetch` copies a remote's
/// upstream refs into the local remote-tracking refs.
pub struct FakeRepo {
    root: PathBuf,
    state: Mutex<RepoState>,
}

#[derive(Default)]
struct RepoState {
    parents: HashMap<String, Vec<String>>,
    upstream: HashMap<(String, String), String>,
    tracking: HashMap<(String, String), String>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    signatures: HashMap<String, PathBuf>,
    head: Option<String>,
}

impl Default for FakeRepo {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/fake/repo"),
            state: Mutex::new(RepoState::default()),
        }
    }
}

impl FakeRepo {
    fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap()
    }

    pub fn commit(&self, id: &str, parents: &[&str]) {
        self.lock()
            .parents
            .insert(id.to_string(), parents.iter().map(|p| p.to_string()).collect());
    }

    pub fn push(&self, remote: &str, branch: &str, id: &str) {
        self.lock()
            .upstream
            .insert((remote.to_string(), branch.to_string()), id.to_string());
    }

    pub fn fail_fetch(&self, remote: &str, failing: bool) {
        let mut s = self.lock();
        if failing {
            s.failing.insert(remote.to_string());
        } else {
            s.failing.remove(remote);
        }
    }

    pub fn hang_fetch(&self, remote: &str, hanging: bool) {
        let mut s = self.lock();
        if hanging {
            s.hanging.insert(remote.to_string());
        } else {
            s.hanging.remove(remote);
        }
    }

    pub fn sign(&self, commit: &str, key: &Path) {
        self.lock()
            .signatures
            .insert(commit.to_string(), key.to_path_buf());
    }
}

impl Repository for FakeRepo {
    async fn fetch(&self, remote: &RemoteSpec) -> Result<()> {
        let hanging = self.lock().hanging.contains(&remote.name);
        if hanging {
            std::future::pending::<()>().await;
        }
        let mut s = self.lock();
        if s.failing.contains(&remote.name) {
            bail!("could not read from remote {}", remote.name);
        }
        let refs: Vec<_> = s
            .upstream
            .iter()
            .filter(|((r, _), _)| r == &remote.name)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        s.tracking.retain(|(r, _), _| r != &remote.name);
        s.tracking.extend(refs);
        Ok(())
    }

    async fn branch_head(&self, remote: &str, branch: &str) -> Result<Option<Commit>> {
        let s = self.lock();
        Ok(s
            .tracking
            .get(&(remote.to_string(), branch.to_string()))
            .map(|id| Commit {
                id: id.clone(),
                message: format!("commit {id}"),
            }))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let s = self.lock();
        let mut queue = VecDeque::from([descendant.to_string()]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if id == ancestor {
                return Ok(true);
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            let parents = s
                .parents
                .get(&id)
                .ok_or_else(|| anyhow!("unknown commit {id}"))?;
            queue.extend(parents.iter().cloned());
        }
        Ok(false)
    }

    async fn reset_hard(&self, commit: &str) -> Result<()> {
        let mut s = self.lock();
        if !s.parents.contains_key(commit) {
            bail!("unknown commit {commit}");
        }
        s.head = Some(commit.to_string());
        Ok(())
    }

    async fn head(&self) -> Result<Option<CommitId>> {
        Ok(self.lock().head.clone())
    }

    async fn verify_signature(&self, commit: &str, key: &Path) -> Result<bool> {
        Ok(self.lock().signatures.get(commit).is_some_and(|k| k == key))
    }

    fn path(&self) -> &Path {
        &self.root
    }
}

/// Scripted executor. Outputs derive from the `rev=` of the flake url.
#[derive(Default)]
pub struct FakeExecutor {
    state: Mutex<ExecState>,
}

#[derive(Default)]
pub struct ExecState {
    pub eval_delay: Duration,
    pub build_delay: Duration,
    pub deploy_delay: Duration,
    pub eval_error: Option<String>,
    pub build_error: Option<String>,
    pub deploy_error: Option<String>,
    pub machine_id: Option<String>,
    pub evals: Vec<String>,
    pub builds: Vec<String>,
    pub deploys: Vec<(String, Operation)>,
}

impl FakeExecutor {
    pub fn with(f: impl FnOnce(&mut ExecState)) -> Self {
        let ex = Self::default();
        ex.set(f);
        ex
    }

    pub fn set(&self, f: impl FnOnce(&mut ExecState)) {
        f(&mut self.state.lock().unwrap())
    }

    pub fn evals(&self) -> Vec<String> {
        self.state.lock().unwrap().evals.clone()
    }

    pub fn builds(&self) -> Vec<String> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn deploys(&self) -> Vec<(String, Operation)> {
        self.state.lock().unwrap().deploys.clone()
    }
}

impl Executor for FakeExecutor {
    async fn eval(&self, flake_url: &str, _hostname: &str) -> Result<EvalOutput> {
        let (delay, error, machine_id) = {
            let mut s = self.state.lock().unwrap();
            s.evals.push(flake_url.to_string());
            (s.eval_delay, s.eval_error.clone(), s.machine_id.clone())
        };
        tokio::time::sleep(delay).await;
        if let Some(e) = error {
            bail!("{e}");
        }
        let rev = flake_url.rsplit("rev=").next().unwrap_or(flake_url);
        Ok(EvalOutput {
            drv_path: format!("/nix/store/{rev}.drv"),
            out_path: format!("/nix/store/{rev}"),
            machine_id,
        })
    }

    async fn build(&self, drv_path: &str) -> Result<()> {
        let (delay, error) = {
            let mut s = self.state.lock().unwrap();
            s.builds.push(drv_path.to_string());
            (s.build_delay, s.build_error.clone())
        };
        tokio::time::sleep(delay).await;
        match error {
            Some(e) => bail!("{e}"),
            None => Ok(()),
        }
    }

    async fn deploy(&self, out_path: &str, operation: Operation) -> Result<DeployOutput> {
        let (delay, error) = {
            let s = self.state.lock().unwrap();
            (s.deploy_delay, s.deploy_error.clone())
        };
        tokio::time::sleep(delay).await;
        self.state
            .lock()
            .unwrap()
            .deploys
            .push((out_path.to_string(), operation));
        match error {
            Some(e) => bail!("{e}"),
            None => Ok(DeployOutput {
                restart_required: false,
                profile_path: Some("/nix/var/nix/profiles/system".to_string()),
            }),
        }
    }
}

pub fn selection(commit: &str, testing: bool) -> Selection {
    Selection {
        commit_id: commit.to_string(),
        commit_msg: format!("commit {commit}"),
        remote_name: "origin".to_string(),
        branch_name: if testing { "testing" } else { "main" }.to_string(),
        is_testing: testing,
        signed: false,
        signed_by: None,
        should_be_signed: false,
    }
}

/// A generation that went through evaluation and build successfully.
pub fn built_generation(commit: &str, testing: bool) -> Generation {
    let mut g = Generation::new(
        selection(commit, testing),
        None,
        format!("git+file:///fake/repo?rev={commit}"),
        "host",
    );
    g.begin_eval(1).unwrap();
    g.finish_eval(2, Ok((format!("/nix/store/{commit}.drv"), format!("/nix/store/{commit}"))))
        .unwrap();
    g.begin_build(3).unwrap();
    g.finish_build(4, Ok(())).unwrap();
    g
}

/// A one-remote pipeline at commit `c1` (with `c2` available as a fast-forward),
/// one second per executor step and no polling.
pub fn components(build: ConfirmMode, deploy: ConfirmMode) -> Components<FakeRepo, FakeExecutor> {
    let repo = FakeRepo::default();
    repo.commit("c1", &[]);
    repo.commit("c2", &["c1"]);
    repo.push("origin", "main", "c1");
    let mut spec = RemoteSpec::new("origin", "fake://origin").with_testing("testing");
    spec.poll_period_secs = 0;

    Components {
        hostname: "host".to_string(),
        selector: Selector::new(repo, vec![spec], vec![]),
        executor: Arc::new(FakeExecutor::with(|s| {
            s.eval_delay = Duration::from_secs(1);
            s.build_delay = Duration::from_secs(1);
            s.deploy_delay = Duration::from_secs(1);
        })),
        builder: BuilderOptions {
            hostname: "host".to_string(),
            repo_path: PathBuf::from("/fake/repo"),
            local_machine_id: None,
            eval_timeout: Duration::from_secs(60),
            build_timeout: Duration::from_secs(60),
        },
        build_confirmation: build,
        deploy_confirmation: deploy,
        history: Arc::new(History::in_memory(10)),
        liveliness_check: None,
        post_deployment: None,
    }
}
