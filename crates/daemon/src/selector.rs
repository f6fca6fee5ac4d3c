//! Commit selection across remotes.
//!
//! Each cycle is `fetch(names)` followed by `update()`. `update` picks at most
//! one commit to deploy:
//!
//! 1. main pass: the first fetched remote whose main head is a fast-forward of
//!    the accepted main commit (or any head, when the remote allows force
//!    pushes) becomes the accepted main;
//! 2. testing pass: the first testing head that is new, i.e. differs from the
//!    previous selection and from the accepted main, wins. A previous testing
//!    selection is kept while its branch still points at it and main did not
//!    move;
//! 3. the mirror is hard reset to the selection and its signature checked.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use gitops_core::model::{AcceptedMain, BranchStatus, RemoteSpec, RepositoryStatus, Selection};
use gitops_core::now_ms;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::git::{Commit, Repository};

const NO_VALID_MAIN: &str = "no remote main branch could be validated";

/// Fetches remotes and picks the commit to deploy.
/// 
/// Fetches and updates are serialized; status reads are copies.
pub struct Selector<R> {
    repo: R,
    remotes: Vec<RemoteSpec>,
    signing_keys: Vec<PathBuf>,
    status: Mutex<RepositoryStatus>,
    cycle: Mutex<()>,
}

impl<R: Repository> Selector<R> {
    /// Nothing is fetched until [`Selector::fetch`].
    pub fn new(repo: R, remotes: Vec<RemoteSpec>, signing_keys: Vec<PathBuf>) -> Self {
        let status = RepositoryStatus::new(&remotes);
        Self {
            repo,
            remotes,
            signing_keys,
            status: Mutex::new(status),
            cycle: Mutex::new(()),
        }
    }

    /// Configured remotes, in priority order.
    pub fn remotes(&self) -> &[RemoteSpec] {
        &self.remotes
    }

    /// The local mirror.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Copy of the last computed status.
    pub async fn status(&self) -> RepositoryStatus {
        self.status.lock().await.clone()
    }

    /// Fetches the named remotes (all of them when `names` is empty).
    ///
    /// Failures are recorded per remote and never abort the others.
    pub async fn fetch(&self, names: &[String]) {
        let _cycle = self.cycle.lock().await;

        for name in names {
            if !self.remotes.iter().any(|r| &r.name == name) {
                warn!(remote = %name, "fetch requested for unknown remote");
            }
        }
        let targets = self
            .remotes
            .iter()
            .filter(|r| names.is_empty() || names.contains(&r.name));

        for spec in targets {
            if let Some(rs) = self.status.lock().await.remote_mut(&spec.name) {
                rs.clear_errors();
            }

            let limit = Duration::from_secs(spec.timeout_secs);
            let res = tokio::time::timeout(limit, self.repo.fetch(spec)).await;

            let mut status = self.status.lock().await;
            let Some(rs) = status.remote_mut(&spec.name) else {
                continue;
            };
            match res {
                Ok(Ok(())) => {
                    debug!(remote = %spec.name, "fetched");
                    rs.fetched = true;
                    rs.last_fetched_at_ms = Some(now_ms());
                }
                Ok(Err(e)) => {
                    warn!(remote = %spec.name, error = %format!("{e:#}"), "fetch failed");
                    rs.fetch_error = Some(format!("{e:#}"));
                }
                Err(_) => {
                    warn!(remote = %spec.name, timeout_secs = spec.timeout_secs, "fetch timed out");
                    rs.fetch_error = Some(format!("fetch timed out after {}s", spec.timeout_secs));
                }
            }
        }
    }

    /// Runs the selection and moves the working tree to the selected commit.
    pub async fn update(&self) -> Result<RepositoryStatus> {
        let _cycle = self.cycle.lock().await;
        let previous = self.status.lock().await.clone();

        let mut next = select(&self.repo, &self.remotes, &previous).await;

        if let Some(selected) = next.selected.clone() {
            if let Err(e) = self
                .repo
                .reset_hard(&selected.commit_id)
                .await
                .with_context(|| format!("resetting working tree to {}", selected.commit_id))
            {
                next.selected = previous.selected.clone();
                next.accepted_main = previous.accepted_main.clone();
                next.error = Some(format!("{e:#}"));
                *self.status.lock().await = next;
                return Err(e);
            }
        }
        if let Some(selected) = next.selected.as_mut() {
            self.verify_signature(selected).await;
        }

        if next.selected != previous.selected {
            if let Some(s) = &next.selected {
                info!(
                    commit = %s.commit_id,
                    remote = %s.remote_name,
                    branch = %s.branch_name,
                    testing = s.is_testing,
                    "selected commit changed"
                );
            }
        }

        *self.status.lock().await = next.clone();
        Ok(next)
    }

    async fn verify_signature(&self, selected: &mut Selection) {
        selected.signed = false;
        selected.signed_by = None;
        selected.should_be_signed = !self.signing_keys.is_empty();

        for key in &self.signing_keys {
            match self.repo.verify_signature(&selected.commit_id, key).await {
                Ok(true) => {
                    selected.signed = true;
                    selected.signed_by = key
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .or_else(|| Some(key.display().to_string()));
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key.display(), error = %format!("{e:#}"), "signature verification failed");
                }
            }
        }
        if selected.should_be_signed {
            warn!(commit = %selected.commit_id, "selected commit is not signed by any configured key");
        }
    }
}

/// Computes the next repository status from `previous` and the fetched refs.
///
/// Does not touch the working tree.
pub async fn select<R: Repository>(
    repo: &R,
    remotes: &[RemoteSpec],
    previous: &RepositoryStatus,
) -> RepositoryStatus {
    let mut next = previous.clone();
    next.sync_remotes(remotes);
    next.error = None;

    let Some(main) = select_main(repo, remotes, &mut next).await else {
        next.selected = previous.selected.clone();
        next.accepted_main = previous.accepted_main.clone();
        next.error = Some(NO_VALID_MAIN.to_string());
        return next;
    };

    let main_advanced = previous.main_commit_id() != Some(main.commit_id.as_str());
    let testing = select_testing(repo, remotes, &mut next, previous, main_advanced).await;
    next.selected = Some(testing.unwrap_or(main));
    next
}

async fn select_main<R: Repository>(
    repo: &R,
    remotes: &[RemoteSpec],
    next: &mut RepositoryStatus,
) -> Option<Selection> {
    for spec in remotes {
        if !is_usable(next, &spec.name) {
            continue;
        }
        let accepted = next.accepted_main.clone();
        let verdict = check_main(repo, spec, accepted.as_ref()).await;

        let Some(rs) = next.remote_mut(&spec.name) else {
            continue;
        };
        match verdict {
            Ok(commit) => {
                record(&mut rs.main, Some(&commit), None);
                next.accepted_main = Some(AcceptedMain {
                    commit_id: commit.id.clone(),
                    remote_name: spec.name.clone(),
                    branch_name: spec.main.clone(),
                });
                return Some(Selection {
                    commit_id: commit.id,
                    commit_msg: commit.message,
                    remote_name: spec.name.clone(),
                    branch_name: spec.main.clone(),
                    is_testing: false,
                    signed: false,
                    signed_by: None,
                    should_be_signed: false,
                });
            }
            Err((commit, error)) => {
                warn!(remote = %spec.name, branch = %spec.main, %error, "main branch rejected");
                record(&mut rs.main, commit.as_ref(), Some(error));
            }
        }
    }
    None
}

/// Validates the main head of one remote against the accepted main commit.
async fn check_main<R: Repository>(
    repo: &R,
    spec: &RemoteSpec,
    accepted: Option<&AcceptedMain>,
) -> Result<Commit, (Option<Commit>, String)> {
    let commit = match repo.branch_head(&spec.name, &spec.main).await {
        Ok(Some(c)) => c,
        Ok(None) => return Err((None, format!("branch {} not found", spec.main))),
        Err(e) => return Err((None, format!("{e:#}"))),
    };

    let Some(accepted) = accepted else {
        return Ok(commit);
    };
    if commit.id == accepted.commit_id || spec.allow_force_push {
        return Ok(commit);
    }
    match repo.is_ancestor(&accepted.commit_id, &commit.id).await {
        Ok(true) => Ok(commit),
        Ok(false) => {
            let error = format!(
                "hard reset detected: {} is not a descendant of {}",
                commit.id, accepted.commit_id
            );
            Err((Some(commit), error))
        }
        Err(e) => Err((Some(commit), format!("{e:#}"))),
    }
}

async fn select_testing<R: Repository>(
    repo: &R,
    remotes: &[RemoteSpec],
    next: &mut RepositoryStatus,
    previous: &RepositoryStatus,
    main_advanced: bool,
) -> Option<Selection> {
    let accepted = next.main_commit_id().map(str::to_string);
    let prev = previous.selected.as_ref();
    let mut retained = None;

    for spec in remotes {
        let Some(branch) = spec.testing.as_deref() else {
            continue;
        };
        if !is_usable(next, &spec.name) {
            continue;
        }
        let head = repo.branch_head(&spec.name, branch).await;
        // Testing heads only count when they build on the accepted main.
        let on_main = match (&head, accepted.as_deref()) {
            (Ok(Some(c)), Some(main)) if c.id != main => Some(repo.is_ancestor(main, &c.id).await),
            _ => None,
        };

        let Some(rs) = next.remote_mut(&spec.name) else {
            continue;
        };
        let status = rs.testing.get_or_insert_with(|| BranchStatus::named(branch));
        let commit = match head {
            Ok(Some(c)) => c,
            Ok(None) => {
                record(status, None, Some(format!("branch {branch} not found")));
                continue;
            }
            Err(e) => {
                record(status, None, Some(format!("{e:#}")));
                continue;
            }
        };
        record(status, Some(&commit), None);

        if accepted.as_deref() == Some(commit.id.as_str()) {
            continue;
        }
        match on_main {
            Some(Ok(false)) => {
                debug!(remote = %spec.name, %branch, commit = %commit.id, "testing branch is not ahead of main");
                continue;
            }
            Some(Err(e)) => {
                status.error = Some(format!("{e:#}"));
                continue;
            }
            _ => {}
        }
        let is_previous = prev.is_some_and(|p| p.commit_id == commit.id);
        let selection = Selection {
            commit_id: commit.id,
            commit_msg: commit.message,
            remote_name: spec.name.clone(),
            branch_name: branch.to_string(),
            is_testing: true,
            signed: false,
            signed_by: None,
            should_be_signed: false,
        };
        if !is_previous {
            return Some(selection);
        }
        let same_branch = prev.is_some_and(|p| {
            p.is_testing && p.remote_name == spec.name && p.branch_name == branch
        });
        if retained.is_none() && same_branch && !main_advanced {
            retained = Some(selection);
        }
    }
    retained
}

fn is_usable(status: &RepositoryStatus, remote: &str) -> bool {
    status
        .remote(remote)
        .is_some_and(|r| r.fetched && r.fetch_error.is_none())
}

fn record(branch: &mut BranchStatus, commit: Option<&Commit>, error: Option<String>) {
    if let Some(c) = commit {
        branch.commit_id = Some(c.id.clone());
        branch.commit_msg = Some(c.message.clone());
    }
    branch.error = error;
}
