use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use gitops_core::model::{CommitId, RemoteAuth, RemoteSpec};
use tokio::process::Command;
use tracing::debug;

/// A commit as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Full commit id.
    pub id: CommitId,
    /// Subject line.
    pub message: String,
}

/// Git operations the selector needs from the local mirror.
///
/// Remote-tracking refs live under `refs/remotes/<remote>/<branch>`.
pub trait Repository: Send + Sync + 'static {
    /// Updates the tracking refs of `remote`.
    fn fetch(&self, remote: &RemoteSpec) -> impl Future<Output = Result<()>> + Send;

    /// Head of `remote`/`branch`, `None` when the branch does not exist locally.
    fn branch_head(
        &self,
        remote: &str,
        branch: &str,
    ) -> impl Future<Output = Result<Option<Commit>>> + Send;

    /// True when `ancestor` is reachable from `descendant` (or equal to it).
    fn is_ancestor(
        &self,
        ancestor: &str,
        descendant: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Moves HEAD and the working tree to `commit`.
    fn reset_hard(&self, commit: &str) -> impl Future<Output = Result<()>> + Send;

    /// Checked-out commit, `None` in a fresh mirror.
    fn head(&self) -> impl Future<Output = Result<Option<CommitId>>> + Send;

    /// Verifies the commit signature against a single armored public key.
    fn verify_signature(&self, commit: &str, key: &Path) -> impl Future<Output = Result<bool>> + Send;

    /// Root of the working tree.
    fn path(&self) -> &Path;
}

/// Local mirror driven through the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Opens (initialising if needed) the mirror at `root` and registers every remote.
    pub async fn open(root: impl Into<PathBuf>, remotes: &[RemoteSpec]) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating repository dir {}", root.display()))?;
        let repo = Self { root };

        if !repo.root.join(".git").exists() {
            repo.run(&["init", "--quiet"]).await?;
            debug!(path = %repo.root.display(), "initialised local mirror");
        }

        for remote in remotes {
            let existing = repo.git(&["remote", "get-url", &remote.name]).await?;
            if existing.status.success() {
                repo.run(&["remote", "set-url", &remote.name, &remote.url]).await?;
            } else {
                repo.run(&["remote", "add", &remote.name, &remote.url]).await?;
            }
        }
        Ok(repo)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("running git {}", args.first().unwrap_or(&"")))
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args).await?;
        if !out.status.success() {
            bail!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn commit_message(&self, commit: &str) -> Result<String> {
        self.run(&["log", "-1", "--format=%B", commit]).await
    }
}

impl Repository for GitRepo {
    async fn fetch(&self, remote: &RemoteSpec) -> Result<()> {
        let (url, secret) = match &remote.auth {
            Some(auth) => authenticated_url(&remote.url, auth).await?,
            None => (remote.url.clone(), None),
        };
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", remote.name);
        let out = self
            .git(&["fetch", "--quiet", "--no-tags", "--prune", &url, &refspec])
            .await?;
        if !out.status.success() {
            let mut stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if let Some(secret) = secret {
                stderr = stderr.replace(&secret, "***");
            }
            bail!("git fetch {} failed: {stderr}", remote.name);
        }
        Ok(())
    }

    async fn branch_head(&self, remote: &str, branch: &str) -> Result<Option<Commit>> {
        let refname = format!("refs/remotes/{remote}/{branch}^{{commit}}");
        let out = self.git(&["rev-parse", "--verify", "--quiet", &refname]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let message = self.commit_message(&id).await?;
        Ok(Some(Commit { id, message }))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self
            .git(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    async fn reset_hard(&self, commit: &str) -> Result<()> {
        self.run(&["reset", "--hard", "--quiet", commit]).await?;
        Ok(())
    }

    async fn head(&self) -> Result<Option<CommitId>> {
        let out = self.git(&["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    async fn verify_signature(&self, commit: &str, key: &Path) -> Result<bool> {
        let gnupg_home = tempfile::tempdir().context("creating temporary GNUPGHOME")?;

        let import = Command::new("gpg")
            .args(["--batch", "--quiet", "--import"])
            .arg(key)
            .env("GNUPGHOME", gnupg_home.path())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("running gpg --import")?;
        if !import.status.success() {
            bail!(
                "importing key {} failed: {}",
                key.display(),
                String::from_utf8_lossy(&import.stderr).trim()
            );
        }

        let out = self
            .command()
            .args(["verify-commit", commit])
            .env("GNUPGHOME", gnupg_home.path())
            .output()
            .await
            .context("running git verify-commit")?;
        Ok(out.status.success())
    }

    fn path(&self) -> &Path {
        &self.root
    }
}

/// Injects `username:token` into an http(s) url. Returns the url and the token,
/// so callers can scrub it from error output.
pub async fn authenticated_url(url: &str, auth: &RemoteAuth) -> Result<(String, Option<String>)> {
    let path = shellexpand::tilde(&auth.access_token_path).to_string();
    let token = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading access token {path}"))?
        .trim()
        .to_string();
    Ok((with_credentials(url, &auth.username, &token), Some(token)))
}

fn with_credentials(url: &str, username: &str, token: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) if scheme == "http" || scheme == "https" => {
            format!("{scheme}://{username}:{token}@{rest}")
        }
        _ => url.to_string(),
    }
}
