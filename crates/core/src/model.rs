use serde::{Deserialize, Serialize};

/// A git commit id (full hex sha).
pub type CommitId = String;

/// Credentials used when fetching a remote over http(s).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteAuth {
    /// User name put in front of the token.
    pub username: String,
    /// File holding the access token. Read at fetch time so rotations are picked up.
    pub access_token_path: String,
}

/// One configured git remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSpec {
    /// Remote name, unique within the configuration.
    pub name: String,
    /// Fetch url.
    pub url: String,

    /// Credentials for http(s) remotes.
    #[serde(default)]
    pub auth: Option<RemoteAuth>,

    /// Main (protected) branch name.
    #[serde(default = "default_main_branch")]
    pub main: String,

    /// Optional testing branch. Commits there are deployed with the `test` operation.
    #[serde(default)]
    pub testing: Option<String>,

    /// Fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,

    /// Poll period in seconds. Zero disables periodic fetching of this remote.
    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: u64,

    /// Accept a main head which is not a descendant of the accepted main commit.
    #[serde(default)]
    pub allow_force_push: bool,
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    300
}

fn default_poll_period_secs() -> u64 {
    60
}

impl RemoteSpec {
    /// Convenience constructor with default branches and timeouts.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            auth: None,
            main: default_main_branch(),
            testing: None,
            timeout_secs: default_fetch_timeout_secs(),
            poll_period_secs: default_poll_period_secs(),
            allow_force_push: false,
        }
    }

    /// Sets the testing branch.
    pub fn with_testing(mut self, branch: impl Into<String>) -> Self {
        self.testing = Some(branch.into());
        self
    }
}

/// State of one branch of one remote, as seen by the last fetch/update cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BranchStatus {
    /// Branch name.
    pub name: String,
    /// Head seen on the last cycle.
    pub commit_id: Option<CommitId>,
    /// Subject line of that head.
    pub commit_msg: Option<String>,
    /// Why the branch was not usable.
    pub error: Option<String>,
}

impl BranchStatus {
    /// Empty status for `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Per-remote state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteStatus {
    /// Remote name.
    pub name: String,
    /// Fetch url, credentials not included.
    pub url: String,
    /// True once at least one fetch succeeded.
    pub fetched: bool,
    /// Error of the last fetch.
    pub fetch_error: Option<String>,
    /// Time of the last successful fetch.
    pub last_fetched_at_ms: Option<i64>,
    /// Main branch.
    pub main: BranchStatus,
    /// Testing branch, when configured.
    pub testing: Option<BranchStatus>,
}

impl RemoteStatus {
    /// Fresh status for a configured remote.
    pub fn from_spec(spec: &RemoteSpec) -> Self {
        Self {
            name: spec.name.clone(),
            url: spec.url.clone(),
            fetched: false,
            fetch_error: None,
            last_fetched_at_ms: None,
            main: BranchStatus::named(&spec.main),
            testing: spec.testing.as_ref().map(BranchStatus::named),
        }
    }

    /// Drops errors recorded by a previous cycle.
    pub fn clear_errors(&mut self) {
        self.fetch_error = None;
        self.main.error = None;
        if let Some(t) = self.testing.as_mut() {
            t.error = None;
        }
    }
}

/// The commit chosen for deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    /// Selected commit.
    pub commit_id: CommitId,
    /// Its subject line.
    pub commit_msg: String,
    /// Remote it was selected from.
    pub remote_name: String,
    /// Branch it was selected from.
    pub branch_name: String,
    /// Selected from a testing branch.
    pub is_testing: bool,

    /// Signed by one of the configured keys.
    #[serde(default)]
    pub signed: bool,
    /// File name of the key that verified it.
    #[serde(default)]
    pub signed_by: Option<String>,
    /// Signing keys are configured.
    #[serde(default)]
    pub should_be_signed: bool,
}

impl Selection {
    /// Same target: commit and operation kind. Signature fields are ignored.
    pub fn same_target(&self, other: &Selection) -> bool {
        self.commit_id == other.commit_id
            && self.is_testing == other.is_testing
            && self.remote_name == other.remote_name
            && self.branch_name == other.branch_name
    }
}

/// The last main-branch commit which passed the fast-forward check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptedMain {
    /// Accepted main commit.
    pub commit_id: CommitId,
    /// Remote that provided it.
    pub remote_name: String,
    /// Its main branch name.
    pub branch_name: String,
}

/// Snapshot of every remote plus the pipeline-wide selection.
///
/// Only the selector mutates this; everyone else receives copies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RepositoryStatus {
    /// Remotes in configured order.
    pub remotes: Vec<RemoteStatus>,
    /// Commit the working tree is reset to.
    pub selected: Option<Selection>,
    /// `accepted_main.commit_id` only ever moves to a descendant, unless the
    /// providing remote allows force pushes.
    pub accepted_main: Option<AcceptedMain>,
    /// Set when no main branch could be validated.
    pub error: Option<String>,
}

impl RepositoryStatus {
    /// Empty status for the configured remotes.
    pub fn new(specs: &[RemoteSpec]) -> Self {
        Self {
            remotes: specs.iter().map(RemoteStatus::from_spec).collect(),
            ..Default::default()
        }
    }

    /// Status of one remote.
    pub fn remote(&self, name: &str) -> Option<&RemoteStatus> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// Mutable status of one remote.
    pub fn remote_mut(&mut self, name: &str) -> Option<&mut RemoteStatus> {
        self.remotes.iter_mut().find(|r| r.name == name)
    }

    /// Selected commit id.
    pub fn selected_commit_id(&self) -> Option<&str> {
        self.selected.as_ref().map(|s| s.commit_id.as_str())
    }

    /// Accepted main commit id.
    pub fn main_commit_id(&self) -> Option<&str> {
        self.accepted_main.as_ref().map(|m| m.commit_id.as_str())
    }

    /// Keeps statuses of known remotes, adds missing ones, drops unconfigured ones.
    pub fn sync_remotes(&mut self, specs: &[RemoteSpec]) {
        let mut next = Vec::with_capacity(specs.len());
        for spec in specs {
            let status = match self.remote(&spec.name) {
                Some(existing) if existing.url == spec.url => existing.clone(),
                _ => RemoteStatus::from_spec(spec),
            };
            next.push(status);
        }
        self.remotes = next;
    }
}
