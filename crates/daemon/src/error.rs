use gitops_core::api::GateKind;
use gitops_core::generation::TransitionError;
use thiserror::Error;

/// Errors returned synchronously by the builder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// `build` called before any evaluation.
    #[error("nothing to build: not evaluated yet")]
    NothingEvaluated,
    /// `eval` called without a selected commit.
    #[error("repository status has no selected commit")]
    NoSelection,
    /// The current generation refused the transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Errors returned synchronously by the confirmation gates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfirmError {
    /// Blank id.
    #[error("empty confirmation id")]
    EmptyId,
    /// No generation exists yet.
    #[error("unknown id {id}: no generation is awaiting {gate} confirmation")]
    Unknown { gate: GateKind, id: String },
    /// The id is not the current generation.
    #[error("id {requested} does not match the current generation {current}")]
    Mismatch { requested: String, current: String },
    /// The confirmer task is gone.
    #[error("{0} gate is shut down")]
    Closed(GateKind),
}

/// Configuration rejected by [`Config::validate`](crate::config::Config::validate).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No `[[remotes]]`.
    #[error("at least one remote must be configured")]
    NoRemotes,
    /// Two remotes share a name.
    #[error("remote '{0}' is configured more than once")]
    DuplicateRemote(String),
    /// Blank name, url or branch.
    #[error("remote '{remote}' has an empty {what}")]
    EmptyField { remote: String, what: &'static str },
    /// `auto` mode needs a positive `auto_confirm_secs`.
    #[error("{0} confirmation uses auto mode but auto_confirm_secs is not a positive number")]
    AutoWithoutDuration(GateKind),
    /// A timeout of zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}
