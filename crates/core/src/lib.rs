#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models for the gitops reconciliation daemon.

/// Control-surface request and response types.
pub mod api;
/// Deployments of built generations.
pub mod deployment;
/// Evaluate+build attempts and their lifecycle.
pub mod generation;
/// Remotes, repository status and selection.
pub mod model;

mod util;

pub use util::{new_id, now_ms};
