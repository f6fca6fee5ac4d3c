#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! GitOps reconciliation daemon: follows git remotes, selects the commit this
//! host should run, then evaluates, builds and deploys it behind optional
//! confirmation gates.

/// Evaluation and build of selected commits.
pub mod builder;
/// TOML configuration.
pub mod config;
pub mod confirm;
/// Single-slot deployment queue.
pub mod deployer;
/// Errors callers can match on.
pub mod error;
/// Evaluate/build/deploy collaborators.
pub mod exec;
/// Poll scheduling and the fetch loop.
pub mod fetcher;
/// Git access for the selector.
pub mod git;
/// Finished deployment history.
pub mod history;
/// Liveliness check and post-deployment hook.
pub mod hooks;
/// HTTP control surface.
pub mod http;
pub mod manager;
pub mod selector;
pub mod task;

#[cfg(test)]
mod testing;
