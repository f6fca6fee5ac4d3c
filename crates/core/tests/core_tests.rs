//! Integration tests for the core crate.

use gitops_core::api::GateKind;
use gitops_core::deployment::{Deployment, DeploymentStatus, Operation};
use gitops_core::generation::{BuildStatus, EvalStatus, Generation, Lifecycle, TransitionError};
use gitops_core::model::Selection;

fn selection(commit: &str, is_testing: bool) -> Selection {
    Selection {
        commit_id: commit.into(),
        commit_msg: "msg".into(),
        remote_name: "origin".into(),
        branch_name: if is_testing { "testing".into() } else { "main".into() },
        is_testing,
        signed: false,
        signed_by: None,
        should_be_signed: false,
    }
}

fn evaluated(commit: &str) -> Generation {
    let mut g = Generation::new(selection(commit, false), Some(commit.into()), "flake", "host");
    g.begin_eval(1).unwrap();
    g.finish_eval(2, Ok(("/drv".into(), "/out".into()))).unwrap();
    g
}

#[test]
fn lifecycle_happy_path() {
    let mut g = evaluated("c1");
    assert_eq!(g.eval_status(), EvalStatus::Evaluated);
    assert_eq!(g.build_status(), BuildStatus::Init);

    let drv = g.begin_build(3).unwrap();
    assert_eq!(drv, "/drv");
    assert_eq!(g.build_status(), BuildStatus::Building);

    g.finish_build(4, Ok(())).unwrap();
    assert!(g.is_built());
    assert_eq!(g.out_path(), Some("/out"));
}

#[test]
fn build_guards_are_distinguishable() {
    let mut g = Generation::new(selection("c1", false), None, "flake", "host");
    let err = g.begin_build(1).unwrap_err();
    assert!(matches!(err, TransitionError::NotEvaluated(_)));
    assert!(err.to_string().contains("not evaluated"));

    let mut g = evaluated("c1");
    g.begin_build(3).unwrap();
    let err = g.begin_build(3).unwrap_err();
    assert!(err.to_string().contains("already building"));

    g.finish_build(4, Ok(())).unwrap();
    let err = g.begin_build(5).unwrap_err();
    assert!(err.to_string().contains("already built"));
}

#[test]
fn failed_eval_blocks_build() {
    let mut g = Generation::new(selection("c1", false), None, "flake", "host");
    g.begin_eval(1).unwrap();
    g.finish_eval(2, Err("boom".into())).unwrap();
    assert_eq!(g.eval_status(), EvalStatus::Failed);
    assert_eq!(g.error(), Some("boom"));
    assert!(g.is_failed());
    assert!(matches!(g.begin_build(3), Err(TransitionError::NotEvaluated(_))));
}

#[test]
fn failed_build_can_be_retried() {
    let mut g = evaluated("c1");
    g.begin_build(3).unwrap();
    g.finish_build(4, Err("oom".into())).unwrap();
    assert_eq!(g.build_status(), BuildStatus::Failed);
    assert!(g.is_failed());
    assert!(g.begin_build(5).is_ok());
    assert!(!g.is_failed());
}

#[test]
fn finish_without_start_is_rejected() {
    let mut g = Generation::new(selection("c1", false), None, "flake", "host");
    assert!(matches!(
        g.finish_eval(1, Ok(("a".into(), "b".into()))),
        Err(TransitionError::Invalid { .. })
    ));
    assert!(matches!(g.finish_build(1, Ok(())), Err(TransitionError::Invalid { .. })));
    g.begin_eval(1).unwrap();
    assert!(g.begin_eval(2).is_err());
}

#[test]
fn lifecycle_serde_is_tagged() {
    let g = evaluated("c1");
    let v = serde_json::to_value(&g.lifecycle).unwrap();
    assert_eq!(v["state"], "evaluated");
    assert_eq!(v["eval"]["out_path"], "/out");
    let back: Lifecycle = serde_json::from_value(v).unwrap();
    assert_eq!(back, g.lifecycle);
}

#[test]
fn deployment_operation_follows_testing_flag() {
    let mut g = evaluated("c1");
    g.selection.is_testing = true;
    let d = Deployment::start(g);
    assert_eq!(d.operation, Operation::Test);
    assert_eq!(d.status, DeploymentStatus::Running);
    assert!(!d.is_finished());
}

#[test]
fn deployment_targets_compares_commit_and_operation() {
    let d = Deployment::start(evaluated("c1"));
    assert!(d.targets(&evaluated("c1")));
    assert!(!d.targets(&evaluated("c2")));

    let mut testing = evaluated("c1");
    testing.selection.is_testing = true;
    assert!(!d.targets(&testing));
}

#[test]
fn deployment_fail_keeps_end_time() {
    let mut d = Deployment::start(evaluated("c1"));
    d.succeed(true, Some("/profile".into()));
    let ended = d.ended_at_ms;
    d.fail("liveliness check failed");
    assert_eq!(d.ended_at_ms, ended);
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert!(d.restart_required);
}

#[test]
fn gate_kind_parses() {
    assert_eq!("build".parse::<GateKind>(), Ok(GateKind::Build));
    assert_eq!("deploy".parse::<GateKind>(), Ok(GateKind::Deploy));
    assert!("other".parse::<GateKind>().is_err());
    assert_eq!(serde_json::to_string(&GateKind::Deploy).unwrap(), r#""deploy""#);
}
