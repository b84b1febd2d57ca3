//! Run directory layout, workflow switches and workspace claims

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use stepflow::markers::read_markers;
use stepflow::state::{RunStatus, StepStatus};
use stepflow::WorkflowError;

use crate::support::*;

#[tokio::test]
async fn test_run_directory_layout() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: layout
steps:
  - {name: first, bash: "echo one"}
  - {name: second, bash: "echo two", hidden: true}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));
    let outcome = exec.execute(&wf, Default::default()).await.unwrap();

    let run_dir = only_run_dir(dir.path(), "layout");
    assert_eq!(outcome.state().run_dir, run_dir);
    assert_eq!(outcome.state().status, RunStatus::Completed);

    let mut entries: Vec<String> = std::fs::read_dir(&run_dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["markers".to_string(), "state.json".to_string()]);

    let markers = read_markers(&run_dir).unwrap();
    let names: Vec<&str> = markers.iter().map(|m| m.step_name.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);
    assert!(markers.iter().all(|m| m.status == StepStatus::Completed));
    assert!(markers[1].hidden);
    assert_eq!(markers[0].total_steps, 2);
    assert_eq!(markers[1].output, Some(json!("two")));
}

#[tokio::test]
async fn test_context_carries_run_identity() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: identity
steps:
  - {name: who, bash: "echo {{ workflow_name }} $STEPFLOW_RUN_ID"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));
    let outcome = exec.execute(&wf, Default::default()).await.unwrap();

    let state = outcome.state();
    assert_eq!(state.context.get("run_id"), Some(&json!(state.run_id)));
    assert_eq!(
        state.context.get("who"),
        Some(&json!(format!("identity {}", state.run_id)))
    );
}

#[tokio::test]
async fn test_workflow_log() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: logged
config: {log_workflow: true}
steps:
  - {name: only, bash: "echo hi"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));
    exec.execute(&wf, Default::default()).await.unwrap();

    let log = std::fs::read_to_string(only_run_dir(dir.path(), "logged").join("workflow.log")).unwrap();
    assert!(log.contains("only"), "{}", log);
    assert!(log.lines().count() >= 2, "{}", log);
}

#[tokio::test]
async fn test_no_workflow_log_by_default() {
    let dir = TempDir::new().unwrap();
    let wf = workflow("name: quiet\nsteps:\n  - {name: only, bash: \"echo hi\"}\n");
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));
    exec.execute(&wf, Default::default()).await.unwrap();

    assert!(!only_run_dir(dir.path(), "quiet").join("workflow.log").exists());
}

#[tokio::test]
async fn test_artifacts_directory() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: crafted
config: {create_artifacts: true}
steps:
  - {name: has_dir, bash: "test -d \"$STEPFLOW_ARTIFACTS_DIR\" && echo yes"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));
    let outcome = exec.execute(&wf, Default::default()).await.unwrap();

    let artifacts = only_run_dir(dir.path(), "crafted").join("artifacts");
    assert!(artifacts.is_dir());
    let state = outcome.state();
    assert_eq!(state.context.get("has_dir"), Some(&json!("yes")));
    assert_eq!(
        state.context.get("artifacts_dir"),
        Some(&json!(artifacts.display().to_string()))
    );
}

#[tokio::test]
async fn test_workspace_claim_wraps_the_run() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: claimed
config: {claim_workspace: true}
steps:
  - {name: only, bash: "exit 3"}
"#,
    );
    let claimer = Arc::new(RecordingClaimer::default());
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]))
        .with_claimer(claimer.clone());

    // Released even when the run fails
    assert!(exec.execute(&wf, Default::default()).await.is_err());
    assert_eq!(
        *claimer.calls.lock().unwrap(),
        vec!["claim claimed".to_string(), "release claimed".to_string()]
    );
}

#[tokio::test]
async fn test_no_claim_unless_requested() {
    let dir = TempDir::new().unwrap();
    let wf = workflow("name: free\nsteps:\n  - {name: only, bash: \"echo hi\"}\n");
    let claimer = Arc::new(RecordingClaimer::default());
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]))
        .with_claimer(claimer.clone());

    exec.execute(&wf, Default::default()).await.unwrap();
    assert!(claimer.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_run_is_persisted() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: broken
steps:
  - {name: ok, bash: "echo fine"}
  - {name: bad, bash: "echo nope >&2; exit 2"}
  - {name: never, bash: "echo unreachable"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));
    exec.execute(&wf, Default::default()).await.unwrap_err();

    let state = only_run_state(dir.path(), "broken");
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_step_index, 1);
    assert!(state.error.as_deref().unwrap().contains("nope"));
    assert_eq!(state.step("ok").unwrap().status, StepStatus::Completed);
    assert_eq!(state.step("never").unwrap().status, StepStatus::Pending);

    let summary = state.summary();
    assert_eq!(summary.get(&StepStatus::Failed), Some(&1));
}

#[tokio::test]
async fn test_run_by_unknown_name() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir, registry(vec![]), ScriptedAgent::new(&[]));
    let err = exec.run("missing", Default::default()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)), "{}", err);
}
