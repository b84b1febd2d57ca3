//! Conditions, loops, parallel groups, output extraction and failures

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use stepflow::config::EngineConfig;
use stepflow::markers::CollectingMarkerSink;
use stepflow::state::{RunStatus, StepStatus};
use stepflow::{ExecutionError, WorkflowError};

use crate::support::*;

#[tokio::test]
async fn test_two_fragment_steps_rejected_before_running() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: frags
steps:
  - {name: one, prompt_part: "first"}
  - {name: two, prompt_part: "second"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    match exec.execute(&wf, Default::default()).await {
        Err(WorkflowError::Validation(e)) => {
            assert!(
                e.problems.iter().any(|p| p.contains("more than one fragment step")),
                "{}",
                e
            );
        }
        other => panic!("expected validation error, got {:?}", other.map(|o| o.success())),
    }
    assert!(!dir.path().join(".stepflow").exists());
}

#[tokio::test]
async fn test_unused_input_rejected_before_running() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: unused
input:
  - name: ticket
steps:
  - {name: hello, bash: "echo hi"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec
        .execute(&wf, args(&[("ticket", json!("T-1"))]))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("input 'ticket' is declared but never used"),
        "{}",
        err
    );
}

#[tokio::test]
async fn test_inputs_coerced_and_missing_inputs_reported() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: math
input:
  - name: n
    type: int
steps:
  - {name: next, bash: "echo {{ n + 1 }}"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, args(&[("n", json!("3"))])).await.unwrap();
    assert!(outcome.success());
    assert_eq!(outcome.state().context.get("next"), Some(&json!("4")));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(err.to_string().contains("missing required arguments: n"), "{}", err);
}

#[tokio::test]
async fn test_false_condition_skips_step() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: cond
input:
  - name: flag
    type: bool
steps:
  - {name: maybe, if: "flag", bash: "echo ran"}
  - {name: always, bash: "echo done"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, args(&[("flag", json!("false"))])).await.unwrap();
    let state = outcome.state();
    assert_eq!(state.step("maybe").unwrap().status, StepStatus::Skipped);
    assert!(state.context.get("maybe").is_none());
    assert_eq!(state.context.get("always"), Some(&json!("done")));
}

#[tokio::test]
async fn test_for_loop_joins_ordered_array() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: fanout
input:
  - name: files
    type: json
steps:
  - name: each
    for: {f: "files"}
    bash: "echo {{ f }}"
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec
        .execute(&wf, args(&[("files", json!(["a", "b", "c"]))]))
        .await
        .unwrap();
    let state = outcome.state();
    assert_eq!(state.context.get("each"), Some(&json!(["a", "b", "c"])));
    for i in 0..3 {
        assert_eq!(
            state.step(&format!("each[{}]", i)).unwrap().status,
            StepStatus::Completed
        );
    }
    assert_eq!(state.step("each").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_for_loop_lockstep_and_text_join() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: pairs
steps:
  - name: pair
    for:
      a: [x, y]
      b: [1, 2]
    bash: "echo {{ a }}{{ b }}"
    join: text
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    assert_eq!(outcome.state().context.get("pair"), Some(&json!("x1\ny2")));
}

#[tokio::test]
async fn test_for_loop_lists_must_match() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: uneven
steps:
  - name: pair
    for:
      a: [x, y]
      b: [1]
    bash: "echo {{ a }}{{ b }}"
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(err.to_string().contains("differ in length"), "{}", err);
}

#[tokio::test]
async fn test_while_false_runs_zero_iterations() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: idle
steps:
  - {name: poll, while: "false", bash: "echo tick"}
  - {name: after, bash: "echo {{ poll | length }}"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    let state = outcome.state();
    assert_eq!(state.context.get("poll"), Some(&json!([])));
    assert_eq!(state.context.get("after"), Some(&json!("0")));
    assert!(state.step("poll[0]").is_none());
}

#[tokio::test]
async fn test_while_exceeding_max_fails() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: spin
steps:
  - name: poll
    while: {condition: "true", max: 2}
    bash: "echo tick"
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(
        matches!(
            err,
            WorkflowError::Execution(ExecutionError::LoopDidNotConverge { max: 2, .. })
        ),
        "{}",
        err
    );
    let state = only_run_state(dir.path(), "spin");
    assert_eq!(state.step("poll[1]").unwrap().status, StepStatus::Completed);
    assert_eq!(state.step("poll").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_repeat_runs_at_least_once() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: once
steps:
  - {name: poll, repeat: {until: "true"}, bash: "echo tick"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    assert_eq!(outcome.state().context.get("poll"), Some(&json!(["tick"])));
}

#[tokio::test]
async fn test_repeat_sees_its_previous_output() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: counter
steps:
  - name: count
    repeat:
      until: "count | int >= 3"
      max: 5
    bash: "echo {% if count %}{{ count | int + 1 }}{% else %}1{% endif %}"
    join: lastOf
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    let state = outcome.state();
    assert_eq!(state.context.get("count"), Some(&json!("3")));
    assert!(state.step("count[2]").is_some());
    assert!(state.step("count[3]").is_none());
}

#[tokio::test]
async fn test_repeat_without_convergence_fails() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: stubborn
steps:
  - {name: poll, repeat: {until: "false", max: 2}, bash: "echo tick"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(err.to_string().contains("did not converge after 2"), "{}", err);
}

#[tokio::test]
async fn test_non_zero_exit_carries_stderr() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: broken
steps:
  - {name: build, bash: "echo partial; echo boom >&2; exit 1"}
  - {name: after, bash: "echo never"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    match &err {
        WorkflowError::Execution(ExecutionError::NonZeroExit {
            step,
            code,
            detail,
            stdout,
            ..
        }) => {
            assert_eq!(step, "build");
            assert_eq!(*code, 1);
            assert_eq!(detail, "boom");
            assert_eq!(stdout, "partial\n");
        }
        other => panic!("unexpected error: {}", other),
    }

    let state = only_run_state(dir.path(), "broken");
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state.error.as_deref().unwrap().contains("boom"));
    assert_eq!(state.step("build").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("after").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn test_non_zero_exit_falls_back_to_stdout() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: quiet
steps:
  - {name: build, bash: "echo only-stdout; exit 2"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(err.to_string().contains("status 2: only-stdout"), "{}", err);
}

#[tokio::test]
async fn test_timeout_is_its_own_failure_kind() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: slow
steps:
  - {name: wait, bash: "sleep 5", timeout: 1}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(err.is_timeout(), "{}", err);
    assert!(matches!(
        err,
        WorkflowError::Execution(ExecutionError::Timeout { secs: 1, .. })
    ));
}

#[tokio::test]
async fn test_schema_checked_agent_output() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: answer
steps:
  - name: ask
    agent: "What is the answer?"
    output:
      schema:
        type: object
        required: [result]
        properties:
          result: {type: integer}
  - {name: show, bash: "echo {{ ask.result }}"}
"#,
    );
    let agent = ScriptedAgent::new(&["Sure.\n```json\n{\"result\": 42}\n```\n"]);
    let exec = executor(&dir, registry(vec![wf.clone()]), agent.clone());

    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    let state = outcome.state();
    assert_eq!(state.context.get("ask"), Some(&json!({"result": 42})));
    assert_eq!(state.context.get("show"), Some(&json!("42")));
    assert_eq!(agent.prompts(), vec!["What is the answer?".to_string()]);
}

#[tokio::test]
async fn test_unparsable_output_fails_with_raw_text() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: answer
steps:
  - {name: ask, agent: "Give JSON", output: {type: json}}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&["not json at all"]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("output validation failed"), "{}", text);
    assert!(text.contains("not json at all"), "{}", text);
}

#[tokio::test]
async fn test_schema_mismatch_fails() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: answer
steps:
  - name: ask
    agent: "Give JSON"
    output:
      schema: {type: object, required: [result]}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&["{\"other\": 1}"]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(
        matches!(
            err,
            WorkflowError::Execution(ExecutionError::OutputValidation { .. })
        ),
        "{}",
        err
    );
}

#[tokio::test]
async fn test_agent_failure_names_the_step() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: lonely
steps:
  - {name: ask, agent: "hello?"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    let WorkflowError::Execution(inner) = &err else {
        panic!("unexpected error: {}", err);
    };
    assert_eq!(inner.step_name(), Some("ask"));
    assert!(err.to_string().contains("agent invocation failed"), "{}", err);
}

#[tokio::test]
async fn test_parallel_outputs_merge_into_context() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: fan
steps:
  - name: checks
    parallel:
      - {name: lint, bash: "echo one"}
      - {name: test, bash: "echo two"}
  - {name: report, bash: "echo {{ lint }} {{ checks.test }}"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    let state = outcome.state();
    assert_eq!(
        state.context.get("checks"),
        Some(&json!({"lint": "one", "test": "two"}))
    );
    assert_eq!(state.context.get("report"), Some(&json!("one two")));
}

#[tokio::test]
async fn test_parallel_failure_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: fan
steps:
  - name: checks
    parallel:
      - {name: good, bash: "echo fine"}
      - {name: bad, bash: "exit 3"}
  - {name: after, bash: "echo never"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(
        matches!(
            err,
            WorkflowError::Execution(ExecutionError::NonZeroExit { code: 3, .. })
        ),
        "{}",
        err
    );

    let state = only_run_state(dir.path(), "fan");
    assert_eq!(state.step("good").unwrap().status, StepStatus::Completed);
    assert_eq!(state.step("bad").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("checks").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("after").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn test_parallel_members_overlap() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: naps
steps:
  - name: both
    parallel:
      - {name: first, bash: "sleep 1; echo a"}
      - {name: second, bash: "sleep 1; echo b"}
"#,
    );
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]));

    let started = Instant::now();
    let outcome = exec.execute(&wf, Default::default()).await.unwrap();
    let elapsed = started.elapsed();
    assert!(outcome.success());
    assert!(elapsed < Duration::from_millis(1800), "took {:?}", elapsed);
    assert_eq!(
        outcome.state().context.get("both"),
        Some(&json!({"first": "a", "second": "b"}))
    );
}

#[tokio::test]
async fn test_no_member_starts_after_a_failure() {
    let dir = TempDir::new().unwrap();
    let wf = workflow(
        r#"
name: serial
steps:
  - name: checks
    parallel:
      - {name: broken, bash: "exit 2"}
      - {name: later, bash: "touch later_ran"}
"#,
    );
    let sink = Arc::new(CollectingMarkerSink::new());
    let exec = executor(&dir, registry(vec![wf.clone()]), ScriptedAgent::new(&[]))
        .with_config(EngineConfig {
            max_parallel: 1,
            ..test_config()
        })
        .with_observer(sink.clone());

    let err = exec.execute(&wf, Default::default()).await.unwrap_err();
    assert!(
        matches!(
            err,
            WorkflowError::Execution(ExecutionError::NonZeroExit { code: 2, .. })
        ),
        "{}",
        err
    );
    assert_eq!(sink.latest("broken").unwrap().status, StepStatus::Failed);
    assert!(sink.markers().iter().all(|m| m.step_name != "later"));
    assert!(!dir.path().join("later_ran").exists());
}
