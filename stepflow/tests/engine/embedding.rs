//! Local prompts, embedded workflows, post steps and markers

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use stepflow::hitl::{HitlResult, SuspendHitlHandler};
use stepflow::loader::bundled_workflows;
use stepflow::markers::CollectingMarkerSink;
use stepflow::state::StepStatus;
use stepflow::{ExecutionError, RunOutcome, Validator, WorkflowError, WorkflowRegistry};

use crate::support::*;

const SUB_A: &str = r##"
name: subA
steps:
  - {name: prep, bash: "echo prepared"}
  - {name: frag, prompt_part: "A says {{ prep }}"}
  - {name: check, bash: "echo checked {{ frag }}"}
  - {name: done, bash: "echo done"}
"##;

const SUB_B: &str = r##"
name: subB
steps:
  - {name: frag, prompt_part: "B here"}
  - {name: check, bash: "echo b-check"}
"##;

#[tokio::test]
async fn test_embedded_markers_and_post_steps() {
    let dir = TempDir::new().unwrap();
    let outer = workflow(
        r##"
name: outer
steps:
  - name: ask
    agent: |
      #subA
      #subB
"##,
    );
    let agent = ScriptedAgent::new(&["answer"]);
    let sink = Arc::new(CollectingMarkerSink::new());
    let exec = executor(
        &dir,
        registry(vec![outer.clone(), workflow(SUB_A), workflow(SUB_B)]),
        agent.clone(),
    )
    .with_observer(sink.clone());

    let outcome = exec.execute(&outer, Default::default()).await.unwrap();
    assert!(outcome.success());
    assert_eq!(agent.prompts(), vec!["A says prepared\nB here\n".to_string()]);

    let prep = sink.latest("subA/prep").unwrap();
    assert_eq!(prep.step_index, 0);
    assert!(prep.is_pre_prompt_step);
    assert_eq!(prep.embedded_workflow_name.as_deref(), Some("subA"));
    assert_eq!(prep.workflow_name, "outer");

    let check = sink.latest("subA/check").unwrap();
    assert_eq!(check.step_index, 2);
    assert!(!check.is_pre_prompt_step);
    assert_eq!(check.output, Some(json!("checked A says prepared")));
    assert_eq!(sink.latest("subA/done").unwrap().step_index, 3);

    let other = sink.latest("subB/check").unwrap();
    assert_eq!(other.step_index, 1);
    assert_eq!(other.output, Some(json!("b-check")));

    // Post steps run only once the outer step has completed
    let markers = sink.markers();
    let ask_done = markers
        .iter()
        .position(|m| m.step_name == "ask" && m.status == StepStatus::Completed)
        .unwrap();
    let first_post = markers
        .iter()
        .position(|m| m.step_name == "subA/check")
        .unwrap();
    assert!(ask_done < first_post);

    // Embedded outputs never leak into the outer context
    let state = outcome.state();
    assert!(state.context.get("prep").is_none());
    assert_eq!(state.step("subB/check").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_heading_fragment_splicing() {
    let dir = TempDir::new().unwrap();
    let doc = workflow(
        r##"
name: doc
steps:
  - {name: frag, prompt_part: "# Heading\nbody"}
"##,
    );
    let plain = workflow(
        r##"
name: plain
steps:
  - {name: frag, prompt_part: "plain words"}
"##,
    );
    let mid = workflow("name: mid\nsteps:\n  - {name: ask, agent: \"Intro: #doc\"}\n");
    let start = workflow("name: start\nsteps:\n  - {name: ask, agent: \"Intro:\\n#doc\"}\n");
    let inline = workflow("name: inline\nsteps:\n  - {name: ask, agent: \"Intro: #plain\"}\n");

    let agent = ScriptedAgent::new(&["ok", "ok", "ok"]);
    let exec = executor(
        &dir,
        registry(vec![doc, plain, mid.clone(), start.clone(), inline.clone()]),
        agent.clone(),
    );
    exec.execute(&mid, Default::default()).await.unwrap();
    exec.execute(&start, Default::default()).await.unwrap();
    exec.execute(&inline, Default::default()).await.unwrap();

    assert_eq!(
        agent.prompts(),
        vec![
            "Intro: \n\n# Heading\nbody".to_string(),
            "Intro:\n# Heading\nbody".to_string(),
            "Intro: plain words".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_local_prompt_with_nested_workflow_reference() {
    let dir = TempDir::new().unwrap();
    let greet = workflow(
        r##"
name: greet
input:
  - name: who
steps:
  - {name: frag, prompt_part: "Hello {{ who }}"}
"##,
    );
    let caller = workflow(
        r##"
name: caller
prompts:
  _tone:
    input: [{name: mood}]
    content: "Be {{ mood }}. #greet(who=world)"
steps:
  - {name: ask, agent: "#_tone(calm)"}
"##,
    );
    let agent = ScriptedAgent::new(&["ok"]);
    let exec = executor(&dir, registry(vec![greet, caller.clone()]), agent.clone());

    exec.execute(&caller, Default::default()).await.unwrap();
    assert_eq!(agent.prompt_for("ask").as_deref(), Some("Be calm. Hello world"));
}

#[tokio::test]
async fn test_pre_step_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let fragile = workflow(
        r##"
name: fragile
steps:
  - {name: prep, bash: "echo nope >&2; exit 4"}
  - {name: frag, prompt_part: "never rendered"}
"##,
    );
    let outer = workflow("name: outer\nsteps:\n  - {name: ask, agent: \"#fragile\", hitl: true}\n");
    let agent = ScriptedAgent::new(&["unused"]);
    let exec = executor(&dir, registry(vec![fragile, outer.clone()]), agent.clone());

    let err = exec.execute(&outer, Default::default()).await.unwrap_err();
    match &err {
        WorkflowError::Execution(ExecutionError::Embedded { workflow, source }) => {
            assert_eq!(workflow, "fragile");
            assert!(matches!(**source, ExecutionError::NonZeroExit { code: 4, .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(agent.prompts().is_empty());

    let state = only_run_state(dir.path(), "outer");
    assert_eq!(state.step("fragile/prep").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("ask").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_invalid_embedded_workflow_is_rejected_before_running() {
    let dir = TempDir::new().unwrap();
    let shoddy = workflow(
        r##"
name: shoddy
input:
  - {name: extra, default: x}
steps:
  - {name: frag, prompt_part: "text"}
"##,
    );
    let outer = workflow(
        r##"
name: outer
steps:
  - {name: side, bash: "touch side_effect"}
  - {name: ask, agent: "#shoddy"}
"##,
    );
    let agent = ScriptedAgent::new(&["unused"]);
    let exec = executor(&dir, registry(vec![shoddy, outer.clone()]), agent.clone());

    let err = exec.execute(&outer, Default::default()).await.unwrap_err();
    let WorkflowError::Validation(e) = &err else {
        panic!("expected validation error, got {}", err);
    };
    assert_eq!(e.workflow, "outer");
    assert!(
        e.problems
            .iter()
            .any(|p| p.contains("shoddy") && p.contains("input 'extra' is declared but never used")),
        "{}",
        e
    );
    assert!(!dir.path().join("side_effect").exists());
    assert!(agent.prompts().is_empty());
}

#[tokio::test]
async fn test_bound_values_with_commas_and_parentheses() {
    let dir = TempDir::new().unwrap();
    let sub = workflow(
        r##"
name: sub
input:
  - name: who
steps:
  - {name: frag, prompt_part: "Topic: {{ who }}"}
"##,
    );
    let outer = workflow(
        r##"
name: outer
input:
  - name: topic
prompts:
  _twice:
    input: [{name: first}, {name: second}]
    content: "{{ first }} / {{ second }}"
steps:
  - {name: ask, agent: "#sub({{ topic }})"}
  - {name: again, agent: "#_twice({{ topic }}, second=\"x, (y)\")"}
"##,
    );
    let agent = ScriptedAgent::new(&["ok", "ok"]);
    let exec = executor(&dir, registry(vec![sub, outer.clone()]), agent.clone());

    let outcome = exec
        .execute(&outer, args(&[("topic", json!("apples, pears (and figs)"))]))
        .await
        .unwrap();
    assert!(outcome.success());
    assert_eq!(
        agent.prompt_for("ask").as_deref(),
        Some("Topic: apples, pears (and figs)")
    );
    assert_eq!(
        agent.prompt_for("again").as_deref(),
        Some("apples, pears (and figs) / x, (y)")
    );
}

#[tokio::test]
async fn test_reference_in_untaken_branch_is_not_expanded() {
    let dir = TempDir::new().unwrap();
    let outer = workflow(
        r##"
name: outer
input:
  - {name: deep, default: "no"}
steps:
  - name: ask
    agent: "Start.{% if deep == 'yes' %} #subA{% endif %}"
"##,
    );
    let agent = ScriptedAgent::new(&["ok"]);
    let sink = Arc::new(CollectingMarkerSink::new());
    let exec = executor(&dir, registry(vec![outer.clone(), workflow(SUB_A)]), agent.clone())
        .with_observer(sink.clone());

    exec.execute(&outer, Default::default()).await.unwrap();
    assert_eq!(agent.prompt_for("ask").as_deref(), Some("Start."));
    assert!(sink.latest("subA/prep").is_none());
}

#[tokio::test]
async fn test_post_steps_survive_suspension() {
    let dir = TempDir::new().unwrap();
    let outer = workflow("name: outer\nsteps:\n  - {name: ask, agent: \"#subA\", hitl: true}\n");
    let workflows = vec![outer.clone(), workflow(SUB_A)];

    let first = executor(&dir, registry(workflows.clone()), ScriptedAgent::new(&["answer"]))
        .with_hitl_handler(Arc::new(SuspendHitlHandler));
    let outcome = first.execute(&outer, Default::default()).await.unwrap();
    let RunOutcome::Suspended(state) = outcome else {
        panic!("expected a suspended run");
    };
    let pending = state.pending_hitl.as_ref().unwrap();
    assert_eq!(pending.post.len(), 1);
    assert_eq!(pending.post[0].workflow, "subA");
    assert_eq!(pending.post[0].first_index, 2);
    assert!(state.step("subA/check").is_none());

    let second = executor(&dir, registry(workflows), ScriptedAgent::new(&[]));
    let outcome = second
        .resume(&state.state_path(), Some(HitlResult::Accept))
        .await
        .unwrap();
    let state = outcome.state();
    assert_eq!(state.context.get("ask"), Some(&json!("answer")));
    assert_eq!(
        state.step("subA/check").unwrap().output,
        Some(json!("checked A says prepared"))
    );
    assert_eq!(state.step("subA/done").unwrap().status, StepStatus::Completed);
}

#[test]
fn test_bundled_workflows_validate() {
    let registry = WorkflowRegistry::from_workflows(bundled_workflows());
    let validator = Validator::new(&registry);
    for wf in registry.iter() {
        if let Err(e) = validator.validate(wf) {
            panic!("{}", e);
        }
    }
}

#[tokio::test]
async fn test_bundled_review_workflow_end_to_end() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(WorkflowRegistry::from_workflows(bundled_workflows()));
    let review = registry.get("review").unwrap();
    let agent = ScriptedAgent::new(&[
        r#"{"findings": ["missing tests"], "approved": false}"#,
        "- add tests",
    ]);
    let exec = executor(&dir, registry.clone(), agent.clone());

    let outcome = exec.execute(&review, Default::default()).await.unwrap();
    assert!(outcome.success());

    let prompt = agent.prompt_for("review").unwrap();
    assert!(prompt.contains("with a focus on correctness"), "{}", prompt);
    assert!(prompt.contains("\n## Project context"), "{}", prompt);
    assert!(
        prompt.contains("Answer with a single JSON object containing findings as a list of strings, approved as a boolean."),
        "{}",
        prompt
    );
    assert!(agent.prompt_for("summary").unwrap().contains("- missing tests"));

    let state = outcome.state();
    assert_eq!(state.step("context/listing").unwrap().status, StepStatus::Completed);
    assert_eq!(state.step("context/delivered").unwrap().status, StepStatus::Completed);
    assert_eq!(state.context.get("summary"), Some(&json!("- add tests")));
}
