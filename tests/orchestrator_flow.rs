//! Validation and submission through the orchestrator.

mod common;

use std::fs;
use std::sync::Arc;

use serde_json::{json, Map};
use tempfile::tempdir;

use common::{registry, ScriptedInvoker};
use toolrunner::events::{EventFilter, EventKind};
use toolrunner::execution::{Engine, SessionStatus};
use toolrunner::workflow::{
    load_workflow, InMemoryRegistry, Step, ValidationError, Workflow, WorkflowOrchestrator,
};
use toolrunner::OrchestratorError;

#[tokio::test]
async fn test_cycle_is_rejected_without_session() {
    let engine = Engine::new(ScriptedInvoker::new());
    let orchestrator = WorkflowOrchestrator::new(Arc::new(registry(&["t.run"])), engine);

    let workflow = Workflow::from_steps(vec![
        Step::new("a", "t", "run").depends_on("c"),
        Step::new("b", "t", "run").depends_on("a"),
        Step::new("c", "t", "run").depends_on("b"),
    ]);

    let err = orchestrator.submit(&workflow, None).unwrap_err();
    match err {
        OrchestratorError::Validation(ValidationError::Cycle { steps }) => {
            let mut sorted = steps.clone();
            sorted.sort();
            assert_eq!(sorted, vec!["a", "b", "c"]);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }

    assert!(orchestrator.engine().list_sessions().is_empty());
    assert!(orchestrator.engine().events().history(None).is_empty());
}

#[tokio::test]
async fn test_unknown_tool_is_rejected() {
    let engine = Engine::new(ScriptedInvoker::new());
    let orchestrator = WorkflowOrchestrator::new(Arc::new(registry(&["t.run"])), engine);

    let workflow = Workflow::from_steps(vec![Step::new("a", "ghost", "run")]);
    let err = orchestrator.submit(&workflow, None).unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::UnknownTool { .. })
    ));
    assert!(orchestrator.engine().list_sessions().is_empty());
}

#[tokio::test]
async fn test_validated_graph_keeps_every_step() {
    let engine = Engine::new(ScriptedInvoker::new());
    let orchestrator = WorkflowOrchestrator::new(Arc::new(registry(&["t.run"])), engine);

    let workflow = Workflow::from_steps(vec![
        Step::new("d", "t", "run").depends_on("b").depends_on("c"),
        Step::new("b", "t", "run").depends_on("a"),
        Step::new("c", "t", "run").depends_on("a"),
        Step::new("a", "t", "run"),
    ]);
    let graph = orchestrator.validate(&workflow).unwrap();

    let mut ids: Vec<_> = graph.steps().iter().map(|s| s.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);

    let order = graph.topological_order();
    let position = |id: &str| order.iter().position(|s| s == id).unwrap();
    assert!(position("a") < position("b"));
    assert!(position("a") < position("c"));
    assert!(position("c") < position("d"));
}

#[tokio::test]
async fn test_files_to_completed_session() {
    let dir = tempdir().unwrap();
    let manifest_path = dir.path().join("tools.yaml");
    let workflow_path = dir.path().join("flow.yaml");

    fs::write(
        &manifest_path,
        r#"
tools:
  - name: search
    actions:
      - name: query
        required: [term]
  - name: report
    actions:
      - name: write
        required: [hits]
"#,
    )
    .unwrap();
    fs::write(
        &workflow_path,
        r#"
inputs: [topic]
steps:
  - id: find
    tool: search
    action: query
    params:
      term: $topic
  - id: summarize
    tool: report
    action: write
    depends_on: [find]
    params:
      hits: $find.term
"#,
    )
    .unwrap();

    let registry = InMemoryRegistry::load(&manifest_path).unwrap();
    let workflow = load_workflow(&workflow_path).unwrap();

    let invoker = ScriptedInvoker::new();
    let orchestrator = WorkflowOrchestrator::new(Arc::new(registry), Engine::new(invoker.clone()));

    let mut inputs = Map::new();
    inputs.insert("topic".into(), json!("rust"));
    let id = orchestrator.submit(&workflow, Some(inputs)).unwrap();
    let session = orchestrator.engine().wait(&id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.state["summarize"], json!({"hits": "rust"}));
    assert_eq!(invoker.calls_to("search.query")[0].params["term"], json!("rust"));

    let planned = orchestrator
        .engine()
        .events()
        .history(Some(&EventFilter::new().kind(EventKind::WorkflowPlanned)));
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].payload["order"], json!(["find", "summarize"]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_tools_run_end_to_end() {
    use toolrunner::execution::CommandInvoker;

    let dir = tempdir().unwrap();
    let manifest_path = dir.path().join("tools.yaml");
    fs::write(
        &manifest_path,
        r#"
tools:
  - name: shell
    actions:
      - name: echo
        command: ["cat"]
"#,
    )
    .unwrap();

    let registry = InMemoryRegistry::load(&manifest_path).unwrap();
    let engine = Engine::new(Arc::new(CommandInvoker::new()));
    let orchestrator = WorkflowOrchestrator::new(Arc::new(registry), engine);

    let workflow = Workflow::from_steps(vec![
        Step::new("first", "shell", "echo").with_param("n", json!(7)),
        Step::new("second", "shell", "echo")
            .with_param("from_first", json!("$first.n"))
            .depends_on("first"),
    ]);
    let id = orchestrator.submit(&workflow, None).unwrap();
    let session = orchestrator.engine().wait(&id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.state["second"], json!({"from_first": 7}));
}
