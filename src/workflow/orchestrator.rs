//! Workflow Orchestrator
//!
//! Front door for running workflows: validates against the tool registry,
//! announces the plan with `workflow.planned`, then hands the graph to the
//! engine. Planner output takes the same path as hand-written workflows.

use std::sync::Arc;

use log::info;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::model::{StepGraph, Workflow};
use super::plan::{planning_prompt, PlanSource};
use super::registry::ToolRegistry;
use super::validator::{validate_workflow, ValidationError};
use crate::error::OrchestratorError;
use crate::events::{Event, EventKind};
use crate::execution::{Engine, SessionId};

/// Validates workflows and submits them for execution.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    registry: Arc<dyn ToolRegistry>,
    engine: Engine,
}

impl WorkflowOrchestrator {
    pub fn new(registry: Arc<dyn ToolRegistry>, engine: Engine) -> Self {
        Self { registry, engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Validates a workflow without running it.
    pub fn validate(&self, workflow: &Workflow) -> Result<StepGraph, ValidationError> {
        validate_workflow(workflow, self.registry.as_ref())
    }

    /// Validates and starts a workflow. Nothing runs if validation fails.
    pub fn submit(
        &self,
        workflow: &Workflow,
        initial_state: Option<Map<String, Value>>,
    ) -> Result<SessionId, OrchestratorError> {
        self.submit_planned(workflow, initial_state, None)
    }

    /// Builds a planner prompt for `request` listing every registered tool.
    pub fn planning_prompt(&self, request: &str, context: Option<&Value>) -> String {
        planning_prompt(request, &self.registry.tools(), context)
    }

    /// Asks `planner` for a workflow that fulfils `request`, then submits it.
    pub async fn execute_request(
        &self,
        planner: &dyn PlanSource,
        request: &str,
        context: Option<&Value>,
    ) -> Result<SessionId, OrchestratorError> {
        info!("Planning workflow for request: {}", request);
        let workflow = planner.plan(request, context).await?;
        self.submit_planned(&workflow, None, Some(request))
    }

    fn submit_planned(
        &self,
        workflow: &Workflow,
        initial_state: Option<Map<String, Value>>,
        request: Option<&str>,
    ) -> Result<SessionId, OrchestratorError> {
        let graph = self.validate(workflow)?;
        let session_id = Uuid::new_v4().to_string();

        let mut payload = json!({
            "steps": graph.len(),
            "order": graph.topological_order(),
            "failure_policy": graph.failure_policy(),
        });
        if let Some(request) = request {
            payload["request"] = json!(request);
        }
        self.engine
            .events()
            .publish(Event::new(EventKind::WorkflowPlanned, &session_id, payload));

        let id = self.engine.start_with_id(&session_id, graph, initial_state)?;
        info!("Submitted workflow as session {}", id);
        Ok(id)
    }
}
