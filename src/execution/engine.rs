//! Workflow Execution Engine
//!
//! The core engine that runs validated step graphs:
//! - Concurrent dispatch of eligible steps with an optional limit
//! - Output propagation into session state
//! - Retry, timeout and failure-policy handling
//! - Cooperative cancellation
//!
//! Each session is driven by its own task. The driver is the only code that
//! decides what to dispatch next, and every session mutation goes through
//! the session's [`SessionHandle`], so scheduling never races with state
//! merges.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::invoker::{FailureKind, StepFailure, ToolInvoker};
use super::scheduler::Scheduler;
use super::session::{Session, SessionHandle, SessionStore, SessionSummary};
use super::step::{StepOutcome, StepRunner};
use crate::authorization::{AllowAll, AuthorizationGate};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::workflow::model::{FailurePolicy, StepGraph};

/// Identifier of a session.
pub type SessionId = String;

struct SessionControl {
    halt: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
}

struct EngineInner {
    config: EngineConfig,
    store: SessionStore,
    bus: Arc<EventBus>,
    invoker: Arc<dyn ToolInvoker>,
    gate: Arc<dyn AuthorizationGate>,
    controls: Mutex<HashMap<String, SessionControl>>,
}

/// Workflow execution engine.
///
/// Cheap to clone; clones share sessions, bus and collaborators. Each
/// engine owns its own session store, so several can coexist.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use toolrunner::execution::{CommandInvoker, Engine};
/// use toolrunner::workflow::{load_workflow, validate_workflow, InMemoryRegistry};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = InMemoryRegistry::load("tools.yaml")?;
///     let graph = validate_workflow(&load_workflow("pipeline.yaml")?, &registry)?;
///
///     let engine = Engine::builder(Arc::new(CommandInvoker::new()))
///         .max_concurrency(4)
///         .build();
///     let id = engine.start(graph, None);
///     let session = engine.wait(&id).await?;
///     println!("{:?}", session.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Configures an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    bus: Option<Arc<EventBus>>,
    invoker: Arc<dyn ToolInvoker>,
    gate: Arc<dyn AuthorizationGate>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Limits in-flight steps per session. Zero is treated as one.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = Some(limit);
        self
    }

    /// Timeout for steps that do not declare one.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn AuthorizationGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Publishes to an existing bus instead of a private one.
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                store: SessionStore::new(),
                bus: self.bus.unwrap_or_default(),
                invoker: self.invoker,
                gate: self.gate,
                controls: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Engine {
    /// Creates an engine with default settings that allows every call.
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self::builder(invoker).build()
    }

    pub fn builder(invoker: Arc<dyn ToolInvoker>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            bus: None,
            invoker,
            gate: Arc::new(AllowAll),
        }
    }

    /// The bus this engine publishes to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Starts a session with a generated ID and returns the ID.
    ///
    /// The session is `running` when this returns. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self, graph: impl Into<Arc<StepGraph>>, initial_state: Option<Map<String, Value>>) -> SessionId {
        let graph = graph.into();
        loop {
            let id = Uuid::new_v4().to_string();
            match self.start_with_id(&id, Arc::clone(&graph), initial_state.clone()) {
                Ok(id) => return id,
                Err(e) => warn!("{}; generating a new ID", e),
            }
        }
    }

    /// Starts a session under a caller-chosen ID.
    pub fn start_with_id(
        &self,
        session_id: &str,
        graph: impl Into<Arc<StepGraph>>,
        initial_state: Option<Map<String, Value>>,
    ) -> Result<SessionId, EngineError> {
        let graph = graph.into();
        let session = Session::new(session_id, Arc::clone(&graph), initial_state.unwrap_or_default());
        let entry = self.inner.store.insert(session)?;

        let (halt_tx, halt_rx) = watch::channel(false);
        let halt = Arc::new(halt_tx);
        let (done_tx, done_rx) = watch::channel(false);
        self.inner
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session_id.to_string(),
                SessionControl {
                    halt: Arc::clone(&halt),
                    done: done_rx,
                },
            );

        let handle = SessionHandle::new(entry, Arc::clone(&self.inner.bus));
        handle.begin();

        let driver = SessionDriver {
            inner: Arc::clone(&self.inner),
            handle,
            graph,
            halt,
            halt_rx,
        };
        tokio::spawn(async move {
            driver.run().await;
            done_tx.send_replace(true);
        });

        Ok(session_id.to_string())
    }

    /// Read-only snapshot of a session.
    pub fn status(&self, session_id: &str) -> Result<Session, EngineError> {
        self.inner.store.snapshot(session_id)
    }

    /// Cancels a session: no new steps are dispatched, in-flight attempts
    /// finish and are recorded. Cancelling a finished session is a no-op.
    pub fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        let entry = self
            .inner
            .store
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let handle = SessionHandle::new(entry, Arc::clone(&self.inner.bus));
        if !handle.cancel() {
            debug!("Session {} already {:?}; cancel ignored", session_id, handle.status());
            return Ok(());
        }

        let controls = self.inner.controls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(control) = controls.get(session_id) {
            control.halt.send_replace(true);
        }
        Ok(())
    }

    /// Waits until the session has drained and returns its final snapshot.
    pub async fn wait(&self, session_id: &str) -> Result<Session, EngineError> {
        let done = self
            .inner
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(|c| c.done.clone());

        if let Some(mut done) = done {
            if done.wait_for(|d| *d).await.is_err() {
                warn!("Driver for session {} exited without finishing", session_id);
            }
        }
        self.status(session_id)
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.inner.store.list()
    }

    /// Drops sessions that finished at least `older_than` ago.
    pub fn evict_finished(&self, older_than: Duration) -> Vec<SessionId> {
        self.inner.store.evict_finished(older_than)
    }
}

/// Owns the scheduling loop of one session.
struct SessionDriver {
    inner: Arc<EngineInner>,
    handle: SessionHandle,
    graph: Arc<StepGraph>,
    halt: Arc<watch::Sender<bool>>,
    halt_rx: watch::Receiver<bool>,
}

impl SessionDriver {
    async fn run(self) {
        let session_id = self.handle.id().to_string();
        let limit = self.inner.config.max_concurrency.unwrap_or(usize::MAX).max(1);
        let runner = StepRunner {
            handle: self.handle.clone(),
            invoker: Arc::clone(&self.inner.invoker),
            gate: Arc::clone(&self.inner.gate),
            default_timeout: self.inner.config.default_timeout,
            halt: self.halt_rx.clone(),
        };

        let mut scheduler = Scheduler::new(Arc::clone(&self.graph));
        let mut in_flight: JoinSet<(String, StepOutcome)> = JoinSet::new();

        loop {
            while in_flight.len() < limit && !self.handle.is_halted() {
                let Some(step_id) = scheduler.pop_ready() else {
                    break;
                };
                self.dispatch(&step_id, &runner, &mut scheduler, &mut in_flight);
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((step_id, outcome)) => self.settle(&step_id, outcome, &mut scheduler),
                Err(e) => error!("Session {}: step task failed to join: {}", session_id, e),
            }

            let (settled, total) = scheduler.progress();
            debug!("Session {}: {}/{} steps settled", session_id, settled, total);
        }

        let never_ran = scheduler.drain_undispatched();
        self.handle.mark_skipped(&never_ran);
        let session = self.handle.seal();

        self.inner
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        info!("Session {} drained with status {:?}", session_id, session.status);
    }

    fn dispatch(
        &self,
        step_id: &str,
        runner: &StepRunner,
        scheduler: &mut Scheduler,
        in_flight: &mut JoinSet<(String, StepOutcome)>,
    ) {
        let (Some(step), Some(capability)) = (self.graph.get(step_id), self.graph.capability(step_id)) else {
            return;
        };

        let params = match self.handle.resolve_params(step) {
            Ok(params) => params,
            Err(e) => {
                let failure = StepFailure::new(FailureKind::InvalidParams, e.to_string());
                self.fail(step_id, &failure, scheduler);
                return;
            }
        };

        debug!("Dispatching step '{}' ({})", step_id, capability.id);
        let step = Arc::new(step.clone());
        let runner = runner.clone();
        let id = step_id.to_string();
        in_flight.spawn(async move {
            let outcome = AssertUnwindSafe(runner.run(step, capability, params))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| StepOutcome::Failed(StepFailure::tool("tool invocation panicked")));
            (id, outcome)
        });
    }

    fn settle(&self, step_id: &str, outcome: StepOutcome, scheduler: &mut Scheduler) {
        match outcome {
            StepOutcome::Succeeded { output, attempt } => {
                self.handle.record_success(step_id, output, attempt);
                scheduler.complete(step_id);
            }
            StepOutcome::Failed(failure) => self.fail(step_id, &failure, scheduler),
            StepOutcome::Abandoned => {
                scheduler.abandon(step_id);
                self.handle.mark_skipped([&step_id.to_string()]);
            }
        }
    }

    fn fail(&self, step_id: &str, failure: &StepFailure, scheduler: &mut Scheduler) {
        self.handle.record_failure(step_id, failure);
        let lost = scheduler.block(step_id);
        self.handle.mark_skipped(&lost);

        if self.graph.failure_policy() == FailurePolicy::Abort {
            self.handle.abort();
            self.halt.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::session::{SessionStatus, StepStatus};
    use crate::workflow::model::Step;
    use crate::workflow::registry::CapabilityRef;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolInvoker for Echo {
        async fn invoke(
            &self,
            capability: &CapabilityRef,
            params: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<Value, StepFailure> {
            if capability.id == "t.fail" {
                return Err(StepFailure::tool("bad"));
            }
            Ok(Value::Object(params.clone()))
        }
    }

    fn graph(steps: Vec<Step>, policy: FailurePolicy) -> StepGraph {
        let order = steps.iter().map(|s| s.id.clone()).collect();
        StepGraph::from_validated(steps, order, policy, vec!["seed".into()])
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let engine = Engine::new(Arc::new(Echo));
        assert_eq!(
            engine.status("nope").unwrap_err(),
            EngineError::SessionNotFound("nope".into())
        );
        assert!(engine.cancel("nope").is_err());
        assert!(engine.wait("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_graph_completes() {
        let engine = Engine::new(Arc::new(Echo));
        let id = engine.start(graph(Vec::new(), FailurePolicy::Abort), None);

        let session = engine.wait(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_outputs_flow_through_references() {
        let engine = Engine::new(Arc::new(Echo));
        let steps = vec![
            Step::new("a", "t", "ok").with_param("v", json!("$seed")),
            Step::new("b", "t", "ok")
                .with_param("from_a", json!("$a.v"))
                .depends_on("a"),
        ];
        let mut state = Map::new();
        state.insert("seed".into(), json!(42));

        let id = engine.start(graph(steps, FailurePolicy::Abort), Some(state));
        let session = engine.wait(&id).await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.state["b"], json!({"from_a": 42}));
    }

    #[tokio::test]
    async fn test_missing_input_is_invalid_params() {
        let engine = Engine::new(Arc::new(Echo));
        let steps = vec![Step::new("a", "t", "ok").with_param("v", json!("$seed"))];

        let id = engine.start(graph(steps, FailurePolicy::Abort), None);
        let session = engine.wait(&id).await.unwrap();

        assert_eq!(session.status, SessionStatus::Failed);
        let error = session.error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::InvalidParams);
        assert_eq!(session.attempts("a"), 0);
    }

    #[tokio::test]
    async fn test_start_with_existing_id() {
        let engine = Engine::new(Arc::new(Echo));
        engine.start_with_id("fixed", graph(Vec::new(), FailurePolicy::Abort), None).unwrap();

        let err = engine
            .start_with_id("fixed", graph(Vec::new(), FailurePolicy::Abort), None)
            .unwrap_err();
        assert_eq!(err, EngineError::SessionExists("fixed".into()));
    }

    #[tokio::test]
    async fn test_continue_policy_runs_independent_branch() {
        let engine = Engine::new(Arc::new(Echo));
        let steps = vec![
            Step::new("bad", "t", "fail").with_retry(crate::workflow::RetryPolicy::no_retry()),
            Step::new("after_bad", "t", "ok").depends_on("bad"),
            Step::new("good", "t", "ok"),
        ];

        let id = engine.start(graph(steps, FailurePolicy::Continue), None);
        let session = engine.wait(&id).await.unwrap();

        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.step_status("good"), Some(StepStatus::Succeeded));
        assert_eq!(session.step_status("after_bad"), Some(StepStatus::Skipped));
    }

    #[tokio::test]
    async fn test_cancel_finished_session_is_noop() {
        let engine = Engine::new(Arc::new(Echo));
        let id = engine.start(graph(Vec::new(), FailurePolicy::Abort), None);
        engine.wait(&id).await.unwrap();

        assert!(engine.cancel(&id).is_ok());
        assert_eq!(engine.status(&id).unwrap().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_and_evict() {
        let engine = Engine::new(Arc::new(Echo));
        let id = engine.start(graph(Vec::new(), FailurePolicy::Abort), None);
        engine.wait(&id).await.unwrap();

        assert_eq!(engine.list_sessions().len(), 1);
        assert_eq!(engine.evict_finished(Duration::ZERO), vec![id.clone()]);
        assert!(engine.status(&id).is_err());
    }
}
