//! Sessions
//!
//! A [`Session`] is one execution of a [`StepGraph`]. Sessions live in the
//! [`SessionStore`]; the engine mutates each one only through a
//! [`SessionHandle`], which serializes every change behind the session's
//! lock and publishes the matching event before releasing it. Event order
//! therefore always matches mutation order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::invoker::{FailureKind, StepFailure};
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventKind};
use crate::workflow::model::{Step, StepGraph};
use crate::workflow::reference::{resolve_params, ResolveError};

/// Lifecycle of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Status of one step within a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

/// The failure that ended a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub step_id: String,
    pub kind: FailureKind,
    pub detail: String,
}

/// Snapshot of a session.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,

    #[serde(skip)]
    pub graph: Arc<StepGraph>,

    /// Step outputs keyed by step ID, plus declared inputs
    pub state: Map<String, Value>,

    pub status: SessionStatus,
    pub step_statuses: BTreeMap<String, StepStatus>,
    pub attempts: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set once in-flight attempts have drained
    pub finished_at: Option<DateTime<Utc>>,

    pub error: Option<SessionError>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, graph: Arc<StepGraph>, state: Map<String, Value>) -> Self {
        let now = Utc::now();
        let step_statuses = graph
            .steps()
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let attempts = graph.steps().iter().map(|s| (s.id.clone(), 0)).collect();

        Self {
            session_id: session_id.into(),
            graph,
            state,
            status: SessionStatus::Pending,
            step_statuses,
            attempts,
            created_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_statuses.get(step_id).copied()
    }

    pub fn attempts(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    /// Returns true once in-flight attempts have drained and the final
    /// event has been published.
    pub fn is_sealed(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            created_at: self.created_at,
            steps_total: self.step_statuses.len(),
            steps_succeeded: self
                .step_statuses
                .values()
                .filter(|s| **s == StepStatus::Succeeded)
                .count(),
        }
    }

    fn set_step(&mut self, step_id: &str, status: StepStatus) {
        self.step_statuses.insert(step_id.to_string(), status);
        self.updated_at = Utc::now();
    }
}

/// One line of [`SessionStore::list`].
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub steps_total: usize,
    pub steps_succeeded: usize,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory sessions, guarded per session.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. Fails if the ID is already in use.
    pub fn insert(&self, session: Session) -> Result<Arc<Mutex<Session>>, EngineError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session.session_id) {
            return Err(EngineError::SessionExists(session.session_id));
        }

        let id = session.session_id.clone();
        let entry = Arc::new(Mutex::new(session));
        sessions.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Read-only copy of a session.
    pub fn snapshot(&self, session_id: &str) -> Result<Session, EngineError> {
        self.get(session_id)
            .map(|s| lock(&s).clone())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Summaries of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let entries: Vec<Arc<Mutex<Session>>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut summaries: Vec<SessionSummary> = entries.iter().map(|s| lock(s).summary()).collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    /// Removes sessions sealed at least `older_than` ago. Returns their IDs.
    pub fn evict_finished(&self, older_than: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| lock(s).finished_at.is_some_and(|t| t <= cutoff))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!("Evicted {} finished sessions", expired.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The engine's write access to one session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    session: Arc<Mutex<Session>>,
    bus: Arc<EventBus>,
}

impl SessionHandle {
    pub fn new(session: Arc<Mutex<Session>>, bus: Arc<EventBus>) -> Self {
        let session_id = lock(&session).session_id.clone();
        Self {
            session_id,
            session,
            bus,
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    fn emit(&self, kind: EventKind, step_id: Option<&str>, payload: Value) {
        let event = match step_id {
            Some(step) => Event::for_step(kind, &self.session_id, step, payload),
            None => Event::new(kind, &self.session_id, payload),
        };
        self.bus.publish(event);
    }

    pub fn snapshot(&self) -> Session {
        lock(&self.session).clone()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.session).status
    }

    /// Returns true once the session stopped accepting new dispatches.
    pub fn is_halted(&self) -> bool {
        lock(&self.session).status != SessionStatus::Running
    }

    /// `pending -> running`.
    pub fn begin(&self) {
        let mut session = lock(&self.session);
        if session.status != SessionStatus::Pending {
            return;
        }
        session.status = SessionStatus::Running;
        session.updated_at = Utc::now();
        info!("Session {} started ({} steps)", self.session_id, session.graph.len());

        let order = session.graph.topological_order().to_vec();
        self.emit(
            EventKind::WorkflowStarted,
            None,
            json!({ "steps": order.len(), "order": order }),
        );
    }

    /// Substitutes references in the step's params from current state.
    pub fn resolve_params(&self, step: &Step) -> Result<Map<String, Value>, ResolveError> {
        let session = lock(&self.session);
        resolve_params(&step.params, &session.state)
    }

    /// Counts a new attempt and returns its 1-based number.
    pub fn begin_attempt(&self, step_id: &str) -> u32 {
        let mut session = lock(&self.session);
        let count = session.attempts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        let attempt = *count;
        session.updated_at = Utc::now();
        attempt
    }

    pub fn mark_running(&self, step: &Step, attempt: u32) {
        let mut session = lock(&self.session);
        session.set_step(&step.id, StepStatus::Running);
        debug!("Step '{}' running (attempt {})", step.id, attempt);
        self.emit(
            EventKind::StepStarted,
            Some(&step.id),
            json!({ "tool": step.tool, "action": step.action, "attempt": attempt }),
        );
    }

    pub fn mark_retrying(&self, step_id: &str, attempt: u32, delay: Duration, failure: &StepFailure) {
        let mut session = lock(&self.session);
        session.set_step(step_id, StepStatus::Retrying);
        warn!(
            "Step '{}' attempt {} failed ({}); retrying in {:?}",
            step_id, attempt, failure, delay
        );
        self.emit(
            EventKind::StepRetrying,
            Some(step_id),
            json!({
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64,
                "error": failure,
            }),
        );
    }

    /// Records an output and merges it into state under the step ID.
    pub fn record_success(&self, step_id: &str, output: Value, attempt: u32) {
        let mut session = lock(&self.session);
        session.set_step(step_id, StepStatus::Succeeded);
        session.state.insert(step_id.to_string(), output.clone());
        info!("Step '{}' completed (attempt {})", step_id, attempt);
        self.emit(
            EventKind::StepCompleted,
            Some(step_id),
            json!({ "attempt": attempt, "output": output }),
        );
    }

    /// Records a final step failure. The first one becomes the session error.
    pub fn record_failure(&self, step_id: &str, failure: &StepFailure) {
        let mut session = lock(&self.session);
        session.set_step(step_id, StepStatus::Failed);
        if session.error.is_none() && session.status != SessionStatus::Cancelled {
            session.error = Some(SessionError {
                step_id: step_id.to_string(),
                kind: failure.kind,
                detail: failure.detail.clone(),
            });
        }
        let attempts = session.attempts(step_id);
        warn!("Step '{}' failed after {} attempt(s): {}", step_id, attempts, failure);
        self.emit(
            EventKind::StepFailed,
            Some(step_id),
            json!({ "attempts": attempts, "error": failure }),
        );
    }

    /// Marks steps that will never run. Settled steps are left alone.
    pub fn mark_skipped<'a>(&self, step_ids: impl IntoIterator<Item = &'a String>) {
        let mut session = lock(&self.session);
        for id in step_ids {
            if matches!(
                session.step_status(id),
                Some(StepStatus::Pending | StepStatus::Retrying)
            ) {
                debug!("Step '{}' skipped", id);
                session.set_step(id, StepStatus::Skipped);
            }
        }
    }

    /// `running -> failed`. Stops new dispatch.
    pub fn abort(&self) {
        let mut session = lock(&self.session);
        if session.status == SessionStatus::Running {
            session.status = SessionStatus::Failed;
            session.updated_at = Utc::now();
            info!("Session {} aborting", self.session_id);
        }
    }

    /// Moves a live session to `cancelled`. Returns false if it had already
    /// stopped.
    pub fn cancel(&self) -> bool {
        let mut session = lock(&self.session);
        if session.status.is_terminal() {
            return false;
        }
        session.status = SessionStatus::Cancelled;
        session.updated_at = Utc::now();
        info!("Session {} cancelled", self.session_id);
        true
    }

    /// Settles the final status, stamps `finished_at` and publishes the
    /// terminal event. Idempotent.
    pub fn seal(&self) -> Session {
        let mut session = lock(&self.session);
        if session.is_sealed() {
            return session.clone();
        }

        if !session.status.is_terminal() {
            let failed = session
                .step_statuses
                .values()
                .any(|s| *s != StepStatus::Succeeded && *s != StepStatus::Skipped);
            session.status = if failed || session.error.is_some() {
                SessionStatus::Failed
            } else {
                SessionStatus::Completed
            };
        }

        let now = Utc::now();
        session.finished_at = Some(now);
        session.updated_at = now;

        let (kind, payload) = match session.status {
            SessionStatus::Completed => (EventKind::WorkflowCompleted, json!({ "state": session.state })),
            SessionStatus::Cancelled => (
                EventKind::WorkflowCancelled,
                json!({ "step_statuses": session.step_statuses }),
            ),
            _ => (EventKind::WorkflowFailed, json!({ "error": session.error })),
        };
        info!("Session {} finished: {:?}", self.session_id, session.status);
        self.emit(kind, None, payload);

        session.clone()
    }
}
