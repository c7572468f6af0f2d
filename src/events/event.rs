//! Event Records
//!
//! Every observable state change in a session is published as an
//! [`Event`]. Payloads are JSON so that subscribers written against the
//! event names stay decoupled from Rust types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "workflow.planned")]
    WorkflowPlanned,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.retrying")]
    StepRetrying,
    /// Diagnostic emitted when a subscriber starts losing events
    #[serde(rename = "bus.overflow")]
    BusOverflow,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowPlanned => "workflow.planned",
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed => "workflow.failed",
            EventKind::WorkflowCancelled => "workflow.cancelled",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
            EventKind::StepRetrying => "step.retrying",
            EventKind::BusOverflow => "bus.overflow",
        }
    }

    /// Returns true for the events that end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted | EventKind::WorkflowFailed | EventKind::WorkflowCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event.
///
/// `sequence` and `timestamp` are assigned by the bus at publish time.
/// Sequences are unique and strictly increasing across the process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Absent only for bus diagnostics
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    pub payload: Value,

    pub timestamp: DateTime<Utc>,

    pub sequence: u64,
}

impl Event {
    /// Creates an unstamped session event.
    pub fn new(kind: EventKind, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            session_id: Some(session_id.into()),
            step_id: None,
            payload,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    /// Creates an unstamped event about a single step.
    pub fn for_step(
        kind: EventKind,
        session_id: impl Into<String>,
        step_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::new(kind, session_id, payload)
        }
    }

    pub(crate) fn diagnostic(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            session_id: None,
            step_id: None,
            payload,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }
}

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Selects which events a subscriber receives.
///
/// All configured criteria must match. An empty filter matches everything.
///
/// # Example
///
/// ```
/// use toolrunner::events::EventFilter;
///
/// let filter = EventFilter::new()
///     .pattern("step.*")
///     .session("f3b1c2");
/// ```
#[derive(Clone, Default)]
pub struct EventFilter {
    patterns: Vec<String>,
    session: Option<String>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a name pattern. `"*"` matches all names and `"step.*"` matches
    /// every name under `step.`. Multiple patterns are alternatives.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Matches a single kind exactly.
    pub fn kind(self, kind: EventKind) -> Self {
        self.pattern(kind.as_str())
    }

    /// Only events for this session.
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session = Some(session_id.into());
        self
    }

    /// Arbitrary extra condition.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.patterns.is_empty() {
            let name = event.kind.as_str();
            if !self.patterns.iter().any(|p| pattern_matches(p, name)) {
                return false;
            }
        }

        if let Some(session) = &self.session {
            if event.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }

        self.predicate.as_ref().map_or(true, |p| p(event))
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("patterns", &self.patterns)
            .field("session", &self.session)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_event(kind: EventKind, session: &str) -> Event {
        Event::for_step(kind, session, "s1", json!({}))
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::StepRetrying.to_string(), "step.retrying");
        assert_eq!(
            serde_json::to_value(EventKind::WorkflowPlanned).unwrap(),
            json!("workflow.planned")
        );
        assert!(EventKind::WorkflowCancelled.is_terminal());
        assert!(!EventKind::StepFailed.is_terminal());
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = step_event(EventKind::StepStarted, "abc");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], json!("step.started"));
        assert_eq!(value["session_id"], json!("abc"));
        assert_eq!(value["step_id"], json!("s1"));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = EventFilter::new();
        assert!(filter.matches(&step_event(EventKind::StepFailed, "x")));
        assert!(filter.matches(&Event::diagnostic(EventKind::BusOverflow, json!({}))));
    }

    #[test]
    fn test_wildcard_patterns() {
        let filter = EventFilter::new().pattern("workflow.*");
        assert!(filter.matches(&Event::new(EventKind::WorkflowStarted, "x", json!({}))));
        assert!(!filter.matches(&step_event(EventKind::StepStarted, "x")));

        let all = EventFilter::new().pattern("*");
        assert!(all.matches(&step_event(EventKind::StepStarted, "x")));
    }

    #[test]
    fn test_exact_kind_and_alternatives() {
        let filter = EventFilter::new()
            .kind(EventKind::StepFailed)
            .kind(EventKind::StepRetrying);

        assert!(filter.matches(&step_event(EventKind::StepFailed, "x")));
        assert!(filter.matches(&step_event(EventKind::StepRetrying, "x")));
        assert!(!filter.matches(&step_event(EventKind::StepCompleted, "x")));
    }

    #[test]
    fn test_session_and_predicate() {
        let filter = EventFilter::new()
            .session("a")
            .predicate(|e| e.step_id.as_deref() == Some("s1"));

        assert!(filter.matches(&step_event(EventKind::StepStarted, "a")));
        assert!(!filter.matches(&step_event(EventKind::StepStarted, "b")));
        assert!(!filter.matches(&Event::new(EventKind::WorkflowStarted, "a", json!({}))));
    }
}
