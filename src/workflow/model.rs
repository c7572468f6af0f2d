//! Workflow Data Model
//!
//! Core data structures representing tool steps and their relationships.
//!
//! # Example YAML Format
//!
//! ```yaml
//! failure_policy: abort
//! inputs: [league]
//! steps:
//!   - id: markets
//!     tool: betfair
//!     action: list_markets
//!     params:
//!       competition: $league
//!     timeout_ms: 10000
//!
//!   - id: log_odds
//!     tool: sheets
//!     action: append_row
//!     params:
//!       row: $markets.0.odds
//!     depends_on:
//!       - markets
//!     retry:
//!       max_attempts: 5
//!       base_delay_ms: 500
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::registry::CapabilityRef;

/// Retry behaviour for a single step.
///
/// The wait after failed attempt `n` (1-based) is
/// `min(base_delay * multiplier^(n-1), max_delay)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Wait before the second attempt
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,

    /// Growth factor applied per failed attempt
    pub multiplier: f64,

    /// Upper bound on any single wait
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Builds a policy from its four parameters.
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Backoff to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Returns true if another attempt is allowed after `attempt` attempts.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// What the engine does with the rest of the graph once a step has
/// exhausted its retries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop dispatching; the session fails immediately
    #[default]
    Abort,
    /// Skip only the failed step's dependents; independent branches continue
    Continue,
}

/// Represents a single tool invocation in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Registered tool name
    pub tool: String,

    /// Action exposed by the tool
    pub action: String,

    /// Parameters, possibly containing `$step` references
    #[serde(default)]
    pub params: Map<String, Value>,

    /// IDs of steps that must succeed before this step can run
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-attempt timeout; the engine default applies when absent
    #[serde(
        default,
        rename = "timeout_ms",
        with = "opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Step {
    /// Creates a new Step with no params or dependencies.
    ///
    /// # Example
    ///
    /// ```
    /// use toolrunner::workflow::Step;
    /// use serde_json::json;
    ///
    /// let step = Step::new("odds", "betfair", "get_odds")
    ///     .with_param("market", json!("$markets.0.id"))
    ///     .depends_on("markets");
    /// ```
    pub fn new(id: impl Into<String>, tool: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            tool: tool.into().trim().to_string(),
            action: action.into().trim().to_string(),
            params: Map::new(),
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Sets a single parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Replaces all parameters.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// The `tool.action` name used in logs and events.
    pub fn qualified_action(&self) -> String {
        format!("{}.{}", self.tool, self.action)
    }
}

/// An unvalidated workflow, as produced by a planner or read from a file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    /// Steps in declaration order
    pub steps: Vec<Step>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Names of external values supplied as initial session state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A validated, acyclic workflow ready for execution.
///
/// Only the validator constructs this type, so holding one means every
/// dependency resolves, IDs are unique and the dependency relation has no
/// cycles. The graph is immutable from then on.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StepGraph {
    steps: Vec<Step>,
    order: Vec<String>,
    failure_policy: FailurePolicy,
    inputs: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    #[serde(skip)]
    dependents: HashMap<String, Vec<String>>,
    /// Invoker handles resolved from the registry
    #[serde(skip)]
    capabilities: HashMap<String, CapabilityRef>,
}

impl StepGraph {
    /// Assembles a graph from checked parts. `order` must be a topological
    /// order of `steps`, and every step's `depends_on` must be deduplicated.
    pub(crate) fn from_validated(
        steps: Vec<Step>,
        order: Vec<String>,
        failure_policy: FailurePolicy,
        inputs: Vec<String>,
    ) -> Self {
        let index: HashMap<String, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        // Dependents are listed in topological order so that steps becoming
        // eligible together are queued deterministically.
        let mut dependents: HashMap<String, Vec<String>> =
            steps.iter().map(|s| (s.id.clone(), Vec::new())).collect();
        for id in &order {
            if let Some(step) = index.get(id).map(|&i| &steps[i]) {
                for dep in &step.depends_on {
                    if let Some(list) = dependents.get_mut(dep) {
                        list.push(id.clone());
                    }
                }
            }
        }

        Self {
            steps,
            order,
            failure_policy,
            inputs,
            index,
            dependents,
            capabilities: HashMap::new(),
        }
    }

    pub(crate) fn with_capabilities(mut self, capabilities: HashMap<String, CapabilityRef>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The capability a step invokes. Falls back to a bare `tool.action`
    /// handle when the graph was not built against a registry.
    pub fn capability(&self, id: &str) -> Option<CapabilityRef> {
        let step = self.get(id)?;
        Some(
            self.capabilities
                .get(id)
                .cloned()
                .unwrap_or_else(|| CapabilityRef::new(step.qualified_action())),
        )
    }

    /// Steps in their original declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// A topological ordering of step IDs. This is a scheduling hint only.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Declared external inputs.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Direct dependencies of a step.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.get(id).map(|s| s.depends_on.as_slice()).unwrap_or(&[])
    }

    /// Steps that directly depend on `id`, in topological order.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive dependencies of a step.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependencies(id).iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if seen.insert(current.to_string()) {
                stack.extend(self.dependencies(current).iter().map(String::as_str));
            }
        }
        seen
    }

    /// All transitive dependents of a step.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependents(id).iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if seen.insert(current.to_string()) {
                stack.extend(self.dependents(current).iter().map(String::as_str));
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis().min(u64::MAX as u128) as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
