//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use toolrunner::events::{Event, EventKind};
use toolrunner::execution::{StepFailure, ToolInvoker};
use toolrunner::workflow::{CapabilityRef, InMemoryRegistry, ParamSchema};

/// How a scripted capability responds.
#[derive(Clone)]
pub enum Behavior {
    Succeed(Value),
    Fail(String),
    /// Fails the first `n` calls, then succeeds
    FailTimes(usize, Value),
    /// Succeeds after the given delay
    Delay(Duration, Value),
    /// Succeeds once the notify is signalled
    Block(Arc<Notify>, Value),
    /// Never returns
    Hang,
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub capability: String,
    pub params: Map<String, Value>,
    pub at: Instant,
}

/// Invoker driven by a per-capability script. Unscripted capabilities echo
/// their params.
#[derive(Default)]
pub struct ScriptedInvoker {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, capability: &str, behavior: Behavior) -> &Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(capability.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, capability: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.capability == capability)
            .collect()
    }

    /// Highest number of simultaneous invocations seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        params: &Map<String, Value>,
        _timeout: Duration,
    ) -> Result<Value, StepFailure> {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|c| c.capability == capability.id).count();
            calls.push(Call {
                capability: capability.id.clone(),
                params: params.clone(),
                at: Instant::now(),
            });
            previous
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let behavior = self.behaviors.lock().unwrap().get(&capability.id).cloned();
        match behavior {
            None => Ok(Value::Object(params.clone())),
            Some(Behavior::Succeed(value)) => Ok(value),
            Some(Behavior::Fail(detail)) => Err(StepFailure::tool(detail)),
            Some(Behavior::FailTimes(n, value)) => {
                if previous < n {
                    Err(StepFailure::tool(format!("transient failure {}", previous + 1)))
                } else {
                    Ok(value)
                }
            }
            Some(Behavior::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Behavior::Block(notify, value)) => {
                notify.notified().await;
                Ok(value)
            }
            Some(Behavior::Hang) => std::future::pending().await,
        }
    }
}

/// Registry with the given `tool.action` names and no required params.
pub fn registry(actions: &[&str]) -> InMemoryRegistry {
    let mut registry = InMemoryRegistry::new();
    for name in actions {
        let (tool, action) = name.split_once('.').unwrap();
        registry.register(tool, action, ParamSchema::default());
    }
    registry
}

/// `(kind, step_id)` pairs for compact order assertions.
pub fn trace(events: &[Event]) -> Vec<(EventKind, Option<String>)> {
    events
        .iter()
        .map(|e| (e.kind, e.step_id.clone()))
        .collect()
}

pub fn output(value: &str) -> Value {
    json!({ "result": value })
}
