//! Step Scheduler
//!
//! Tracks which steps of a [`StepGraph`] are eligible to run:
//! - Remaining unmet dependencies per step
//! - A FIFO queue of eligible steps, in order of first eligibility
//! - Dispatched and settled steps
//!
//! The scheduler is owned by a single session driver and is not shared.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::debug;

use crate::workflow::model::StepGraph;

/// Dependency bookkeeping for one session.
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<StepGraph>,
    /// Unmet dependency count per step
    waiting_on: HashMap<String, usize>,
    ready: VecDeque<String>,
    dispatched: HashSet<String>,
    settled: HashSet<String>,
    blocked: HashSet<String>,
}

impl Scheduler {
    /// Creates a scheduler with every root step eligible, in declaration order.
    pub fn new(graph: Arc<StepGraph>) -> Self {
        let waiting_on: HashMap<String, usize> = graph
            .steps()
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.len()))
            .collect();
        let ready = graph
            .steps()
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id.clone())
            .collect();

        Self {
            graph,
            waiting_on,
            ready,
            dispatched: HashSet::new(),
            settled: HashSet::new(),
            blocked: HashSet::new(),
        }
    }

    /// Takes the longest-waiting eligible step and marks it dispatched.
    pub fn pop_ready(&mut self) -> Option<String> {
        let id = self.ready.pop_front()?;
        self.dispatched.insert(id.clone());
        Some(id)
    }

    /// Records a success and queues the dependents it made eligible.
    pub fn complete(&mut self, step_id: &str) {
        self.settled.insert(step_id.to_string());

        let mut newly_ready = Vec::new();
        for dependent in self.graph.dependents(step_id) {
            if self.blocked.contains(dependent) {
                continue;
            }
            if let Some(remaining) = self.waiting_on.get_mut(dependent) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    newly_ready.push(dependent.clone());
                }
            }
        }

        if !newly_ready.is_empty() {
            debug!("'{}' unblocked {:?}", step_id, newly_ready);
        }
        self.ready.extend(newly_ready);
    }

    /// Records a failure. Returns every transitive dependent, which can
    /// now never become eligible.
    pub fn block(&mut self, step_id: &str) -> Vec<String> {
        self.settled.insert(step_id.to_string());

        let mut lost: Vec<String> = self
            .graph
            .descendants(step_id)
            .into_iter()
            .filter(|id| !self.dispatched.contains(id))
            .collect();
        lost.sort_by_key(|id| self.position(id));

        for id in &lost {
            self.blocked.insert(id.clone());
            self.settled.insert(id.clone());
        }
        self.ready.retain(|id| !lost.contains(id));
        lost
    }

    /// Records a dispatched step that ended without a result.
    pub fn abandon(&mut self, step_id: &str) {
        self.settled.insert(step_id.to_string());
    }

    /// Removes and returns every step that was never dispatched.
    pub fn drain_undispatched(&mut self) -> Vec<String> {
        self.ready.clear();
        let rest: Vec<String> = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| !self.dispatched.contains(*id) && !self.blocked.contains(*id))
            .cloned()
            .collect();
        for id in &rest {
            self.settled.insert(id.clone());
        }
        rest
    }

    /// Returns (settled, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.settled.len(), self.graph.len())
    }

    fn position(&self, id: &str) -> usize {
        self.graph
            .topological_order()
            .iter()
            .position(|s| s == id)
            .unwrap_or(usize::MAX)
    }
}
