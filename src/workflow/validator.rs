//! Workflow Validation
//!
//! Turns a [`Workflow`] into an executable [`StepGraph`]:
//! - Step field validation
//! - Reference integrity checking (dependencies and `$` params)
//! - Dependency graph validation (no cycles)
//! - Topological sorting
//! - Tool registry and parameter schema checks
//!
//! Validation is all-or-nothing: on error nothing is executed.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use thiserror::Error;

use super::model::{Step, StepGraph, Workflow};
use super::reference::collect_references;
use super::registry::{CapabilityRef, ToolRegistry};

/// Validation error types naming the offending step(s) and the rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step '{0}' has no tool specified")]
    EmptyTool(String),

    #[error("Step '{0}' has no action specified")]
    EmptyAction(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Workflow contains a dependency cycle: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    #[error("Step '{step}' uses unknown tool action '{tool}.{action}'")]
    UnknownTool {
        step: String,
        tool: String,
        action: String,
    },

    #[error("Step '{step}' is missing required parameter '{parameter}' for '{tool}.{action}'")]
    MissingParameter {
        step: String,
        tool: String,
        action: String,
        parameter: String,
    },

    #[error("Step '{step}' references '{reference}': {reason}")]
    InvalidReference {
        step: String,
        reference: String,
        reason: String,
    },

    #[error("Step '{step}' has an invalid retry policy: {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("Input '{0}' collides with a step ID")]
    InputCollision(String),
}

impl ValidationError {
    /// Step IDs this error is about.
    pub fn steps(&self) -> Vec<&str> {
        match self {
            Self::EmptyStepId => Vec::new(),
            Self::DuplicateStepId(id)
            | Self::EmptyTool(id)
            | Self::EmptyAction(id)
            | Self::InputCollision(id) => vec![id.as_str()],
            Self::UnknownDependency { step, .. }
            | Self::UnknownTool { step, .. }
            | Self::MissingParameter { step, .. }
            | Self::InvalidReference { step, .. }
            | Self::InvalidRetryPolicy { step, .. } => vec![step.as_str()],
            Self::Cycle { steps } => steps.iter().map(String::as_str).collect(),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Result<(), ValidationError> {
    if step.id.trim().is_empty() {
        return Err(ValidationError::EmptyStepId);
    }

    if step.tool.trim().is_empty() {
        return Err(ValidationError::EmptyTool(step.id.clone()));
    }

    if step.action.trim().is_empty() {
        return Err(ValidationError::EmptyAction(step.id.clone()));
    }

    let retry = &step.retry;
    if retry.max_attempts == 0 {
        return Err(ValidationError::InvalidRetryPolicy {
            step: step.id.clone(),
            reason: "max_attempts must be at least 1".into(),
        });
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(ValidationError::InvalidRetryPolicy {
            step: step.id.clone(),
            reason: format!("multiplier must be >= 1, got {}", retry.multiplier),
        });
    }

    if step.depends_on.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.id);
    }

    Ok(())
}

/// Validates a workflow and produces its execution graph.
///
/// Performs the following checks, in order:
/// 1. All steps have valid fields and unique IDs
/// 2. All dependencies point to existing steps
/// 3. No cyclic dependencies (the first cycle found is reported)
/// 4. Every tool action exists and required params are present
/// 5. Every `$` reference targets a transitive dependency or a declared input
pub fn validate_workflow(
    workflow: &Workflow,
    registry: &dyn ToolRegistry,
) -> Result<StepGraph, ValidationError> {
    info!("Validating workflow with {} steps", workflow.steps.len());

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        validate_step(step)?;
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for input in &workflow.inputs {
        if seen_ids.contains(input.as_str()) {
            return Err(ValidationError::InputCollision(input.clone()));
        }
    }

    // Dependencies form a set; keep the first occurrence of each.
    let steps: Vec<Step> = workflow
        .steps
        .iter()
        .map(|step| {
            let mut unique = HashSet::new();
            let mut step = step.clone();
            step.depends_on.retain(|d| unique.insert(d.clone()));
            step
        })
        .collect();

    for step in &steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(&steps) {
        return Err(ValidationError::Cycle { steps: cycle });
    }
    let order = topological_sort(&steps)?;

    let mut capabilities = HashMap::with_capacity(steps.len());
    for step in &steps {
        let capability = check_schema(step, registry)?;
        capabilities.insert(step.id.clone(), capability);
    }

    let graph = StepGraph::from_validated(
        steps,
        order,
        workflow.failure_policy,
        workflow.inputs.clone(),
    )
    .with_capabilities(capabilities);

    for step in graph.steps() {
        check_references(step, &graph)?;
    }

    info!(
        "Workflow validated: {} steps, order {:?}",
        graph.len(),
        graph.topological_order()
    );
    Ok(graph)
}

fn check_schema(step: &Step, registry: &dyn ToolRegistry) -> Result<CapabilityRef, ValidationError> {
    let spec = registry
        .resolve(&step.tool, &step.action)
        .ok_or_else(|| ValidationError::UnknownTool {
            step: step.id.clone(),
            tool: step.tool.clone(),
            action: step.action.clone(),
        })?;

    for required in &spec.params.required {
        if !step.params.contains_key(required) {
            return Err(ValidationError::MissingParameter {
                step: step.id.clone(),
                tool: step.tool.clone(),
                action: step.action.clone(),
                parameter: required.clone(),
            });
        }
    }

    for name in step.params.keys() {
        if !spec.params.declares(name) {
            warn!(
                "Step '{}': parameter '{}' is not declared by {}",
                step.id, name, spec.capability.id
            );
        }
    }

    Ok(spec.capability)
}

fn check_references(step: &Step, graph: &StepGraph) -> Result<(), ValidationError> {
    let references = collect_references(&step.params);
    if references.is_empty() {
        return Ok(());
    }

    let ancestors = graph.ancestors(&step.id);
    for reference in references {
        let root = reference.root.as_str();
        if ancestors.contains(root) || graph.inputs().iter().any(|i| i == root) {
            continue;
        }

        let reason = if root == step.id {
            "a step cannot reference its own output".to_string()
        } else if graph.contains(root) {
            format!("'{}' is not among this step's dependencies", root)
        } else {
            "no step or declared input with that name".to_string()
        };
        return Err(ValidationError::InvalidReference {
            step: step.id.clone(),
            reference: reference.to_string(),
            reason,
        });
    }

    Ok(())
}

/// Finds the first dependency cycle by depth-first search, visiting steps
/// in declaration order. Returns the participating step IDs in dependency
/// order, starting from the step where the cycle was entered.
fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; steps.len()];

    for start in 0..steps.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }

        // Explicit stack of (node, next dependency position).
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;

        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            let deps = &steps[node].depends_on;
            if pos >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }

            top.1 += 1;
            let Some(&next) = index.get(deps[pos].as_str()) else {
                continue;
            };

            match marks[next] {
                Mark::Unvisited => {
                    marks[next] = Mark::InProgress;
                    stack.push((next, 0));
                }
                Mark::InProgress => {
                    let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..]
                        .iter()
                        .map(|&(n, _)| steps[n].id.clone())
                        .collect();
                    // Walked along depends_on edges; report in execution direction.
                    cycle.reverse();
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }
    }

    None
}

/// Performs topological sort on workflow steps using Kahn's algorithm.
///
/// Roots are taken in declaration order, so the result is deterministic.
fn topological_sort(steps: &[Step]) -> Result<Vec<String>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        in_degree.insert(step.id.as_str(), step.depends_on.len());
        for dep in &step.depends_on {
            successors.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.id.as_str())
        .collect();

    let mut sorted_order: Vec<String> = Vec::with_capacity(steps.len());
    while let Some(current) = queue.pop_front() {
        sorted_order.push(current.to_string());

        for &successor in successors.get(current).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }
    }

    if sorted_order.len() != steps.len() {
        let stuck: Vec<String> = steps
            .iter()
            .filter(|s| !sorted_order.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();
        return Err(ValidationError::Cycle { steps: stuck });
    }

    debug!("Topological order: {:?}", sorted_order);
    Ok(sorted_order)
}
