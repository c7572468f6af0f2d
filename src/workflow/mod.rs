//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! planning and validating tool workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow, StepGraph)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`reference`]: `$step.path` parameter references
//! - [`registry`]: Tool registry lookup and manifests
//! - [`validator`]: Validation rules and dependency checking
//! - [`plan`]: Planner seam and plan extraction
//! - [`orchestrator`]: Validate, announce and submit workflows

pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod plan;
pub mod reference;
pub mod registry;
pub mod validator;

pub use model::{FailurePolicy, RetryPolicy, Step, StepGraph, Workflow};
pub use orchestrator::WorkflowOrchestrator;
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use plan::{parse_plan, PlanError, PlanSource};
pub use registry::{CapabilityRef, InMemoryRegistry, ParamSchema, ToolRegistry, ToolSpec};
pub use validator::{validate_workflow, ValidationError};
