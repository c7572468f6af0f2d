//! ToolRunner - Tool Workflow Execution Engine
//!
//! Runs dependency-ordered workflows of tool calls. Each step names a tool
//! action; steps may consume earlier outputs through `$step.path`
//! references. Every attempt is authorized, time-boxed and retried with
//! exponential backoff, and progress is published as events.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: workflow definitions, validation, planning and the orchestrator
//! - [`execution`]: session engine with concurrent dependency scheduling
//! - [`authorization`]: pre-invocation permission, rule and rate-limit checks
//! - [`events`]: event bus with filtered subscriptions and bounded history
//! - [`monitoring`]: execution timeline built from events
//! - [`config`]: YAML configuration for engine, bus and policy
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolrunner::execution::{CommandInvoker, Engine};
//! use toolrunner::workflow::{InMemoryRegistry, WorkflowOrchestrator};
//! use toolrunner::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load the tool manifest and a workflow
//!     let registry = InMemoryRegistry::load("tools.yaml")?;
//!     let workflow = load_workflow("pipeline.yaml")?;
//!
//!     // Validate and run
//!     let engine = Engine::new(Arc::new(CommandInvoker::new()));
//!     let orchestrator = WorkflowOrchestrator::new(Arc::new(registry), engine);
//!     let id = orchestrator.submit(&workflow, None)?;
//!
//!     let session = orchestrator.engine().wait(&id).await?;
//!     println!("{:?}", session.status);
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use error::{EngineError, LoadError, OrchestratorError};
pub use events::{Event, EventBus, EventKind};
pub use execution::engine::{Engine, SessionId};
pub use workflow::model::{Step, Workflow};
pub use workflow::orchestrator::WorkflowOrchestrator;
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ToolRunner";
