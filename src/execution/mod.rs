//! Workflow Execution Module
//!
//! Runs validated step graphs as sessions.
//!
//! # Architecture
//!
//! - [`engine`]: session lifecycle and the per-session scheduling loop
//! - [`scheduler`]: dependency tracking and FIFO eligibility
//! - [`step`]: authorize, invoke and retry a single step
//! - [`session`]: session records, the store and serialized mutation
//! - [`invoker`]: the tool-call seam and a subprocess implementation

pub mod engine;
pub mod invoker;
pub mod scheduler;
pub mod session;
pub mod step;

pub use engine::{Engine, EngineBuilder, SessionId};
pub use invoker::{CommandInvoker, FailureKind, StepFailure, ToolInvoker};
pub use session::{Session, SessionError, SessionStatus, SessionSummary, StepStatus};
