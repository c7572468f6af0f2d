//! Monitoring Module
//!
//! Execution reporting built on published events.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: step start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{ExecutionTimeline, Phase, TimelineEntry};
