//! Workflow Parser
//!
//! Handles loading and saving workflow definitions. Files are YAML; since
//! YAML is a superset of JSON, planner output in JSON loads the same way.
//!
//! Loading only checks the document shape. Use
//! [`validate_workflow`](super::validate_workflow) to obtain an executable
//! graph.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use crate::error::LoadError;

/// Loads a workflow from a YAML or JSON file.
///
/// # Example
///
/// ```rust,no_run
/// use toolrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("pipeline.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, LoadError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
    debug!("Workflow document loaded ({} bytes)", content.len());

    let workflow: Workflow = serde_yaml::from_str(&content).map_err(|e| LoadError::parse(path, e))?;
    info!(
        "Parsed {} steps ({} declared inputs)",
        workflow.steps.len(),
        workflow.inputs.len()
    );
    Ok(workflow)
}

/// Parses a workflow document held in memory.
pub fn parse_workflow(document: &str) -> Result<Workflow, LoadError> {
    let workflow: Workflow = serde_yaml::from_str(document)?;
    debug!("Parsed in-memory workflow with {} steps", workflow.steps.len());
    Ok(workflow)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<(), LoadError> {
    let path = path.as_ref();
    let content = serde_yaml::to_string(workflow)?;
    fs::write(path, content).map_err(|e| LoadError::io(path, e))?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
