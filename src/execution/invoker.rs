//! Tool Invocation
//!
//! The engine performs tool calls through a [`ToolInvoker`]. The bundled
//! [`CommandInvoker`] runs each action as a subprocess:
//!
//! - The resolved params are written to stdin as one JSON object
//! - Stdout is the output: parsed as JSON, or kept as a string
//! - A non-zero exit is a [`FailureKind::ToolFailure`] carrying stderr
//!
//! The child is killed if the call is dropped, which is what happens when
//! the engine's timeout elapses.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::workflow::registry::CapabilityRef;

/// Classification of a failed attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The authorization gate denied the call
    PermissionDenied,
    /// The tool reported an error
    ToolFailure,
    /// The attempt exceeded its timeout
    Timeout,
    /// Params could not be resolved against session state
    InvalidParams,
}

impl FailureKind {
    /// Returns true if an attempt failing this way may be retried.
    pub fn retryable(&self) -> bool {
        matches!(self, FailureKind::ToolFailure | FailureKind::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::PermissionDenied => "PermissionDenied",
            FailureKind::ToolFailure => "ToolFailure",
            FailureKind::Timeout => "Timeout",
            FailureKind::InvalidParams => "InvalidParams",
        };
        f.write_str(name)
    }
}

/// A failed step attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn tool(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ToolFailure, detail)
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Performs one tool call.
///
/// `timeout` is informational; the engine enforces it by dropping the call.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, StepFailure>;
}

/// Runs tool actions as subprocesses.
#[derive(Debug, Clone, Default)]
pub struct CommandInvoker;

impl CommandInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolInvoker for CommandInvoker {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, StepFailure> {
        let (program, args) = capability.command.split_first().ok_or_else(|| {
            StepFailure::tool(format!("no command configured for '{}'", capability.id))
        })?;

        debug!(
            "Running {} via {} {:?} (timeout {:?})",
            capability.id, program, args, timeout
        );

        let mut child = Command::new(program)
            .args(args)
            .env("TOOLRUNNER_ACTION", &capability.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepFailure::tool(format!("failed to start '{}': {}", program, e)))?;

        let input = serde_json::to_vec(params)
            .map_err(|e| StepFailure::new(FailureKind::InvalidParams, e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A tool that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(&input).await {
                debug!("{}: stdin closed early: {}", capability.id, e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StepFailure::tool(format!("failed to wait for '{}': {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "{} failed with exit code: {:?}",
                capability.id,
                output.status.code()
            );
            let detail = match stderr.trim() {
                "" => format!("exited with {:?}", output.status.code()),
                text => text.to_string(),
            };
            return Err(StepFailure::tool(detail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}
