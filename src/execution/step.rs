//! Individual Step Execution
//!
//! Runs one dispatched step to a final outcome:
//! - Authorization before every attempt, including retries
//! - Tool invocation bounded by the step's timeout
//! - Exponential backoff between failed attempts
//!
//! Params are resolved by the caller once per dispatch and reused for every
//! attempt. Cancellation is cooperative: an attempt in flight always runs to
//! completion, but a pending retry is abandoned.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::invoker::{FailureKind, StepFailure, ToolInvoker};
use super::session::SessionHandle;
use crate::authorization::{AuthRequest, AuthorizationGate, Verdict};
use crate::workflow::model::Step;
use crate::workflow::registry::CapabilityRef;

/// Final result of a dispatched step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { output: Value, attempt: u32 },
    Failed(StepFailure),
    /// A retry was pending when the session stopped dispatching
    Abandoned,
}

/// Collaborators shared by every step of a session.
#[derive(Clone)]
pub struct StepRunner {
    pub handle: SessionHandle,
    pub invoker: Arc<dyn ToolInvoker>,
    pub gate: Arc<dyn AuthorizationGate>,
    pub default_timeout: Duration,
    /// Flips to true on cancel or abort
    pub halt: watch::Receiver<bool>,
}

impl StepRunner {
    /// Executes a step until it succeeds, fails for good, or is abandoned.
    pub async fn run(
        mut self,
        step: Arc<Step>,
        capability: CapabilityRef,
        params: Map<String, Value>,
    ) -> StepOutcome {
        let timeout = step.timeout.unwrap_or(self.default_timeout);
        let mut attempt = 0;

        loop {
            if attempt > 0 && self.halted() {
                debug!("Step '{}': retry abandoned", step.id);
                return StepOutcome::Abandoned;
            }
            attempt = self.handle.begin_attempt(&step.id);

            let request = AuthRequest {
                tool: step.tool.clone(),
                action: step.action.clone(),
                params: params.clone(),
                session_id: self.handle.id().to_string(),
                step_id: step.id.clone(),
                attempt,
            };
            if let Verdict::Deny(reason) = self.gate.authorize(&request).await {
                return StepOutcome::Failed(StepFailure::new(FailureKind::PermissionDenied, reason));
            }

            self.handle.mark_running(&step, attempt);
            let call = self.invoker.invoke(&capability, &params, timeout);
            let failure = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(output)) => return StepOutcome::Succeeded { output, attempt },
                Ok(Err(failure)) => failure,
                Err(_) => StepFailure::new(
                    FailureKind::Timeout,
                    format!("no result within {} ms", timeout.as_millis()),
                ),
            };

            if !failure.retryable() || !step.retry.allows_retry_after(attempt) {
                return StepOutcome::Failed(failure);
            }

            let delay = step.retry.delay_for(attempt);
            self.handle.mark_retrying(&step.id, attempt, delay, &failure);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_halt(&mut self.halt) => {
                    debug!("Step '{}': halted during backoff", step.id);
                    return StepOutcome::Abandoned;
                }
            }
        }
    }

    fn halted(&self) -> bool {
        *self.halt.borrow() || self.handle.is_halted()
    }
}

async fn wait_for_halt(halt: &mut watch::Receiver<bool>) {
    if halt.wait_for(|h| *h).await.is_err() {
        // Sender gone: nobody can halt this session any more.
        std::future::pending::<()>().await;
    }
}
