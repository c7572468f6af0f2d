//! Authorization Module
//!
//! Every step attempt is checked by an [`AuthorizationGate`] before the
//! tool is invoked. A deny fails the step with `PermissionDenied` and is
//! never retried.
//!
//! # Components
//!
//! - [`AuthorizationGate`]: the engine-facing seam
//! - [`AllowAll`]: permits everything
//! - [`PolicyGate`]: permissions, business rules and rate limits

pub mod policy;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

pub use policy::{BusinessRule, PolicyGate};

/// What is being authorized.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub tool: String,
    pub action: String,

    /// Params after reference substitution
    pub params: Map<String, Value>,

    pub session_id: String,
    pub step_id: String,

    /// 1-based attempt number
    pub attempt: u32,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Verdict::Deny(reason.into())
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Decides whether a tool call may proceed.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    async fn authorize(&self, request: &AuthRequest) -> Verdict;
}

/// Gate that allows every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthorizationGate for AllowAll {
    async fn authorize(&self, _request: &AuthRequest) -> Verdict {
        Verdict::Allow
    }
}
