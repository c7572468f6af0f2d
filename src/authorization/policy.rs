//! Policy Gate
//!
//! Configurable authorization, checked in this order:
//!
//! 1. The tool's `enabled` flag
//! 2. The tool's `allowed_actions` list (empty allows all)
//! 3. Business rules, in registration order; the first deny wins
//! 4. The tool's sliding-window rate limit
//!
//! Only calls that pass every check consume rate-limit quota.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use super::{AuthRequest, AuthorizationGate, Verdict};
use crate::config::{PolicyConfig, RateLimit, ToolPermission};

/// A named domain check, e.g. a maximum stake or trading hours.
pub trait BusinessRule: Send + Sync {
    fn evaluate(&self, request: &AuthRequest) -> Verdict;
}

impl<F> BusinessRule for F
where
    F: Fn(&AuthRequest) -> Verdict + Send + Sync,
{
    fn evaluate(&self, request: &AuthRequest) -> Verdict {
        self(request)
    }
}

/// Authorization gate driven by [`PolicyConfig`] and registered rules.
#[derive(Default)]
pub struct PolicyGate {
    permissions: RwLock<HashMap<String, ToolPermission>>,
    rules: RwLock<Vec<(String, Arc<dyn BusinessRule>)>>,
    rate_limits: HashMap<String, RateLimit>,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl PolicyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            permissions: RwLock::new(config.permissions.clone()),
            rate_limits: config.rate_limits.clone(),
            ..Self::default()
        }
    }

    /// Sets the permission for a tool.
    pub fn set_permission(&self, tool: &str, enabled: bool, allowed_actions: Vec<String>) {
        self.permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                tool.to_string(),
                ToolPermission {
                    enabled,
                    allowed_actions,
                },
            );
    }

    /// Registers a business rule. Re-using a name replaces that rule and
    /// keeps its position.
    pub fn add_rule(&self, name: &str, rule: impl BusinessRule + 'static) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule: Arc<dyn BusinessRule> = Arc::new(rule);
        match rules.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = rule,
            None => rules.push((name.to_string(), rule)),
        }
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|(n, _)| n != name);
        rules.len() != before
    }

    fn check_permission(&self, request: &AuthRequest) -> Verdict {
        let permissions = self.permissions.read().unwrap_or_else(PoisonError::into_inner);
        let Some(permission) = permissions.get(&request.tool) else {
            return Verdict::Allow;
        };

        if !permission.enabled {
            return Verdict::deny(format!("tool '{}' is disabled", request.tool));
        }
        if !permission.allowed_actions.is_empty()
            && !permission.allowed_actions.iter().any(|a| a == &request.action)
        {
            return Verdict::deny(format!(
                "action '{}' is not allowed for tool '{}'",
                request.action, request.tool
            ));
        }
        Verdict::Allow
    }

    fn check_rules(&self, request: &AuthRequest) -> Verdict {
        // Snapshot so rules run without holding the lock.
        let rules: Vec<(String, Arc<dyn BusinessRule>)> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (name, rule) in rules {
            if let Verdict::Deny(reason) = rule.evaluate(request) {
                return Verdict::deny(format!("business rule '{}': {}", name, reason));
            }
        }
        Verdict::Allow
    }

    fn take_quota(&self, tool: &str) -> Verdict {
        let Some(limit) = self.rate_limits.get(tool) else {
            return Verdict::Allow;
        };

        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let window = calls.entry(tool.to_string()).or_default();
        while window
            .front()
            .is_some_and(|&t| now.duration_since(t) >= limit.window)
        {
            window.pop_front();
        }

        if window.len() >= limit.max_calls as usize {
            return Verdict::deny(format!(
                "rate limit exceeded for '{}' ({} calls per {:?})",
                tool, limit.max_calls, limit.window
            ));
        }
        window.push_back(now);
        Verdict::Allow
    }
}

#[async_trait]
impl AuthorizationGate for PolicyGate {
    async fn authorize(&self, request: &AuthRequest) -> Verdict {
        let verdict = match self.check_permission(request) {
            Verdict::Allow => match self.check_rules(request) {
                Verdict::Allow => self.take_quota(&request.tool),
                deny => deny,
            },
            deny => deny,
        };

        match &verdict {
            Verdict::Allow => debug!(
                "Authorized {}.{} for step '{}' (attempt {})",
                request.tool, request.action, request.step_id, request.attempt
            ),
            Verdict::Deny(reason) => warn!(
                "Denied {}.{} for step '{}': {}",
                request.tool, request.action, request.step_id, reason
            ),
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn request(tool: &str, action: &str) -> AuthRequest {
        AuthRequest {
            tool: tool.into(),
            action: action.into(),
            params: Map::new(),
            session_id: "s".into(),
            step_id: "s1".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_allowed() {
        let gate = PolicyGate::new();
        assert!(gate.authorize(&request("any", "thing")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_disabled_tool() {
        let gate = PolicyGate::new();
        gate.set_permission("shell", false, Vec::new());

        let verdict = gate.authorize(&request("shell", "run")).await;
        assert_eq!(verdict, Verdict::deny("tool 'shell' is disabled"));
    }

    #[tokio::test]
    async fn test_allowed_actions() {
        let gate = PolicyGate::new();
        gate.set_permission("betfair", true, vec!["get_odds".into()]);

        assert!(gate.authorize(&request("betfair", "get_odds")).await.is_allowed());
        assert!(!gate.authorize(&request("betfair", "place_bet")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_business_rule_deny_overrides() {
        let gate = PolicyGate::new();
        gate.add_rule("always", |_: &AuthRequest| Verdict::Allow);
        gate.add_rule("max_stake", |r: &AuthRequest| {
            match r.params.get("stake").and_then(|v| v.as_f64()) {
                Some(stake) if stake > 100.0 => Verdict::deny("stake above 100"),
                _ => Verdict::Allow,
            }
        });

        let mut big = request("betfair", "place_bet");
        big.params.insert("stake".into(), json!(500));
        match gate.authorize(&big).await {
            Verdict::Deny(reason) => assert!(reason.contains("max_stake")),
            Verdict::Allow => panic!("expected deny"),
        }

        let small = request("betfair", "place_bet");
        assert!(gate.authorize(&small).await.is_allowed());
    }

    #[tokio::test]
    async fn test_rule_replacement_keeps_order() {
        let gate = PolicyGate::new();
        gate.add_rule("first", |_: &AuthRequest| Verdict::deny("one"));
        gate.add_rule("second", |_: &AuthRequest| Verdict::deny("two"));
        gate.add_rule("first", |_: &AuthRequest| Verdict::deny("uno"));

        assert_eq!(
            gate.authorize(&request("t", "a")).await,
            Verdict::deny("business rule 'first': uno")
        );

        assert!(gate.remove_rule("first"));
        assert_eq!(
            gate.authorize(&request("t", "a")).await,
            Verdict::deny("business rule 'second': two")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sliding_window() {
        let mut config = PolicyConfig::default();
        config.rate_limits.insert(
            "api".into(),
            RateLimit {
                max_calls: 2,
                window: Duration::from_secs(10),
            },
        );
        let gate = PolicyGate::from_config(&config);

        assert!(gate.authorize(&request("api", "get")).await.is_allowed());
        assert!(gate.authorize(&request("api", "get")).await.is_allowed());
        assert!(!gate.authorize(&request("api", "get")).await.is_allowed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(gate.authorize(&request("api", "get")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_denied_calls_do_not_consume_quota() {
        let mut config = PolicyConfig::default();
        config.rate_limits.insert(
            "api".into(),
            RateLimit {
                max_calls: 1,
                window: Duration::from_secs(60),
            },
        );
        config.permissions.insert(
            "api".into(),
            ToolPermission {
                enabled: true,
                allowed_actions: vec!["get".into()],
            },
        );
        let gate = PolicyGate::from_config(&config);

        assert!(!gate.authorize(&request("api", "delete")).await.is_allowed());
        assert!(gate.authorize(&request("api", "get")).await.is_allowed());
    }
}
