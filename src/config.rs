//! Runtime Configuration
//!
//! Engine, bus and policy settings, loaded from YAML. Every section and
//! field is optional.
//!
//! ```yaml
//! engine:
//!   max_concurrency: 4
//!   default_timeout_ms: 30000
//! bus:
//!   history_capacity: 1000
//!   subscriber_buffer: 256
//! policy:
//!   permissions:
//!     betfair:
//!       enabled: true
//!       allowed_actions: [list_markets, get_odds]
//!     shell:
//!       enabled: false
//!   rate_limits:
//!     betfair:
//!       max_calls: 10
//!       window_ms: 60000
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::events::{DEFAULT_HISTORY_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER};

/// Timeout applied to steps that do not set one.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub bus: BusConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| LoadError::parse(path, e))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum in-flight steps per session. `None` means unbounded.
    pub max_concurrency: Option<usize>,

    #[serde(rename = "default_timeout_ms", with = "crate::workflow::model::millis")]
    pub default_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            default_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub history_capacity: usize,
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Static authorization policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Per-tool permissions. Tools not listed are enabled for all actions.
    pub permissions: HashMap<String, ToolPermission>,

    /// Per-tool call quotas. Tools not listed are unlimited.
    pub rate_limits: HashMap<String, RateLimit>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPermission {
    pub enabled: bool,

    /// Empty means every action is allowed
    pub allowed_actions: Vec<String>,
}

impl Default for ToolPermission {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_actions: Vec::new(),
        }
    }
}

/// At most `max_calls` allowed calls in any sliding `window`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max_calls: u32,

    #[serde(rename = "window_ms", with = "crate::workflow::model::millis")]
    pub window: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.max_concurrency, None);
        assert_eq!(config.engine.default_timeout, Duration::from_secs(30));
        assert_eq!(config.bus.history_capacity, 1000);
        assert!(config.policy.permissions.is_empty());
    }

    #[test]
    fn test_partial_document() {
        let config: Config = serde_yaml::from_str("engine:\n  max_concurrency: 2\n").unwrap();
        assert_eq!(config.engine.max_concurrency, Some(2));
        assert_eq!(config.engine.default_timeout, DEFAULT_STEP_TIMEOUT);
        assert_eq!(config.bus, BusConfig::default());
    }

    #[test]
    fn test_policy_section() {
        let yaml = r#"
policy:
  permissions:
    shell:
      enabled: false
    betfair:
      allowed_actions: [get_odds]
  rate_limits:
    betfair:
      max_calls: 5
      window_ms: 1000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(!config.policy.permissions["shell"].enabled);
        assert!(config.policy.permissions["betfair"].enabled);
        assert_eq!(config.policy.permissions["betfair"].allowed_actions, vec!["get_odds"]);
        assert_eq!(config.policy.rate_limits["betfair"].window, Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("toolrunner.yaml");
        fs::write(&path, "bus:\n  subscriber_buffer: 16\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bus.subscriber_buffer, 16);
        assert_eq!(config.bus.history_capacity, 1000);
    }

    #[test]
    fn test_load_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "engine: [1, 2").unwrap();

        assert!(matches!(Config::load(&path), Err(LoadError::Parse { .. })));
    }
}
