//! Tool Registry
//!
//! The resolved set of tools a workflow may call. Discovery of tool
//! manuals happens elsewhere; the validator only needs
//! `resolve(tool, action)` returning the parameter schema and the
//! capability handle the invoker understands.
//!
//! # Manifest Format
//!
//! ```yaml
//! tools:
//!   - name: weather
//!     description: Forecast lookups
//!     actions:
//!       - name: forecast
//!         required: [city]
//!         optional: [days]
//!         command: ["weather-cli", "forecast"]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Declared parameters of a tool action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl ParamSchema {
    pub fn required(names: &[&str]) -> Self {
        Self {
            required: names.iter().map(|s| s.to_string()).collect(),
            optional: Vec::new(),
        }
    }

    /// Returns true if `name` is declared at all.
    pub fn declares(&self, name: &str) -> bool {
        self.required.iter().chain(&self.optional).any(|p| p == name)
    }
}

/// Opaque handle passed to the tool invoker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRef {
    /// `tool.action`
    pub id: String,

    /// Program and arguments for subprocess-backed tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl CapabilityRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }
}

/// A resolved tool action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub tool: String,
    pub action: String,
    pub description: Option<String>,
    pub params: ParamSchema,
    pub capability: CapabilityRef,
}

/// Read-only lookup used at validation time.
pub trait ToolRegistry: Send + Sync {
    fn resolve(&self, tool: &str, action: &str) -> Option<ToolSpec>;

    /// Every registered action, ordered by tool then action.
    fn tools(&self) -> Vec<ToolSpec>;
}

/// Registry backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    specs: HashMap<(String, String), ToolSpec>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action, replacing any previous one with the same name.
    pub fn register(&mut self, tool: &str, action: &str, params: ParamSchema) -> &mut Self {
        let capability = CapabilityRef::new(format!("{}.{}", tool, action));
        self.register_spec(ToolSpec {
            tool: tool.to_string(),
            action: action.to_string(),
            description: None,
            params,
            capability,
        })
    }

    pub fn register_spec(&mut self, spec: ToolSpec) -> &mut Self {
        debug!("Registering tool action {}", spec.capability.id);
        self.specs
            .insert((spec.tool.clone(), spec.action.clone()), spec);
        self
    }

    /// Builds a registry from a manifest document.
    pub fn from_manifest(manifest: ToolManifest) -> Self {
        let mut registry = Self::new();
        for tool in manifest.tools {
            for action in tool.actions {
                let id = format!("{}.{}", tool.name, action.name);
                registry.register_spec(ToolSpec {
                    tool: tool.name.clone(),
                    action: action.name,
                    description: action.description.or_else(|| tool.description.clone()),
                    params: action.params,
                    capability: CapabilityRef::new(id).with_command(action.command),
                });
            }
        }
        registry
    }

    /// Loads a YAML (or JSON) manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        let manifest: ToolManifest =
            serde_yaml::from_str(&content).map_err(|e| LoadError::parse(path, e))?;

        let registry = Self::from_manifest(manifest);
        info!(
            "Loaded {} tool actions from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl ToolRegistry for InMemoryRegistry {
    fn resolve(&self, tool: &str, action: &str) -> Option<ToolSpec> {
        self.specs
            .get(&(tool.to_string(), action.to_string()))
            .cloned()
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let mut tools: Vec<ToolSpec> = self.specs.values().cloned().collect();
        tools.sort_by(|a, b| (&a.tool, &a.action).cmp(&(&b.tool, &b.action)));
        tools
    }
}

/// Top-level manifest document.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ToolManifest {
    #[serde(default)]
    pub tools: Vec<ManifestTool>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManifestTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub actions: Vec<ManifestAction>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManifestAction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub params: ParamSchema,
    #[serde(default)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
tools:
  - name: weather
    description: Forecast lookups
    actions:
      - name: forecast
        required: [city]
        optional: [days]
        command: ["weather-cli", "forecast"]
      - name: alerts
        description: Severe weather alerts
"#;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = InMemoryRegistry::new();
        registry.register("http", "get", ParamSchema::required(&["url"]));

        let spec = registry.resolve("http", "get").unwrap();
        assert_eq!(spec.capability.id, "http.get");
        assert_eq!(spec.params.required, vec!["url"]);
        assert!(registry.resolve("http", "post").is_none());
        assert!(registry.resolve("ftp", "get").is_none());
    }

    #[test]
    fn test_tools_lists_catalog_in_order() {
        let mut registry = InMemoryRegistry::new();
        registry
            .register("weather", "forecast", ParamSchema::required(&["city"]))
            .register("http", "post", ParamSchema::default())
            .register("http", "get", ParamSchema::required(&["url"]));

        let names: Vec<String> = registry
            .tools()
            .iter()
            .map(|t| t.capability.id.clone())
            .collect();
        assert_eq!(names, vec!["http.get", "http.post", "weather.forecast"]);
        assert!(InMemoryRegistry::new().tools().is_empty());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = InMemoryRegistry::new();
        registry.register("t", "a", ParamSchema::required(&["x"]));
        registry.register("t", "a", ParamSchema::default());

        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("t", "a").unwrap().params.required.is_empty());
    }

    #[test]
    fn test_manifest_parsing() {
        let manifest: ToolManifest = serde_yaml::from_str(MANIFEST).unwrap();
        let registry = InMemoryRegistry::from_manifest(manifest);

        assert_eq!(registry.len(), 2);
        let forecast = registry.resolve("weather", "forecast").unwrap();
        assert_eq!(forecast.capability.command, vec!["weather-cli", "forecast"]);
        assert!(forecast.params.declares("days"));
        assert_eq!(forecast.description.as_deref(), Some("Forecast lookups"));

        let alerts = registry.resolve("weather", "alerts").unwrap();
        assert_eq!(alerts.description.as_deref(), Some("Severe weather alerts"));
        assert!(alerts.params.required.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tools.yaml");
        fs::write(&path, MANIFEST).unwrap();

        let registry = InMemoryRegistry::load(&path).unwrap();
        assert!(registry.resolve("weather", "forecast").is_some());
    }

    #[test]
    fn test_load_missing_file() {
        let result = InMemoryRegistry::load("/nonexistent/tools.yaml");
        assert!(matches!(result, Err(LoadError::Io { .. })));
    }
}
