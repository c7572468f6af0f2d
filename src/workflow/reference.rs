//! Parameter References
//!
//! Steps pass data to each other through whole-value references inside
//! their params:
//!
//! - `"$fetch"` is replaced by the complete output of step `fetch`
//! - `"$fetch.items.0.id"` walks object keys and array indices
//! - `"$$price"` is the literal string `"$price"`
//!
//! References are resolved once, immediately before dispatch, against an
//! immutable snapshot of the session state.

use serde_json::{Map, Value};
use thiserror::Error;

/// A parsed `$root.path` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRef {
    /// Step ID or declared input name
    pub root: String,
    /// Keys or indices walked into the root value
    pub path: Vec<String>,
}

impl ParamRef {
    /// Parses a string param. Returns `None` for plain strings and escapes.
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix('$')?;
        if body.starts_with('$') || body.is_empty() {
            return None;
        }

        let mut parts = body.split('.');
        let root = parts.next()?.trim();
        if root.is_empty() {
            return None;
        }

        Some(Self {
            root: root.to_string(),
            path: parts.map(str::to_string).collect(),
        })
    }

    /// Looks the reference up in `state`.
    pub fn lookup<'a>(&self, state: &'a Map<String, Value>) -> Result<&'a Value, ResolveError> {
        let mut current = state
            .get(&self.root)
            .ok_or_else(|| ResolveError::MissingRoot(self.to_string()))?;

        for segment in &self.path {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| ResolveError::MissingPath {
                reference: self.to_string(),
                segment: segment.clone(),
            })?;
        }

        Ok(current)
    }
}

impl std::fmt::Display for ParamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.root)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Why a reference could not be substituted at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("reference '{0}' has no value in session state")]
    MissingRoot(String),

    #[error("reference '{reference}' has no element '{segment}'")]
    MissingPath { reference: String, segment: String },
}

/// Collects every reference appearing anywhere in `params`.
pub fn collect_references(params: &Map<String, Value>) -> Vec<ParamRef> {
    let mut refs = Vec::new();
    for value in params.values() {
        collect_into(value, &mut refs);
    }
    refs
}

fn collect_into(value: &Value, refs: &mut Vec<ParamRef>) {
    match value {
        Value::String(s) => {
            if let Some(r) = ParamRef::parse(s) {
                refs.push(r);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_into(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_into(v, refs)),
        _ => {}
    }
}

/// Substitutes all references in `params` using `state`.
///
/// Escaped strings (`$$x`) lose one leading `$`.
pub fn resolve_params(
    params: &Map<String, Value>,
    state: &Map<String, Value>,
) -> Result<Map<String, Value>, ResolveError> {
    params
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, state)?)))
        .collect()
}

fn resolve_value(value: &Value, state: &Map<String, Value>) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => {
            if let Some(r) = ParamRef::parse(s) {
                return r.lookup(state).cloned();
            }
            match s.strip_prefix("$$") {
                Some(rest) => Ok(Value::String(format!("${}", rest))),
                None => Ok(value.clone()),
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, state))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_params(map, state).map(Value::Object),
        _ => Ok(value.clone()),
    }
}
