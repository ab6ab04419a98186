//! Action implementations for externally-facing steps
//!
//! - `shell` - `shell-command` through `sh -c`
//! - `git` - `git-operation` against a `VersionControl` collaborator
//! - `tracker` - `azure-devops` against an `IssueTracker` collaborator
//!
//! Control-flow actions live in the executor because they recurse into it.

pub mod git;
pub mod shell;
pub mod tracker;

use serde_json::{Map, Value};

use crate::engine::error::ActionFailure;
use crate::workflow::expressions::stringify;

/// Typed access to a step's resolved `inputs` mapping
pub(crate) struct Args<'a> {
    operation: &'a str,
    inputs: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    pub(crate) fn new(operation: &'a str, inputs: &'a Map<String, Value>) -> Self {
        Self { operation, inputs }
    }

    /// First present, non-null value among `keys`
    fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|k| self.inputs.get(*k))
            .find(|v| !v.is_null())
    }

    pub(crate) fn required_str(&self, keys: &[&str]) -> Result<String, ActionFailure> {
        match self.get(keys) {
            Some(value) => {
                let s = stringify(value);
                if s.is_empty() {
                    Err(self.missing(keys[0]))
                } else {
                    Ok(s)
                }
            }
            None => Err(self.missing(keys[0])),
        }
    }

    pub(crate) fn optional_str(&self, keys: &[&str]) -> Option<String> {
        self.get(keys).map(stringify).filter(|s| !s.is_empty())
    }

    /// Integer ids arrive as numbers or numeric strings
    pub(crate) fn required_u64(&self, keys: &[&str]) -> Result<u64, ActionFailure> {
        let value = self.get(keys).ok_or_else(|| self.missing(keys[0]))?;
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            ActionFailure::invalid_input(format!(
                "{}: '{}' must be a non-negative integer, got {}",
                self.operation,
                keys[0],
                stringify(value)
            ))
        })
    }

    pub(crate) fn string_list(&self, keys: &[&str]) -> Result<Vec<String>, ActionFailure> {
        match self.get(keys) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.iter().map(stringify).collect()),
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(other) => Err(ActionFailure::invalid_input(format!(
                "{}: '{}' must be a list, got {}",
                self.operation,
                keys[0],
                stringify(other)
            ))),
        }
    }

    pub(crate) fn object(&self, keys: &[&str]) -> Result<Map<String, Value>, ActionFailure> {
        match self.get(keys) {
            None => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(ActionFailure::invalid_input(format!(
                "{}: '{}' must be a mapping, got {}",
                self.operation,
                keys[0],
                stringify(other)
            ))),
        }
    }

    pub(crate) fn inputs(&self) -> &'a Map<String, Value> {
        self.inputs
    }

    fn missing(&self, key: &str) -> ActionFailure {
        ActionFailure::invalid_input(format!("{} requires input '{}'", self.operation, key))
    }
}

/// Serialize a collaborator result into a step output map
pub(crate) fn to_outputs<T: serde::Serialize>(value: &T) -> Result<Map<String, Value>, ActionFailure> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            Ok(map)
        }
        Err(e) => Err(ActionFailure::invalid_input(format!(
            "Could not serialize result: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::StepErrorKind;
    use serde_json::json;

    #[test]
    fn test_args_accessors() {
        let inputs = json!({
            "repository": "api",
            "id": "17",
            "files": ["a.rs", "b.rs"],
            "fields": {"System.State": "Active"},
            "empty": ""
        });
        let inputs = inputs.as_object().unwrap();
        let args = Args::new("commit", inputs);

        assert_eq!(args.required_str(&["repo", "repository"]).unwrap(), "api");
        assert_eq!(args.required_u64(&["id"]).unwrap(), 17);
        assert_eq!(args.string_list(&["files"]).unwrap(), vec!["a.rs", "b.rs"]);
        assert_eq!(args.object(&["fields"]).unwrap()["System.State"], "Active");
        assert_eq!(args.optional_str(&["empty"]), None);

        let err = args.required_str(&["message"]).unwrap_err();
        assert_eq!(err.kind, StepErrorKind::InvalidInput);
        assert_eq!(err.message, "commit requires input 'message'");
        assert!(args.object(&["repository"]).is_err());
    }
}
