//! Structural schema for workflow documents
//!
//! Validation runs over the parsed document before it is converted into a
//! `WorkflowDefinition`, and collects every violation rather than stopping at
//! the first one. Each rule is data: a path into the document plus a message.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use super::action::{ActionKind, GitOperation, TrackerOperation};
use super::definition::{ErrorStrategy, InputType, LogLevel, OnErrorStrategy, WorkflowType};
use super::duration::{duration_from_value, scaled_duration, WaitUnit};

/// The only schema version this crate understands
pub const SCHEMA_VERSION: u64 = 1;

/// One violation found while validating a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// Location in the document, e.g. `steps[2].action`
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Fields every action requires beyond `id` and `action`
fn required_fields(kind: ActionKind) -> &'static [&'static str] {
    match kind {
        ActionKind::ExecuteWorkflow => &["workflow"],
        ActionKind::ShellCommand => &["command"],
        ActionKind::GitOperation => &["operation"],
        ActionKind::AzureDevops => &["operation"],
        ActionKind::Conditional => &["condition"],
        ActionKind::WhileLoop => &["condition", "steps"],
        ActionKind::ForLoop => &["items", "steps"],
        ActionKind::Parallel => &[],
        ActionKind::SetVariable => &["variable", "value"],
        ActionKind::Log => &["message"],
        ActionKind::Wait => &["duration"],
    }
}

/// Validate a parsed document and return every violation found
pub fn validate_document(doc: &Value) -> Vec<SchemaViolation> {
    let mut validator = Validator::default();
    validator.document(doc);
    validator.violations
}

#[derive(Default)]
struct Validator {
    violations: Vec<SchemaViolation>,
    /// step id -> path of first declaration
    step_ids: HashMap<String, String>,
}

impl Validator {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(SchemaViolation::new(path, message));
    }

    fn document(&mut self, doc: &Value) {
        let Some(root) = doc.as_object() else {
            self.push("$", "document must be a mapping");
            return;
        };

        if let Some(version) = root.get("schemaVersion") {
            match version.as_u64() {
                Some(SCHEMA_VERSION) => {}
                _ => self.push(
                    "schemaVersion",
                    format!("unsupported schema version {}, expected {}", version, SCHEMA_VERSION),
                ),
            }
        }

        match root.get("metadata") {
            Some(Value::Object(metadata)) => self.metadata(metadata),
            Some(_) => self.push("metadata", "must be a mapping"),
            None => self.push("metadata", "required section is missing"),
        }

        if let Some(inputs) = self.optional_list(root, "inputs") {
            for (i, input) in inputs.iter().enumerate() {
                self.input(&format!("inputs[{}]", i), input);
            }
        }

        if let Some(prereqs) = self.optional_list(root, "prerequisites") {
            for (i, prereq) in prereqs.iter().enumerate() {
                let path = format!("prerequisites[{}]", i);
                match prereq.as_object() {
                    Some(map) => {
                        self.required_string(map, &path, "description");
                        self.optional_string(map, &path, "check");
                        self.optional_bool(map, &path, "required");
                    }
                    None => self.push(path, "must be a mapping"),
                }
            }
        }

        match root.get("steps") {
            Some(Value::Array(steps)) if steps.is_empty() => {
                self.push("steps", "must contain at least one step")
            }
            Some(Value::Array(steps)) => self.steps("steps", steps),
            Some(_) => self.push("steps", "must be a list"),
            None => self.push("steps", "required section is missing"),
        }

        if let Some(outputs) = self.optional_list(root, "outputs") {
            for (i, output) in outputs.iter().enumerate() {
                let path = format!("outputs[{}]", i);
                match output.as_object() {
                    Some(map) => {
                        self.required_string(map, &path, "name");
                        if !map.contains_key("value") && !map.contains_key("valueExpression") {
                            self.push(format!("{}.value", path), "required field is missing");
                        }
                    }
                    None => self.push(path, "must be a mapping"),
                }
            }
        }

        if let Some(criteria) = self.optional_list(root, "successCriteria") {
            for (i, criterion) in criteria.iter().enumerate() {
                let path = format!("successCriteria[{}]", i);
                match criterion {
                    Value::String(_) => {}
                    Value::Object(map) => {
                        self.required_string(map, &path, "description");
                        self.optional_string(map, &path, "check");
                    }
                    _ => self.push(path, "must be a string or a mapping"),
                }
            }
        }

        match root.get("errorHandling") {
            None => {}
            Some(Value::Object(map)) => {
                if let Some(strategy) = map.get("strategy") {
                    self.one_of(
                        "errorHandling.strategy",
                        strategy,
                        &ErrorStrategy::NAMES,
                    );
                }
                if let Some(notify) = map.get("notify") {
                    if !notify.as_array().is_some_and(|n| n.iter().all(Value::is_string)) {
                        self.push("errorHandling.notify", "must be a list of strings");
                    }
                }
                self.optional_bool(map, "errorHandling", "allowMissingOutputs");
            }
            Some(_) => self.push("errorHandling", "must be a mapping"),
        }
    }

    fn metadata(&mut self, metadata: &Map<String, Value>) {
        for field in ["id", "name"] {
            self.required_string(metadata, "metadata", field);
        }

        match metadata.get("version") {
            Some(Value::String(_)) | Some(Value::Number(_)) => {}
            Some(_) => self.push("metadata.version", "must be a string"),
            None => self.push("metadata.version", "required field is missing"),
        }

        match metadata.get("type") {
            Some(value) => self.one_of("metadata.type", value, &WorkflowType::NAMES),
            None => self.push("metadata.type", "required field is missing"),
        }

        self.optional_string(metadata, "metadata", "description");
        self.optional_string(metadata, "metadata", "author");
        if let Some(tags) = metadata.get("tags") {
            if !tags.as_array().is_some_and(|t| t.iter().all(Value::is_string)) {
                self.push("metadata.tags", "must be a list of strings");
            }
        }
    }

    fn input(&mut self, path: &str, input: &Value) {
        let Some(map) = input.as_object() else {
            self.push(path, "must be a mapping");
            return;
        };

        self.required_string(map, path, "name");

        let input_type = match map.get("type") {
            Some(value) => {
                self.one_of(&format!("{}.type", path), value, &InputType::NAMES);
                value.as_str()
            }
            None => {
                self.push(format!("{}.type", path), "required field is missing");
                None
            }
        };

        self.optional_bool(map, path, "required");
        self.optional_string(map, path, "description");

        let values = map.get("values").or_else(|| map.get("allowedValues"));
        match (input_type, values) {
            (Some("enum"), None) => {
                self.push(format!("{}.values", path), "enum inputs must declare allowed values")
            }
            (Some("enum"), Some(Value::Array(items))) if items.is_empty() => {
                self.push(format!("{}.values", path), "enum inputs must declare allowed values")
            }
            (_, Some(Value::Array(_))) | (_, None) => {}
            (_, Some(_)) => self.push(format!("{}.values", path), "must be a list"),
        }

        if let Some(pattern) = map.get("pattern") {
            match pattern.as_str() {
                Some(p) => {
                    if let Err(e) = Regex::new(p) {
                        self.push(format!("{}.pattern", path), format!("invalid regex: {}", e));
                    }
                }
                None => self.push(format!("{}.pattern", path), "must be a string"),
            }
        }
    }

    fn steps(&mut self, path: &str, steps: &[Value]) {
        for (i, step) in steps.iter().enumerate() {
            self.step(&format!("{}[{}]", path, i), step);
        }
    }

    fn nested_steps(&mut self, map: &Map<String, Value>, path: &str, field: &str) {
        match map.get(field) {
            None => {}
            Some(Value::Array(steps)) => self.steps(&format!("{}.{}", path, field), steps),
            Some(_) => self.push(format!("{}.{}", path, field), "must be a list of steps"),
        }
    }

    fn step(&mut self, path: &str, step: &Value) {
        let Some(map) = step.as_object() else {
            self.push(path, "must be a mapping");
            return;
        };

        match map.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {
                if let Some(first) = self.step_ids.get(id) {
                    let message = format!("duplicate step id '{}' (first declared at {})", id, first);
                    self.push(format!("{}.id", path), message);
                } else {
                    self.step_ids.insert(id.to_string(), path.to_string());
                }
            }
            Some(_) => self.push(format!("{}.id", path), "must not be empty"),
            None => self.push(format!("{}.id", path), "required field is missing"),
        }

        self.optional_string(map, path, "name");
        self.optional_string(map, path, "condition");

        if let Some(timeout) = map.get("timeout") {
            if let Err(e) = duration_from_value(timeout) {
                self.push(format!("{}.timeout", path), e.to_string());
            }
        }

        if let Some(outputs) = map.get("outputs") {
            if !outputs.as_array().is_some_and(|o| o.iter().all(Value::is_string)) {
                self.push(format!("{}.outputs", path), "must be a list of output names");
            }
        }

        if let Some(on_error) = map.get("onError") {
            self.on_error(&format!("{}.onError", path), on_error);
        }

        let kind = match map.get("action") {
            Some(Value::String(tag)) => match ActionKind::parse(tag) {
                Some(kind) => kind,
                None => {
                    let known: Vec<_> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
                    self.push(
                        format!("{}.action", path),
                        format!("unknown action '{}', expected one of {}", tag, known.join(", ")),
                    );
                    return;
                }
            },
            Some(_) => {
                self.push(format!("{}.action", path), "must be a string");
                return;
            }
            None => {
                self.push(format!("{}.action", path), "required field is missing");
                return;
            }
        };

        for field in required_fields(kind) {
            if !map.contains_key(*field) {
                self.push(
                    format!("{}.{}", path, field),
                    format!("required for '{}' steps", kind),
                );
            }
        }

        match kind {
            ActionKind::ExecuteWorkflow => {
                self.optional_string(map, path, "workflow");
                self.optional_map(map, path, "inputs");
            }
            ActionKind::ShellCommand => {
                self.optional_string(map, path, "command");
                self.optional_map(map, path, "env");
                self.optional_string(map, path, "workingDir");
            }
            ActionKind::GitOperation => {
                if let Some(op) = map.get("operation") {
                    self.one_of(&format!("{}.operation", path), op, &GitOperation::NAMES);
                }
                self.optional_map(map, path, "inputs");
            }
            ActionKind::AzureDevops => {
                if let Some(op) = map.get("operation") {
                    self.one_of(&format!("{}.operation", path), op, &TrackerOperation::NAMES);
                }
                self.optional_map(map, path, "inputs");
            }
            ActionKind::Conditional => {
                if !map.contains_key("then") && !map.contains_key("steps") {
                    self.push(format!("{}.then", path), "required for 'conditional' steps");
                }
                self.nested_steps(map, path, "then");
                self.nested_steps(map, path, "steps");
                self.nested_steps(map, path, "else");
            }
            ActionKind::WhileLoop => {
                self.nested_steps(map, path, "steps");
                if let Some(max) = map.get("maxIterations") {
                    if !max.as_u64().is_some_and(|n| n > 0) {
                        self.push(
                            format!("{}.maxIterations", path),
                            "must be a positive integer",
                        );
                    }
                }
            }
            ActionKind::ForLoop => {
                if let Some(items) = map.get("items") {
                    if !matches!(items, Value::String(_) | Value::Array(_)) {
                        self.push(
                            format!("{}.items", path),
                            "must be an expression or a list",
                        );
                    }
                }
                self.nested_steps(map, path, "steps");
            }
            ActionKind::Parallel => {
                if !map.contains_key("branches") && !map.contains_key("steps") {
                    self.push(format!("{}.branches", path), "required for 'parallel' steps");
                }
                self.nested_steps(map, path, "branches");
                self.nested_steps(map, path, "steps");
                self.optional_bool(map, path, "failFast");
            }
            ActionKind::SetVariable => {
                self.optional_string(map, path, "variable");
            }
            ActionKind::Log => {
                self.optional_string(map, path, "message");
                if let Some(level) = map.get("level") {
                    self.one_of(&format!("{}.level", path), level, &LogLevel::NAMES);
                }
            }
            ActionKind::Wait => {
                // Expressions are resolved at run time
                let unit = match map.get("unit") {
                    Some(unit) => {
                        self.one_of(&format!("{}.unit", path), unit, &WaitUnit::NAMES);
                        match serde_json::from_value::<WaitUnit>(unit.clone()) {
                            Ok(unit) => Some(unit),
                            Err(_) => return,
                        }
                    }
                    None => None,
                };
                if let Some(duration) = map.get("duration") {
                    let is_expr = duration.as_str().is_some_and(|s| s.contains("${"));
                    if !is_expr {
                        if let Err(e) = scaled_duration(duration, unit) {
                            self.push(format!("{}.duration", path), e.to_string());
                        }
                    }
                }
            }
        }
    }

    fn on_error(&mut self, path: &str, on_error: &Value) {
        match on_error {
            Value::String(_) => self.one_of(path, on_error, &OnErrorStrategy::NAMES),
            Value::Object(map) => {
                if let Some(strategy) = map.get("strategy") {
                    self.one_of(&format!("{}.strategy", path), strategy, &OnErrorStrategy::NAMES);
                }
                if let Some(retries) = map.get("retries") {
                    if retries.as_u64().is_none() {
                        self.push(format!("{}.retries", path), "must be a non-negative integer");
                    }
                }
                if let Some(delay) = map.get("delay") {
                    if let Err(e) = duration_from_value(delay) {
                        self.push(format!("{}.delay", path), e.to_string());
                    }
                }
                self.nested_steps(map, path, "rollback");
            }
            _ => self.push(path, "must be a strategy name or a mapping"),
        }
    }

    fn optional_list<'a>(&mut self, map: &'a Map<String, Value>, field: &str) -> Option<&'a [Value]> {
        match map.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(items),
            Some(_) => {
                self.push(field, "must be a list");
                None
            }
        }
    }

    fn required_string(&mut self, map: &Map<String, Value>, path: &str, field: &str) {
        match map.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => self.push(format!("{}.{}", path, field), "must not be empty"),
            Some(_) => self.push(format!("{}.{}", path, field), "must be a string"),
            None => self.push(format!("{}.{}", path, field), "required field is missing"),
        }
    }

    fn optional_string(&mut self, map: &Map<String, Value>, path: &str, field: &str) {
        if let Some(value) = map.get(field) {
            if !value.is_string() {
                self.push(format!("{}.{}", path, field), "must be a string");
            }
        }
    }

    fn optional_bool(&mut self, map: &Map<String, Value>, path: &str, field: &str) {
        if let Some(value) = map.get(field) {
            if !value.is_boolean() {
                self.push(format!("{}.{}", path, field), "must be a boolean");
            }
        }
    }

    fn optional_map(&mut self, map: &Map<String, Value>, path: &str, field: &str) {
        if let Some(value) = map.get(field) {
            if !value.is_object() {
                self.push(format!("{}.{}", path, field), "must be a mapping");
            }
        }
    }

    fn one_of(&mut self, path: &str, value: &Value, allowed: &[&str]) {
        match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            Some(s) => self.push(
                path,
                format!("unknown value '{}', expected one of {}", s, allowed.join(", ")),
            ),
            None => self.push(path, "must be a string"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "metadata": {"id": "wf", "name": "Workflow", "version": "1.0.0", "type": "core"},
            "steps": [{"id": "hello", "action": "log", "message": "hi"}]
        })
    }

    #[test]
    fn test_minimal_document_is_valid() {
        assert!(validate_document(&minimal()).is_empty());
    }

    #[test]
    fn test_missing_sections_are_all_reported() {
        let violations = validate_document(&json!({}));
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["metadata", "steps"]);
    }

    #[test]
    fn test_collects_every_violation() {
        let doc = json!({
            "metadata": {"id": "wf", "name": "Workflow", "type": "nightly"},
            "inputs": [
                {"name": "A", "type": "text"},
                {"name": "B", "type": "enum"}
            ],
            "steps": [
                {"id": "one", "action": "teleport"},
                {"id": "one", "action": "shell-command"}
            ]
        });

        let violations = validate_document(&doc);
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"metadata.version"));
        assert!(paths.contains(&"metadata.type"));
        assert!(paths.contains(&"inputs[0].type"));
        assert!(paths.contains(&"inputs[1].values"));
        assert!(paths.contains(&"steps[0].action"));
        assert!(paths.contains(&"steps[1].id"));
        assert!(paths.contains(&"steps[1].command"));
        assert_eq!(violations.len(), 7);
    }

    #[test]
    fn test_nested_steps_are_validated() {
        let mut doc = minimal();
        doc["steps"] = json!([{
            "id": "loop",
            "action": "for-loop",
            "items": [1, 2],
            "steps": [{"id": "inner", "action": "wait", "duration": "soon"}]
        }]);

        let violations = validate_document(&doc);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "steps[0].steps[0].duration");
    }

    #[test]
    fn test_duplicate_ids_across_nesting() {
        let mut doc = minimal();
        doc["steps"] = json!([
            {"id": "same", "action": "log", "message": "a"},
            {"id": "branch", "action": "conditional", "condition": "true",
             "then": [{"id": "same", "action": "log", "message": "b"}]}
        ]);

        let violations = validate_document(&doc);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("duplicate step id 'same'"));
    }

    #[test]
    fn test_unsupported_schema_version() {
        let mut doc = minimal();
        doc["schemaVersion"] = json!(2);
        let violations = validate_document(&doc);
        assert_eq!(violations[0].path, "schemaVersion");
    }

    #[test]
    fn test_unknown_git_operation() {
        let mut doc = minimal();
        doc["steps"] = json!([{"id": "g", "action": "git-operation", "operation": "rebase"}]);
        let violations = validate_document(&doc);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "steps[0].operation");
    }
}
