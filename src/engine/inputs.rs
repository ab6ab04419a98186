//! Input validation and prerequisite checks, run before any step executes

use regex::Regex;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use super::error::{ExecutorError, InputViolation};
use crate::workflow::expressions::{evaluate_condition, stringify};
use crate::workflow::{ExecutionContext, InputSpec, InputType, WorkflowDefinition};

/// Merge supplied inputs with declared defaults and check every declaration
///
/// All violations are collected so the caller sees every problem at once.
/// String values supplied for number and boolean inputs are coerced when
/// they parse. Undeclared inputs pass through unchanged.
pub fn validate_inputs(
    definition: &WorkflowDefinition,
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>, ExecutorError> {
    let mut resolved = Map::new();
    let mut violations = Vec::new();

    for spec in &definition.inputs {
        let value = supplied
            .get(&spec.name)
            .filter(|v| !v.is_null())
            .or(spec.default.as_ref());

        let Some(value) = value else {
            if spec.required {
                violations.push(violation(spec, "required input is missing"));
            }
            continue;
        };

        match check_input(spec, value) {
            Ok(value) => {
                resolved.insert(spec.name.clone(), value);
            }
            Err(message) => violations.push(violation(spec, &message)),
        }
    }

    for (name, value) in supplied {
        if !resolved.contains_key(name) && !definition.inputs.iter().any(|s| &s.name == name) {
            debug!("Passing through undeclared input '{}'", name);
            resolved.insert(name.clone(), value.clone());
        }
    }

    if violations.is_empty() {
        Ok(resolved)
    } else {
        Err(ExecutorError::InputValidation {
            workflow_id: definition.id().to_string(),
            violations,
        })
    }
}

fn violation(spec: &InputSpec, message: &str) -> InputViolation {
    InputViolation {
        input: spec.name.clone(),
        message: message.to_string(),
    }
}

fn check_input(spec: &InputSpec, value: &Value) -> Result<Value, String> {
    let coerced = match spec.input_type {
        InputType::String => match value {
            Value::String(_) => value.clone(),
            Value::Number(_) | Value::Bool(_) => Value::String(stringify(value)),
            other => return Err(format!("expected a string, got {}", other)),
        },
        InputType::Number => coerce_number(value)
            .ok_or_else(|| format!("expected a number, got {}", value))?,
        InputType::Boolean => coerce_bool(value)
            .ok_or_else(|| format!("expected a boolean, got {}", value))?,
        InputType::Enum => {
            let allowed = spec.allowed_values.as_deref().unwrap_or_default();
            let text = stringify(value);
            allowed
                .iter()
                .find(|candidate| stringify(candidate) == text)
                .cloned()
                .ok_or_else(|| {
                    let names: Vec<String> = allowed.iter().map(stringify).collect();
                    format!("'{}' is not one of [{}]", text, names.join(", "))
                })?
        }
    };

    if let Some(pattern) = &spec.pattern {
        let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
        let text = stringify(&coerced);
        if !regex.is_match(&text) {
            return Err(format!("'{}' does not match pattern {}", text, pattern));
        }
    }

    Ok(coerced)
}

fn coerce_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(Value::from(i))
            } else {
                s.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            }
        }
        _ => None,
    }
}

fn coerce_bool(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

/// Evaluate prerequisites against a context whose inputs are set
///
/// A failing required prerequisite aborts the run; a failing optional one
/// is logged. Prerequisites without a `check` are informational.
pub fn check_prerequisites(
    definition: &WorkflowDefinition,
    ctx: &ExecutionContext,
) -> Result<(), ExecutorError> {
    for prerequisite in &definition.prerequisites {
        let Some(check) = &prerequisite.check else {
            debug!("Prerequisite (unchecked): {}", prerequisite.description);
            continue;
        };

        let reason = match evaluate_condition(check, ctx) {
            Ok(true) => continue,
            Ok(false) => format!("check '{}' evaluated to false", check),
            Err(e) => e.to_string(),
        };

        if prerequisite.required {
            return Err(ExecutorError::Prerequisite {
                workflow_id: definition.id().to_string(),
                description: prerequisite.description.clone(),
                reason,
            });
        }
        warn!(
            "Optional prerequisite not met: {} ({})",
            prerequisite.description, reason
        );
    }
    Ok(())
}
