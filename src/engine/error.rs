//! Executor error types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeError;
use crate::workflow::expressions::ExpressionError;
use crate::workflow::{ActionKind, DefinitionError, RegistryError, Step};

/// A supplied input that failed validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputViolation {
    pub input: String,
    pub message: String,
}

impl std::fmt::Display for InputViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.input, self.message)
    }
}

/// Errors that end a run before any step executes, or that prevent it
/// from starting at all
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Registry error: {0}")]
    Registry(RegistryError),

    #[error("Invalid inputs for {workflow_id}: {}", join(.violations))]
    InputValidation {
        workflow_id: String,
        violations: Vec<InputViolation>,
    },

    #[error("Prerequisite failed for {workflow_id}: {description} ({reason})")]
    Prerequisite {
        workflow_id: String,
        description: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Bridge error: {0}")]
    BridgeError(#[from] BridgeError),
}

impl From<RegistryError> for ExecutorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ExecutorError::WorkflowNotFound(id),
            other => ExecutorError::Registry(other),
        }
    }
}

fn join(violations: &[InputViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Category of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepErrorKind {
    /// A `${...}` reference or condition could not be resolved
    Expression,
    /// Resolved inputs had the wrong shape for the action
    InvalidInput,
    /// Non-zero exit or spawn failure of a shell command
    Command,
    Vcs,
    Tracker,
    Timeout,
    /// A nested step, branch or workflow failed
    Nested,
    WorkflowNotFound,
    LoopBound,
    /// A declared output was not produced by the action
    MissingOutput,
    Cancelled,
}

/// Structured record of a failed step, kept in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("Step '{step_id}' ({action}) failed: {message}")]
pub struct StepError {
    pub step_id: String,
    pub action: ActionKind,
    pub kind: StepErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StepError {
    pub fn new(step: &Step, failure: ActionFailure) -> Self {
        Self {
            step_id: step.id.clone(),
            action: step.kind(),
            kind: failure.kind,
            message: failure.message,
            at: Utc::now(),
        }
    }

    pub fn cancelled(step: &Step) -> Self {
        Self::new(step, ActionFailure::cancelled())
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == StepErrorKind::Cancelled
    }
}

/// Failure produced by an action handler, before it is attributed to a step
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ActionFailure {
    pub kind: StepErrorKind,
    pub message: String,
}

impl ActionFailure {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "run was cancelled")
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::InvalidInput, message)
    }

    /// Wrap the failure of a nested step; cancellation stays cancellation
    pub fn nested(inner: &StepError) -> Self {
        let kind = if inner.is_cancelled() {
            StepErrorKind::Cancelled
        } else {
            StepErrorKind::Nested
        };
        Self::new(kind, format!("step '{}' failed: {}", inner.step_id, inner.message))
    }
}

impl From<ExpressionError> for ActionFailure {
    fn from(e: ExpressionError) -> Self {
        Self::new(StepErrorKind::Expression, e.to_string())
    }
}
