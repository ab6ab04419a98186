//! Execution context for a single workflow run
//!
//! Holds every piece of mutable run state: resolved inputs, the `steps`
//! namespace of recorded step outputs, computed workflow outputs, ambient
//! variables, and the append-only execution history. One context exists per
//! run; nested workflows get their own child context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::action::ActionKind;
use super::definition::OutputSpec;
use super::expressions::{self, ExpressionError};
use crate::engine::error::StepError;

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Validating,
    Running,
    Succeeded,
    Failed,
    PartiallySucceeded,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::PartiallySucceeded
                | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Validating => "validating",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::PartiallySucceeded => "partially-succeeded",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// One history record, appended per step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub action: ActionKind,
    pub status: StepStatus,
    /// 1-based attempt number; retried steps produce one entry per attempt
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Message emitted by `log` steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// History of nested steps (control flow bodies, nested workflow runs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<HistoryEntry>,
}

impl HistoryEntry {
    /// Entry for a step that was not executed
    pub fn skipped(step_id: &str, action: ActionKind) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            action,
            status: StepStatus::Skipped,
            attempt: 0,
            started_at: now,
            ended_at: now,
            message: None,
            error: None,
            nested: Vec::new(),
        }
    }

    /// Depth-first iterator over this entry and all nested entries
    pub fn flatten(&self) -> Vec<&HistoryEntry> {
        let mut out = vec![self];
        for child in &self.nested {
            out.extend(child.flatten());
        }
        out
    }
}

/// Identity of the run that invoked a nested workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRun {
    pub workflow_id: String,
    pub run_id: String,
    pub execution_id: String,
}

/// A declared workflow output that could not be computed
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[error("Output '{output}' could not be resolved: {message}")]
pub struct OutputResolutionError {
    pub output: String,
    pub message: String,
}

/// Serializable copy of a context, for audit and debugging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub run_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub inputs: Map<String, Value>,
    pub steps: BTreeMap<String, Map<String, Value>>,
    pub outputs: Map<String, Value>,
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRun>,
    pub history: Vec<HistoryEntry>,
}

/// Per-run mutable state
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub workflow_id: String,
    /// `<workflow-id>-<YYYYmmddHHMMSS>`
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub parent: Option<ParentRun>,

    inputs: Map<String, Value>,
    steps: BTreeMap<String, Map<String, Value>>,
    outputs: Map<String, Value>,
    variables: Map<String, Value>,
    history: Vec<HistoryEntry>,
}

impl ExecutionContext {
    /// Create a context for a new run with a generated run id
    pub fn new(workflow_id: &str) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            execution_id: format!("{}-{}", workflow_id, started_at.format("%Y%m%d%H%M%S")),
            started_at,
            status: RunStatus::Pending,
            parent: None,
            inputs: Map::new(),
            steps: BTreeMap::new(),
            outputs: Map::new(),
            variables: Map::new(),
            history: Vec::new(),
        }
    }

    /// Create the context of a nested run invoked from this one
    pub fn child(&self, workflow_id: &str) -> Self {
        let mut child = Self::new(workflow_id);
        child.parent = Some(ParentRun {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            execution_id: self.execution_id.clone(),
        });
        child
    }

    /// Copy used by a parallel branch; starts with an empty history
    pub fn fork(&self) -> Self {
        let mut fork = self.clone();
        fork.history.clear();
        fork
    }

    /// Pull step outputs recorded by a forked branch back into this context
    pub fn absorb_steps(&mut self, branch: &ExecutionContext) {
        for (step_id, outputs) in &branch.steps {
            self.steps.insert(step_id.clone(), outputs.clone());
        }
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    pub fn set_inputs(&mut self, inputs: Map<String, Value>) {
        self.inputs = inputs;
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    /// Resolved value of a workflow input
    pub fn resolve_input(&self, name: &str) -> Result<&Value, ExpressionError> {
        self.inputs
            .get(name)
            .ok_or_else(|| ExpressionError::Unresolved(format!("inputs.{}", name)))
    }

    // ------------------------------------------------------------------
    // Steps namespace
    // ------------------------------------------------------------------

    /// Record the outputs of a completed step under its id
    pub fn record_step_output(&mut self, step_id: &str, outputs: Map<String, Value>) {
        self.steps.insert(step_id.to_string(), outputs);
    }

    pub fn step_outputs(&self, step_id: &str) -> Option<&Map<String, Value>> {
        self.steps.get(step_id)
    }

    // ------------------------------------------------------------------
    // Ambient variables
    // ------------------------------------------------------------------

    /// Write into the ambient namespace (`${context.NAME}` or `${NAME}`)
    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append one entry; history is never rewritten
    pub fn append_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Take the history out of the context, leaving it empty
    pub fn take_history(&mut self) -> Vec<HistoryEntry> {
        std::mem::take(&mut self.history)
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    /// Resolve every declared output against the current namespaces
    ///
    /// Outputs are evaluated in declaration order, so a later output may read
    /// an earlier one through `${outputs.NAME}`. Resolvable outputs are stored
    /// even when others fail.
    pub fn compute_outputs(
        &mut self,
        specs: &[OutputSpec],
    ) -> Result<&Map<String, Value>, Vec<OutputResolutionError>> {
        let mut errors = Vec::new();

        for spec in specs {
            match expressions::resolve_value(&spec.value, self) {
                Ok(value) => {
                    self.outputs.insert(spec.name.clone(), value);
                }
                Err(e) => errors.push(OutputResolutionError {
                    output: spec.name.clone(),
                    message: e.to_string(),
                }),
            }
        }

        if errors.is_empty() {
            Ok(&self.outputs)
        } else {
            Err(errors)
        }
    }

    pub fn set_output(&mut self, name: &str, value: Value) {
        self.outputs.insert(name.to_string(), value);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Look up a dotted path such as `steps.create.branch`
    ///
    /// The first segment selects a namespace. Any other first segment is
    /// looked up among the ambient variables, so loop bindings can be read as
    /// `${item}`. Remaining segments walk mappings by key and lists by index.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        match head {
            "inputs" => walk_map(&self.inputs, &rest),
            "outputs" => walk_map(&self.outputs, &rest),
            "steps" => {
                let (step_id, tail) = rest.split_first()?;
                let outputs = self.steps.get(*step_id)?;
                walk_map(outputs, tail)
            }
            "context" => {
                let (name, tail) = rest.split_first()?;
                let root = self.ambient(name)?;
                walk(&root, tail)
            }
            name => {
                let root = self.variables.get(name)?;
                walk(root, &rest)
            }
        }
    }

    fn ambient(&self, name: &str) -> Option<Value> {
        let builtin = match name {
            "workflow_id" => Some(Value::String(self.workflow_id.clone())),
            "run_id" => Some(Value::String(self.run_id.clone())),
            "execution_id" => Some(Value::String(self.execution_id.clone())),
            "start_time" => Some(Value::String(self.started_at.to_rfc3339())),
            "timestamp" => Some(Value::String(Utc::now().to_rfc3339())),
            "parent" => self
                .parent
                .as_ref()
                .and_then(|p| serde_json::to_value(p).ok()),
            _ => None,
        };
        builtin.or_else(|| self.variables.get(name).cloned())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            status: self.status,
            started_at: self.started_at,
            inputs: self.inputs.clone(),
            steps: self.steps.clone(),
            outputs: self.outputs.clone(),
            variables: self.variables.clone(),
            parent: self.parent.clone(),
            history: self.history.clone(),
        }
    }
}

fn walk_map(map: &Map<String, Value>, segments: &[&str]) -> Option<Value> {
    match segments.split_first() {
        None => Some(Value::Object(map.clone())),
        Some((key, tail)) => walk(map.get(*key)?, tail),
    }
}

fn walk(value: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
