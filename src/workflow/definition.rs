//! Workflow, Step, and input/output declarations
//!
//! A `WorkflowDefinition` is built once by the loader and never mutated
//! afterwards. Executions share it read-only; all run state lives in the
//! `ExecutionContext`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::action::{ActionKind, GitOperation, TrackerOperation};
use super::duration::{StepDuration, WaitUnit};

// ============================================================================
// Workflow
// ============================================================================

/// A complete, validated workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Document schema version (only version 1 exists)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    pub metadata: WorkflowMetadata,

    #[serde(default)]
    pub inputs: Vec<InputSpec>,

    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub outputs: Vec<OutputSpec>,

    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,

    #[serde(default)]
    pub error_handling: ErrorHandling,
}

impl WorkflowDefinition {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Look up a step at any nesting depth
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.all_steps().into_iter().find(|s| s.id == id)
    }

    /// Every step in the definition, depth first in declaration order
    pub fn all_steps(&self) -> Vec<&Step> {
        fn walk<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
            for step in steps {
                out.push(step);
                for nested in step.nested_step_lists() {
                    walk(nested, out);
                }
            }
        }

        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }

    /// Ids of workflows invoked through `execute-workflow` with a literal id
    pub fn workflow_references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .all_steps()
            .into_iter()
            .filter_map(|step| match &step.action {
                StepAction::ExecuteWorkflow { workflow, .. } if !workflow.contains("${") => {
                    Some(workflow.clone())
                }
                _ => None,
            })
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

/// Identity and descriptive metadata of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// Workflow category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Master,
    Core,
    Support,
    Utility,
}

impl WorkflowType {
    pub const NAMES: [&'static str; 4] = ["master", "core", "support", "utility"];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Master => "master",
            WorkflowType::Core => "core",
            WorkflowType::Support => "support",
            WorkflowType::Utility => "utility",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(WorkflowType::Master),
            "core" => Ok(WorkflowType::Core),
            "support" => Ok(WorkflowType::Support),
            "utility" => Ok(WorkflowType::Utility),
            other => Err(format!(
                "unknown workflow type '{}', expected one of {}",
                other,
                WorkflowType::NAMES.join(", ")
            )),
        }
    }
}

// ============================================================================
// Inputs, prerequisites, outputs
// ============================================================================

/// Declared input of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub input_type: InputType,

    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Allowed values for enum inputs
    #[serde(
        default,
        rename = "values",
        alias = "allowedValues",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_values: Option<Vec<Value>>,

    /// Regex that string inputs must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Enum,
}

impl InputType {
    pub const NAMES: [&'static str; 4] = ["string", "number", "boolean", "enum"];
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A precondition checked before any step runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prerequisite {
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,

    #[serde(default = "default_true")]
    pub required: bool,
}

/// A workflow output computed from the final context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,

    #[serde(alias = "valueExpression")]
    pub value: Value,

    #[serde(default)]
    pub description: String,
}

/// Advisory success criterion, either plain text or text plus a check
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessCriterion {
    pub description: String,
    pub check: Option<String>,
}

impl Serialize for SuccessCriterion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        match &self.check {
            None => serializer.serialize_str(&self.description),
            Some(check) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("description", &self.description)?;
                map.serialize_entry("check", check)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for SuccessCriterion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum CriterionHelper {
            Text(String),
            Full {
                description: String,
                #[serde(default)]
                check: Option<String>,
            },
        }

        match CriterionHelper::deserialize(deserializer)? {
            CriterionHelper::Text(description) => Ok(SuccessCriterion {
                description,
                check: None,
            }),
            CriterionHelper::Full { description, check } => {
                Ok(SuccessCriterion { description, check })
            }
        }
    }
}

// ============================================================================
// Error handling
// ============================================================================

/// Workflow-level failure policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    #[serde(default)]
    pub strategy: ErrorStrategy,

    /// Recipients told about a failed run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,

    /// Resolve unresolvable outputs to null instead of reporting them
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_missing_outputs: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    #[default]
    FailFast,
    ContinueOnError,
    Rollback,
}

impl ErrorStrategy {
    pub const NAMES: [&'static str; 3] = ["fail-fast", "continue-on-error", "rollback"];
}

/// Step-level failure policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnError {
    pub strategy: OnErrorStrategy,
    pub retries: u32,
    pub delay: StepDuration,
    /// Compensating steps run when the workflow rolls back
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rollback: Vec<Step>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorStrategy {
    /// Defer to the workflow's error handling strategy
    #[default]
    Fail,
    Continue,
    Retry,
}

impl OnErrorStrategy {
    pub const NAMES: [&'static str; 3] = ["fail", "continue", "retry"];
}

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

impl OnError {
    fn with_strategy(strategy: OnErrorStrategy) -> Self {
        Self {
            strategy,
            retries: if strategy == OnErrorStrategy::Retry {
                DEFAULT_RETRIES
            } else {
                0
            },
            delay: StepDuration(std::time::Duration::from_millis(DEFAULT_RETRY_DELAY_MS)),
            rollback: Vec::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        *self == OnError::default()
    }

    /// Total attempts allowed for the step
    pub fn max_attempts(&self) -> u32 {
        match self.strategy {
            OnErrorStrategy::Retry => self.retries + 1,
            _ => 1,
        }
    }
}

impl Default for OnError {
    fn default() -> Self {
        Self::with_strategy(OnErrorStrategy::Fail)
    }
}

impl<'de> Deserialize<'de> for OnError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OnErrorHelper {
            Strategy(OnErrorStrategy),
            Full {
                #[serde(default)]
                strategy: OnErrorStrategy,
                #[serde(default)]
                retries: Option<u32>,
                #[serde(default)]
                delay: Option<StepDuration>,
                #[serde(default)]
                rollback: Vec<Step>,
            },
        }

        match OnErrorHelper::deserialize(deserializer)? {
            OnErrorHelper::Strategy(strategy) => Ok(OnError::with_strategy(strategy)),
            OnErrorHelper::Full {
                strategy,
                retries,
                delay,
                rollback,
            } => {
                let base = OnError::with_strategy(strategy);
                Ok(OnError {
                    strategy,
                    retries: retries.unwrap_or(base.retries),
                    delay: delay.unwrap_or(base.delay),
                    rollback,
                })
            }
        }
    }
}

// ============================================================================
// Step
// ============================================================================

/// A single unit of work inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique id; outputs are namespaced under it
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(flatten)]
    pub action: StepAction,

    /// Output names this step is allowed to record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    /// Guard for ordinary steps; the branch/loop condition for
    /// `conditional` and `while-loop`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Timeout for external actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StepDuration>,

    #[serde(default, skip_serializing_if = "OnError::is_default")]
    pub on_error: OnError,
}

impl Step {
    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Nested step lists owned by this step, including rollback steps
    pub fn nested_step_lists(&self) -> Vec<&[Step]> {
        let mut lists: Vec<&[Step]> = match &self.action {
            StepAction::Conditional { then, otherwise } => vec![then, otherwise],
            StepAction::WhileLoop { steps, .. } | StepAction::ForLoop { steps, .. } => {
                vec![steps]
            }
            StepAction::Parallel { branches, .. } => vec![branches],
            _ => Vec::new(),
        };
        if !self.on_error.rollback.is_empty() {
            lists.push(&self.on_error.rollback);
        }
        lists
    }
}

/// Action-specific shape of a step, tagged by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum StepAction {
    ExecuteWorkflow {
        workflow: String,
        #[serde(default)]
        inputs: Map<String, Value>,
    },
    ShellCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        env: Map<String, Value>,
        #[serde(default, rename = "workingDir", skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
    GitOperation {
        operation: GitOperation,
        #[serde(default)]
        inputs: Map<String, Value>,
    },
    AzureDevops {
        operation: TrackerOperation,
        #[serde(default)]
        inputs: Map<String, Value>,
    },
    Conditional {
        #[serde(alias = "steps")]
        then: Vec<Step>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<Step>,
    },
    WhileLoop {
        steps: Vec<Step>,
        #[serde(default, rename = "maxIterations", skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    ForLoop {
        items: Value,
        steps: Vec<Step>,
    },
    Parallel {
        #[serde(alias = "steps")]
        branches: Vec<Step>,
        #[serde(default = "default_true", rename = "failFast")]
        fail_fast: bool,
    },
    SetVariable {
        variable: String,
        value: Value,
    },
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    Wait {
        duration: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<WaitUnit>,
    },
}

impl StepAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            StepAction::ExecuteWorkflow { .. } => ActionKind::ExecuteWorkflow,
            StepAction::ShellCommand { .. } => ActionKind::ShellCommand,
            StepAction::GitOperation { .. } => ActionKind::GitOperation,
            StepAction::AzureDevops { .. } => ActionKind::AzureDevops,
            StepAction::Conditional { .. } => ActionKind::Conditional,
            StepAction::WhileLoop { .. } => ActionKind::WhileLoop,
            StepAction::ForLoop { .. } => ActionKind::ForLoop,
            StepAction::Parallel { .. } => ActionKind::Parallel,
            StepAction::SetVariable { .. } => ActionKind::SetVariable,
            StepAction::Log { .. } => ActionKind::Log,
            StepAction::Wait { .. } => ActionKind::Wait,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    pub const NAMES: [&'static str; 6] = ["trace", "debug", "info", "warn", "warning", "error"];
}

fn default_true() -> bool {
    true
}

/// Accept `version: 1.2` as well as `version: "1.2"`
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a version string, got {}",
            other
        ))),
    }
}
