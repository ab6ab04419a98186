//! Workflow types and definitions
//!
//! This module contains everything on the definition side of the engine:
//! - `definition` - WorkflowDefinition, Step, StepAction and declarations
//! - `action` - the closed ActionKind set and operation names
//! - `schema` - structural validation that reports every violation
//! - `loader` - load definitions from YAML/JSON documents
//! - `registry` - directory-backed index of definitions
//! - `context` - ExecutionContext for per-run state
//! - `expressions` - `${...}` resolution and condition evaluation
//! - `config` - EngineConfig loaded from engine.yaml

pub mod action;
pub mod config;
pub mod context;
pub mod definition;
pub mod duration;
pub mod expressions;
pub mod loader;
pub mod registry;
pub mod schema;

pub use action::{ActionKind, GitOperation, TrackerOperation};
pub use config::{AzureDevopsConfig, ConfigError, EngineConfig, GitConfig};
pub use context::{
    ContextSnapshot, ExecutionContext, HistoryEntry, OutputResolutionError, ParentRun, RunStatus,
    StepStatus,
};
pub use definition::{
    ErrorHandling, ErrorStrategy, InputSpec, InputType, LogLevel, OnError, OnErrorStrategy,
    OutputSpec, Prerequisite, Step, StepAction, SuccessCriterion, WorkflowDefinition,
    WorkflowMetadata, WorkflowType,
};
pub use duration::{parse_duration, StepDuration, WaitUnit};
pub use expressions::{evaluate_condition, resolve as resolve_expression, ExpressionError};
pub use loader::{DefinitionError, DocumentFormat, WorkflowLoader};
pub use registry::{
    RegistryError, RegistryStats, ScanReport, WorkflowFilter, WorkflowRegistry, WorkflowSummary,
};
pub use schema::SchemaViolation;
