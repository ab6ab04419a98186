//! Workflow execution engine module
//!
//! This module contains:
//! - `executor` - The step interpreter and run lifecycle
//! - `error` - Executor and step error types
//! - `result` - Run results and success-criteria reports
//! - `inputs` - Input validation and prerequisite checks
//! - `actions` - Shell, version-control and issue-tracker actions
//! - `sink` - Receivers for history entries as they are appended

pub mod actions;
pub mod error;
pub mod executor;
pub mod inputs;
pub mod result;
pub mod sink;

pub use error::{ActionFailure, ExecutorError, InputViolation, StepError, StepErrorKind};
pub use executor::{ActiveRun, Executor};
pub use result::{CriterionOutcome, CriterionReport, RunResult, RunSummary};
pub use sink::{CollectingSink, HistorySink, TracingSink};
