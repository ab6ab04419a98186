//! # Persona Workflows
//!
//! A declarative YAML workflow engine for persona-driven DevOps automation:
//! branch creation, commits, merges, work-item bookkeeping and shell steps,
//! composed with conditionals, loops and parallel branches.
//!
//! ## Features
//!
//! - **Declarative workflows** - YAML or JSON documents validated up front
//! - **Expressions** - `${inputs.X}`, `${steps.ID.OUT}`, `${context.run_id}`
//!   and conditions such as `${inputs.ENV} eq prod and ${steps.check.count} gt 0`
//! - **Control flow** - `conditional`, `while-loop`, `for-loop`, `parallel`
//! - **Composition** - `execute-workflow` runs registered workflows as steps
//! - **Failure policy** - retries, continue-on-error and rollback
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use persona_workflows::{Executor, WorkflowRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(WorkflowRegistry::new("workflows"));
//!     registry.scan()?;
//!
//!     let executor = Executor::new(registry);
//!     let mut inputs = serde_json::Map::new();
//!     inputs.insert("WORK_ITEM_ID".into(), "WI-42".into());
//!
//!     let result = executor.run("branch-creation", inputs).await?;
//!     println!("{}: {}", result.workflow_id, result.status);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod engine;
pub mod workflow;

// Re-export main types
pub use bridge::{
    AzureDevopsClient, BridgeError, GitCli, InMemoryTracker, InMemoryVcs, IssueTracker,
    VersionControl,
};
pub use engine::{
    ActiveRun, CollectingSink, CriterionOutcome, CriterionReport, Executor, ExecutorError,
    HistorySink, RunResult, RunSummary, StepError, StepErrorKind, TracingSink,
};
pub use workflow::{
    ActionKind, DefinitionError, EngineConfig, ExecutionContext, HistoryEntry, RegistryError,
    RunStatus, Step, StepAction, StepStatus, WorkflowDefinition, WorkflowFilter, WorkflowLoader,
    WorkflowRegistry, WorkflowSummary, WorkflowType,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{IssueTracker, VersionControl};
    pub use crate::engine::{Executor, ExecutorError, RunResult};
    pub use crate::workflow::{
        EngineConfig, RunStatus, WorkflowDefinition, WorkflowFilter, WorkflowLoader,
        WorkflowRegistry,
    };
}
