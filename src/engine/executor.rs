//! Workflow Executor - interprets workflow definitions step by step
//!
//! This is the main engine that:
//! 1. Validates inputs and prerequisites
//! 2. Executes steps in declared order, following control-flow actions
//! 3. Applies step retries and the workflow error strategy
//! 4. Computes declared outputs and the success-criteria report
//!
//! One `Executor` serves any number of concurrent runs. Each run owns its
//! `ExecutionContext`; the registry and definitions are shared read-only.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

use crate::bridge::{
    AzureDevopsClient, GitCli, InMemoryTracker, InMemoryVcs, IssueTracker, VersionControl,
};
use crate::engine::actions::git::execute_git_operation;
use crate::engine::actions::shell::{execute_shell_command, ShellInvocation};
use crate::engine::actions::tracker::execute_tracker_operation;
use crate::engine::error::{ActionFailure, ExecutorError, StepError, StepErrorKind};
use crate::engine::inputs::{check_prerequisites, validate_inputs};
use crate::engine::result::{CriterionOutcome, CriterionReport, RunResult};
use crate::engine::sink::HistorySink;
use crate::workflow::duration::{scaled_duration, WaitUnit};
use crate::workflow::expressions::{
    evaluate_condition, resolve, resolve_map, resolve_string, resolve_value, stringify,
};
use crate::workflow::*;

/// A run currently in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRun {
    pub run_id: String,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

struct ActiveEntry {
    run: ActiveRun,
    token: CancellationToken,
}

type ActiveRuns = Arc<Mutex<HashMap<String, ActiveEntry>>>;

/// Removes a run from the active set when the run ends
struct ActiveGuard {
    runs: ActiveRuns,
    run_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}

/// Settings shared by the steps of one block
#[derive(Clone)]
struct Scope {
    token: CancellationToken,
    depth: usize,
    strategy: ErrorStrategy,
    /// Entries of a top-level block go straight into the run history
    top_level: bool,
}

impl Scope {
    fn nested(&self) -> Self {
        Self {
            top_level: false,
            ..self.clone()
        }
    }
}

/// Result of running a list of steps
#[derive(Default)]
struct BlockOutcome {
    /// Entries of a nested block; empty for top-level blocks
    entries: Vec<HistoryEntry>,
    error: Option<StepError>,
    /// Failures tolerated by `continue` semantics
    tolerated: usize,
    /// Ids of completed steps, in completion order
    completed: Vec<String>,
}

impl BlockOutcome {
    fn absorb(&mut self, other: BlockOutcome) {
        self.entries.extend(other.entries);
        self.tolerated += other.tolerated;
        self.completed.extend(other.completed);
        self.error = other.error;
    }
}

/// Result of one step, every attempt included
struct StepOutcome {
    entries: Vec<HistoryEntry>,
    result: Result<(), StepError>,
    tolerated: usize,
    completed: Vec<String>,
}

impl StepOutcome {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            result: Ok(()),
            tolerated: 0,
            completed: Vec::new(),
        }
    }
}

/// Result of one attempt of a step's action
struct Attempt {
    result: Result<Map<String, Value>, ActionFailure>,
    nested: Vec<HistoryEntry>,
    message: Option<String>,
    tolerated: usize,
    completed: Vec<String>,
}

impl Attempt {
    fn done(result: Result<Map<String, Value>, ActionFailure>) -> Self {
        Self {
            result,
            nested: Vec::new(),
            message: None,
            tolerated: 0,
            completed: Vec::new(),
        }
    }

    fn failed(failure: ActionFailure) -> Self {
        Self::done(Err(failure))
    }

    /// Attempt of a control-flow step whose body ran as `block`
    fn from_block(block: BlockOutcome, outputs: Map<String, Value>) -> Self {
        let result = match &block.error {
            Some(inner) => Err(ActionFailure::nested(inner)),
            None => Ok(outputs),
        };
        Self {
            result,
            nested: block.entries,
            message: None,
            tolerated: block.tolerated,
            completed: block.completed,
        }
    }

    fn failed_after(block: BlockOutcome, failure: ActionFailure) -> Self {
        let mut attempt = Self::from_block(block, Map::new());
        attempt.result = Err(failure);
        attempt
    }
}

fn tolerates(step: &Step, scope: &Scope) -> bool {
    step.on_error.strategy == OnErrorStrategy::Continue
        || scope.strategy == ErrorStrategy::ContinueOnError
}

/// Wait for `duration`; false when the token fired first
async fn pause(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}

/// The workflow executor
#[derive(Clone)]
pub struct Executor {
    registry: Arc<WorkflowRegistry>,
    vcs: Arc<dyn VersionControl>,
    tracker: Arc<dyn IssueTracker>,
    config: Arc<EngineConfig>,
    sink: Option<Arc<dyn HistorySink>>,
    active: ActiveRuns,
}

impl Executor {
    /// Executor with default configuration and in-memory collaborators
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            registry,
            vcs: Arc::new(InMemoryVcs::new()),
            tracker: Arc::new(InMemoryTracker::new()),
            config: Arc::new(EngineConfig::default()),
            sink: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Executor wired from `engine.yaml`: the git CLI and Azure DevOps
    /// collaborators are used when configured, in-memory ones otherwise
    pub fn from_config(
        registry: Arc<WorkflowRegistry>,
        config: EngineConfig,
    ) -> Result<Self, ExecutorError> {
        let mut executor = Self::new(registry);

        if let Some(git) = &config.git {
            info!("Using git CLI collaborator");
            executor.vcs = Arc::new(GitCli::from_config(git)?);
        }
        if let Some(azure) = &config.azure_devops {
            info!("Using Azure DevOps collaborator ({})", azure.organization_url);
            executor.tracker = Arc::new(AzureDevopsClient::new(azure)?);
        }

        executor.config = Arc::new(config);
        Ok(executor)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Run a registered workflow to completion
    #[instrument(skip(self, inputs))]
    pub async fn run(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<RunResult, ExecutorError> {
        self.run_with_cancel(workflow_id, inputs, CancellationToken::new())
            .await
    }

    /// Run a registered workflow; cancelling `token` stops it at the next
    /// step boundary
    #[instrument(skip(self, inputs, token))]
    pub async fn run_with_cancel(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
        token: CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        let definition = self.registry.get(workflow_id)?;
        self.run_internal(definition, inputs, None, token, 0).await
    }

    /// Run a definition that need not be registered; nested
    /// `execute-workflow` steps still resolve through the registry
    pub async fn run_definition(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
        token: CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        self.run_internal(definition, inputs, None, token, 0).await
    }

    /// Runs in flight, oldest first
    pub fn active_runs(&self) -> Vec<ActiveRun> {
        let runs = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<ActiveRun> = runs.values().map(|e| e.run.clone()).collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Request cancellation of a run; false when no such run is active
    pub fn cancel(&self, run_id: &str) -> bool {
        let runs = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match runs.get(run_id) {
            Some(entry) => {
                info!("Cancelling run {} ({})", run_id, entry.run.workflow_id);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    fn track(&self, ctx: &ExecutionContext, token: CancellationToken) -> ActiveGuard {
        let run = ActiveRun {
            run_id: ctx.run_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            started_at: ctx.started_at,
            parent_run_id: ctx.parent.as_ref().map(|p| p.run_id.clone()),
        };
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.run_id.clone(), ActiveEntry { run, token });
        ActiveGuard {
            runs: self.active.clone(),
            run_id: ctx.run_id.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(workflow_id = %definition.id(), depth = depth))]
    async fn run_internal(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
        parent: Option<&ExecutionContext>,
        token: CancellationToken,
        depth: usize,
    ) -> Result<RunResult, ExecutorError> {
        let workflow_id = definition.id().to_string();
        let mut ctx = match parent {
            Some(parent) => parent.child(&workflow_id),
            None => ExecutionContext::new(&workflow_id),
        };

        ctx.status = RunStatus::Validating;
        let inputs = validate_inputs(&definition, &inputs)?;
        ctx.set_inputs(inputs);
        check_prerequisites(&definition, &ctx)?;

        let _guard = self.track(&ctx, token.clone());
        ctx.status = RunStatus::Running;
        info!(
            run_id = %ctx.run_id,
            "Starting workflow '{}' v{} ({} steps)",
            workflow_id,
            definition.metadata.version,
            definition.steps.len()
        );

        let scope = Scope {
            token,
            depth,
            strategy: definition.error_handling.strategy,
            top_level: true,
        };
        let block = self.run_block(&definition.steps, &mut ctx, &scope).await;

        let mut status = match &block.error {
            Some(e) if e.is_cancelled() => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
            None if block.tolerated > 0 => RunStatus::PartiallySucceeded,
            None => RunStatus::Succeeded,
        };

        if status == RunStatus::Failed && scope.strategy == ErrorStrategy::Rollback {
            self.roll_back(&definition, &block.completed, &mut ctx, depth)
                .await;
        }

        let output_errors = self.compute_outputs(&definition, &mut ctx);
        if status == RunStatus::Succeeded && !output_errors.is_empty() {
            for e in &output_errors {
                warn!("{}", e);
            }
            status = RunStatus::PartiallySucceeded;
        }

        let criteria = evaluate_criteria(&definition, &ctx);

        if status == RunStatus::Failed && !definition.error_handling.notify.is_empty() {
            warn!(
                "Workflow '{}' failed; notifying {}",
                workflow_id,
                definition.error_handling.notify.join(", ")
            );
        }

        ctx.status = status;
        match &block.error {
            Some(e) => error!(run_id = %ctx.run_id, "Workflow '{}' {}: {}", workflow_id, status, e),
            None => info!(run_id = %ctx.run_id, "Workflow '{}' {}", workflow_id, status),
        }

        Ok(RunResult {
            run_id: ctx.run_id.clone(),
            workflow_id,
            execution_id: ctx.execution_id.clone(),
            status,
            outputs: ctx.outputs().clone(),
            output_errors,
            criteria,
            history: ctx.take_history(),
            error: block.error,
            started_at: ctx.started_at,
            ended_at: Utc::now(),
        })
    }

    /// Run the compensating steps of completed steps, newest first
    async fn roll_back(
        &self,
        definition: &WorkflowDefinition,
        completed: &[String],
        ctx: &mut ExecutionContext,
        depth: usize,
    ) {
        let scope = Scope {
            token: CancellationToken::new(),
            depth,
            strategy: ErrorStrategy::ContinueOnError,
            top_level: true,
        };

        for step_id in completed.iter().rev() {
            let Some(step) = definition.find_step(step_id) else {
                continue;
            };
            if step.on_error.rollback.is_empty() {
                continue;
            }
            info!("Rolling back step '{}'", step_id);
            let block = self.run_block(&step.on_error.rollback, ctx, &scope).await;
            if block.tolerated > 0 {
                warn!(
                    "Rollback of '{}' had {} failed step(s)",
                    step_id, block.tolerated
                );
            }
        }
    }

    fn compute_outputs(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
    ) -> Vec<OutputResolutionError> {
        match ctx.compute_outputs(&definition.outputs) {
            Ok(_) => Vec::new(),
            Err(errors) if definition.error_handling.allow_missing_outputs => {
                for e in &errors {
                    debug!("Output '{}' unresolved, using null", e.output);
                    ctx.set_output(&e.output, Value::Null);
                }
                Vec::new()
            }
            Err(errors) => errors,
        }
    }

    // ------------------------------------------------------------------
    // Step interpreter
    // ------------------------------------------------------------------

    fn run_block<'a>(
        &'a self,
        steps: &'a [Step],
        ctx: &'a mut ExecutionContext,
        scope: &'a Scope,
    ) -> BoxFuture<'a, BlockOutcome> {
        async move {
            let mut block = BlockOutcome::default();

            for step in steps {
                if scope.token.is_cancelled() {
                    info!("Run {} cancelled before step '{}'", ctx.run_id, step.id);
                    block.error = Some(StepError::cancelled(step));
                    break;
                }

                let outcome = self.execute_step(step, ctx, scope).await;
                block.tolerated += outcome.tolerated;
                block.completed.extend(outcome.completed);
                for entry in outcome.entries {
                    if scope.top_level {
                        // Nested runs reach the sink inside their parent's entry
                        if let (Some(sink), None) = (&self.sink, &ctx.parent) {
                            sink.record(&ctx.run_id, &ctx.workflow_id, &entry);
                        }
                        ctx.append_history(entry);
                    } else {
                        block.entries.push(entry);
                    }
                }

                match outcome.result {
                    Ok(()) => {}
                    Err(err) if !err.is_cancelled() && tolerates(step, scope) => {
                        warn!("Continuing after failed step '{}': {}", step.id, err.message);
                        block.tolerated += 1;
                    }
                    Err(err) => {
                        block.error = Some(err);
                        break;
                    }
                }
            }

            block
        }
        .boxed()
    }

    fn execute_step<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a mut ExecutionContext,
        scope: &'a Scope,
    ) -> BoxFuture<'a, StepOutcome> {
        let span = info_span!("step", step_id = %step.id, action = %step.kind());
        async move {
            let mut outcome = StepOutcome::new();

            // conditional and while-loop consume the condition themselves
            let guarded = !matches!(
                step.action,
                StepAction::Conditional { .. } | StepAction::WhileLoop { .. }
            );
            if let (true, Some(condition)) = (guarded, &step.condition) {
                let started_at = Utc::now();
                match evaluate_condition(condition, ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Skipping step '{}': condition is false", step.id);
                        outcome
                            .entries
                            .push(HistoryEntry::skipped(&step.id, step.kind()));
                        return outcome;
                    }
                    Err(e) => {
                        let err = StepError::new(step, e.into());
                        error!("{}", err);
                        outcome.entries.push(failed_entry(step, 1, started_at, err.clone()));
                        outcome.result = Err(err);
                        return outcome;
                    }
                }
            }

            let max_attempts = step.on_error.max_attempts();
            for attempt in 1..=max_attempts {
                if attempt == 1 {
                    info!("Executing step '{}' ({})", step.display_name(), step.kind());
                } else {
                    info!(
                        "Executing step '{}' (attempt {}/{})",
                        step.display_name(),
                        attempt,
                        max_attempts
                    );
                }

                let started_at = Utc::now();
                let Attempt {
                    result,
                    nested,
                    message,
                    tolerated,
                    completed,
                } = self.dispatch(step, ctx, scope).await;
                outcome.tolerated += tolerated;
                outcome.completed.extend(completed);

                match result.and_then(|produced| declared_outputs(step, produced)) {
                    Ok(outputs) => {
                        ctx.record_step_output(&step.id, outputs);
                        outcome.entries.push(HistoryEntry {
                            step_id: step.id.clone(),
                            action: step.kind(),
                            status: StepStatus::Succeeded,
                            attempt,
                            started_at,
                            ended_at: Utc::now(),
                            message,
                            error: None,
                            nested,
                        });
                        outcome.completed.push(step.id.clone());
                        outcome.result = Ok(());
                        return outcome;
                    }
                    Err(failure) => {
                        let err = StepError::new(step, failure);
                        error!("{} (attempt {}/{})", err, attempt, max_attempts);

                        let mut entry = failed_entry(step, attempt, started_at, err.clone());
                        entry.message = message;
                        entry.nested = nested;
                        outcome.entries.push(entry);

                        let retry = attempt < max_attempts && !err.is_cancelled();
                        outcome.result = Err(err);
                        if !retry {
                            return outcome;
                        }

                        let delay = step.on_error.delay.as_duration();
                        warn!("Retrying step '{}' in {}", step.id, step.on_error.delay);
                        if !pause(delay, &scope.token).await {
                            outcome.result = Err(StepError::cancelled(step));
                            return outcome;
                        }
                    }
                }
            }

            outcome
        }
        .instrument(span)
        .boxed()
    }

    async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        scope: &Scope,
    ) -> Attempt {
        match &step.action {
            StepAction::ExecuteWorkflow { workflow, inputs } => {
                self.execute_workflow(workflow, inputs, ctx, scope).await
            }
            StepAction::ShellCommand {
                command,
                env,
                working_dir,
            } => {
                let invocation = match shell_invocation(command, env, working_dir.as_deref(), ctx) {
                    Ok(invocation) => invocation,
                    Err(failure) => return Attempt::failed(failure),
                };
                Attempt::done(
                    self.with_timeout(step, execute_shell_command(&invocation))
                        .await,
                )
            }
            StepAction::GitOperation { operation, inputs } => {
                let inputs = match resolve_map(inputs, ctx) {
                    Ok(inputs) => inputs,
                    Err(e) => return Attempt::failed(e.into()),
                };
                debug!(inputs = ?inputs, "Resolved inputs for '{}'", step.id);
                Attempt::done(
                    self.with_timeout(
                        step,
                        execute_git_operation(self.vcs.as_ref(), *operation, &inputs),
                    )
                    .await,
                )
            }
            StepAction::AzureDevops { operation, inputs } => {
                let inputs = match resolve_map(inputs, ctx) {
                    Ok(inputs) => inputs,
                    Err(e) => return Attempt::failed(e.into()),
                };
                debug!(inputs = ?inputs, "Resolved inputs for '{}'", step.id);
                Attempt::done(
                    self.with_timeout(
                        step,
                        execute_tracker_operation(self.tracker.as_ref(), *operation, &inputs),
                    )
                    .await,
                )
            }
            StepAction::Conditional { then, otherwise } => {
                self.conditional(step, then, otherwise, ctx, scope).await
            }
            StepAction::WhileLoop {
                steps,
                max_iterations,
            } => self.while_loop(step, steps, *max_iterations, ctx, scope).await,
            StepAction::ForLoop { items, steps } => {
                self.for_loop(step, items, steps, ctx, scope).await
            }
            StepAction::Parallel {
                branches,
                fail_fast,
            } => self.parallel(step, branches, *fail_fast, ctx, scope).await,
            StepAction::SetVariable { variable, value } => {
                Attempt::done(set_variable(variable, value, ctx))
            }
            StepAction::Log { message, level } => log_message(step, message, *level, ctx),
            StepAction::Wait { duration, unit } => {
                Attempt::done(wait(duration, *unit, ctx, scope).await)
            }
        }
    }

    /// Bound an external action by the step timeout or the configured default
    async fn with_timeout<F>(&self, step: &Step, action: F) -> Result<Map<String, Value>, ActionFailure>
    where
        F: Future<Output = Result<Map<String, Value>, ActionFailure>>,
    {
        let limit = step
            .timeout
            .as_ref()
            .map(StepDuration::as_duration)
            .unwrap_or_else(|| self.config.default_step_timeout.as_duration());

        match tokio::time::timeout(limit, action).await {
            Ok(result) => result,
            Err(_) => Err(ActionFailure::new(
                StepErrorKind::Timeout,
                format!("timed out after {}", StepDuration(limit)),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    async fn execute_workflow(
        &self,
        workflow: &str,
        inputs: &Map<String, Value>,
        ctx: &ExecutionContext,
        scope: &Scope,
    ) -> Attempt {
        let workflow_id = match resolve_string(workflow, ctx) {
            Ok(id) => id,
            Err(e) => return Attempt::failed(e.into()),
        };
        let inputs = match resolve_map(inputs, ctx) {
            Ok(inputs) => inputs,
            Err(e) => return Attempt::failed(e.into()),
        };

        if scope.depth + 1 > self.config.max_nesting_depth {
            return Attempt::failed(ActionFailure::new(
                StepErrorKind::Nested,
                format!(
                    "nesting depth limit {} exceeded invoking '{}'",
                    self.config.max_nesting_depth, workflow_id
                ),
            ));
        }

        let definition = match self.registry.get(&workflow_id) {
            Ok(definition) => definition,
            Err(_) => {
                return Attempt::failed(ActionFailure::new(
                    StepErrorKind::WorkflowNotFound,
                    format!("workflow '{}' is not registered", workflow_id),
                ))
            }
        };

        info!("Invoking nested workflow '{}'", workflow_id);
        let run = self
            .run_internal(
                definition,
                inputs,
                Some(ctx),
                scope.token.child_token(),
                scope.depth + 1,
            )
            .await;

        let run = match run {
            Ok(run) => run,
            Err(e) => {
                return Attempt::failed(ActionFailure::new(StepErrorKind::Nested, e.to_string()))
            }
        };

        let failure = match run.status {
            RunStatus::Succeeded | RunStatus::PartiallySucceeded => None,
            RunStatus::Cancelled if scope.token.is_cancelled() => Some(ActionFailure::cancelled()),
            // Cancelled on its own run id; the parent carries on
            RunStatus::Cancelled => Some(ActionFailure::new(
                StepErrorKind::Nested,
                format!("workflow '{}' was cancelled", workflow_id),
            )),
            status => Some(ActionFailure::new(
                StepErrorKind::Nested,
                match &run.error {
                    Some(e) => format!("workflow '{}' {}: {}", workflow_id, status, e),
                    None => format!("workflow '{}' {}", workflow_id, status),
                },
            )),
        };

        Attempt {
            result: match failure {
                Some(failure) => Err(failure),
                None => Ok(run.outputs),
            },
            nested: run.history,
            message: None,
            tolerated: 0,
            completed: Vec::new(),
        }
    }

    async fn conditional(
        &self,
        step: &Step,
        then: &[Step],
        otherwise: &[Step],
        ctx: &mut ExecutionContext,
        scope: &Scope,
    ) -> Attempt {
        let Some(condition) = &step.condition else {
            return Attempt::failed(ActionFailure::invalid_input(
                "conditional requires a 'condition'",
            ));
        };
        let taken = match evaluate_condition(condition, ctx) {
            Ok(taken) => taken,
            Err(e) => return Attempt::failed(e.into()),
        };

        let (branch, untaken, label) = if taken {
            (then, otherwise, "then")
        } else {
            (otherwise, then, "else")
        };
        info!("Condition of '{}' is {}, taking {} branch", step.id, taken, label);

        let mut block = self.run_block(branch, ctx, &scope.nested()).await;
        block
            .entries
            .extend(untaken.iter().map(|s| HistoryEntry::skipped(&s.id, s.kind())));

        let mut outputs = Map::new();
        outputs.insert("branch".to_string(), Value::from(label));
        outputs.insert("condition".to_string(), Value::Bool(taken));
        Attempt::from_block(block, outputs)
    }

    async fn while_loop(
        &self,
        step: &Step,
        steps: &[Step],
        max_iterations: Option<u32>,
        ctx: &mut ExecutionContext,
        scope: &Scope,
    ) -> Attempt {
        let Some(condition) = &step.condition else {
            return Attempt::failed(ActionFailure::invalid_input(
                "while-loop requires a 'condition'",
            ));
        };
        let bound = max_iterations.unwrap_or(self.config.max_loop_iterations);
        let body_scope = scope.nested();
        let mut acc = BlockOutcome::default();
        let mut iterations: u32 = 0;

        loop {
            if scope.token.is_cancelled() {
                acc.error = Some(StepError::cancelled(step));
                break;
            }
            match evaluate_condition(condition, ctx) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Attempt::failed_after(acc, e.into()),
            }
            if iterations >= bound {
                return Attempt::failed_after(
                    acc,
                    ActionFailure::new(
                        StepErrorKind::LoopBound,
                        format!("while-loop exceeded {} iterations", bound),
                    ),
                );
            }

            trace!("while-loop '{}' iteration {}", step.id, iterations);
            let block = self.run_block(steps, ctx, &body_scope).await;
            iterations += 1;
            acc.absorb(block);
            if acc.error.is_some() {
                break;
            }
        }

        let mut outputs = Map::new();
        outputs.insert("iterations".to_string(), Value::from(iterations));
        Attempt::from_block(acc, outputs)
    }

    async fn for_loop(
        &self,
        step: &Step,
        items: &Value,
        steps: &[Step],
        ctx: &mut ExecutionContext,
        scope: &Scope,
    ) -> Attempt {
        let items = match loop_items(items, ctx) {
            Ok(items) => items,
            Err(failure) => return Attempt::failed(failure),
        };

        let previous_item = ctx.variable("item").cloned();
        let previous_index = ctx.variable("index").cloned();
        let body_scope = scope.nested();
        let mut acc = BlockOutcome::default();
        let mut iterations = 0usize;

        for (index, item) in items.into_iter().enumerate() {
            if scope.token.is_cancelled() {
                acc.error = Some(StepError::cancelled(step));
                break;
            }
            ctx.set_variable("item", item);
            ctx.set_variable("index", Value::from(index));

            let block = self.run_block(steps, ctx, &body_scope).await;
            iterations += 1;
            acc.absorb(block);
            if acc.error.is_some() {
                break;
            }
        }

        restore_variable(ctx, "item", previous_item);
        restore_variable(ctx, "index", previous_index);

        let mut outputs = Map::new();
        outputs.insert("iterations".to_string(), Value::from(iterations));
        Attempt::from_block(acc, outputs)
    }

    async fn parallel(
        &self,
        step: &Step,
        branches: &[Step],
        fail_fast: bool,
        ctx: &mut ExecutionContext,
        scope: &Scope,
    ) -> Attempt {
        let token = scope.token.child_token();
        let branch_scope = Scope {
            token: token.clone(),
            top_level: false,
            ..scope.clone()
        };
        let mut forks: Vec<ExecutionContext> = branches.iter().map(|_| ctx.fork()).collect();

        info!("Running {} branches of '{}' in parallel", branches.len(), step.id);

        let outcomes = {
            let branch_scope = &branch_scope;
            let runs = branches
                .iter()
                .zip(forks.iter_mut())
                .map(|(branch, fork)| {
                    let token = token.clone();
                    async move {
                        let outcome = self.execute_step(branch, fork, branch_scope).await;
                        if let Err(err) = &outcome.result {
                            if fail_fast && !err.is_cancelled() && !tolerates(branch, branch_scope) {
                                warn!("Branch '{}' failed, cancelling its siblings", branch.id);
                                token.cancel();
                            }
                        }
                        outcome
                    }
                });
            join_all(runs).await
        };

        let mut acc = BlockOutcome::default();
        let mut outputs = Map::new();
        let mut failure: Option<StepError> = None;

        for ((branch, fork), outcome) in branches.iter().zip(&forks).zip(outcomes) {
            ctx.absorb_steps(fork);
            if let Some(branch_outputs) = fork.step_outputs(&branch.id) {
                outputs.insert(branch.id.clone(), Value::Object(branch_outputs.clone()));
            }
            acc.entries.extend(outcome.entries);
            acc.tolerated += outcome.tolerated;
            acc.completed.extend(outcome.completed);

            if let Err(err) = outcome.result {
                if !err.is_cancelled() && tolerates(branch, scope) {
                    acc.tolerated += 1;
                } else if failure.as_ref().map_or(true, |f| f.is_cancelled() && !err.is_cancelled()) {
                    failure = Some(err);
                }
            }
        }

        if scope.token.is_cancelled() && failure.is_none() {
            failure = Some(StepError::cancelled(step));
        }
        acc.error = failure;
        Attempt::from_block(acc, outputs)
    }
}

// ============================================================================
// Simple actions
// ============================================================================

fn shell_invocation(
    command: &str,
    env: &Map<String, Value>,
    working_dir: Option<&str>,
    ctx: &ExecutionContext,
) -> Result<ShellInvocation, ActionFailure> {
    let mut resolved_env = Vec::with_capacity(env.len());
    for (key, value) in env {
        resolved_env.push((key.clone(), stringify(&resolve_value(value, ctx)?)));
    }

    Ok(ShellInvocation {
        command: resolve_string(command, ctx)?,
        env: resolved_env,
        working_dir: working_dir.map(|d| resolve_string(d, ctx)).transpose()?,
    })
}

fn set_variable(
    variable: &str,
    value: &Value,
    ctx: &mut ExecutionContext,
) -> Result<Map<String, Value>, ActionFailure> {
    let value = resolve_value(value, ctx)?;
    debug!("Setting variable '{}' = {}", variable, value);
    ctx.set_variable(variable, value.clone());

    let mut outputs = Map::new();
    outputs.insert("variable".to_string(), Value::from(variable));
    outputs.insert("value".to_string(), value);
    Ok(outputs)
}

fn log_message(step: &Step, message: &str, level: LogLevel, ctx: &ExecutionContext) -> Attempt {
    let message = match resolve_string(message, ctx) {
        Ok(message) => message,
        Err(e) => return Attempt::failed(e.into()),
    };

    let run_id = ctx.run_id.as_str();
    let step_id = step.id.as_str();
    match level {
        LogLevel::Trace => trace!(run_id, step_id, "{}", message),
        LogLevel::Debug => debug!(run_id, step_id, "{}", message),
        LogLevel::Info => info!(run_id, step_id, "{}", message),
        LogLevel::Warn => warn!(run_id, step_id, "{}", message),
        LogLevel::Error => error!(run_id, step_id, "{}", message),
    }

    let mut attempt = Attempt::done(Ok(json_map(json!({ "message": message }))));
    attempt.message = Some(message);
    attempt
}

async fn wait(
    duration: &Value,
    unit: Option<WaitUnit>,
    ctx: &ExecutionContext,
    scope: &Scope,
) -> Result<Map<String, Value>, ActionFailure> {
    let resolved = resolve_value(duration, ctx)?;
    let duration = scaled_duration(&resolved, unit)
        .map_err(|e| ActionFailure::invalid_input(format!("invalid wait duration: {}", e)))?;

    debug!("Waiting {}", StepDuration(duration));
    if !pause(duration, &scope.token).await {
        return Err(ActionFailure::cancelled());
    }
    Ok(json_map(json!({ "waited_ms": duration.as_millis() as u64 })))
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Items of a for-loop: a literal list, or an expression yielding a list
/// (a JSON list held in a string is accepted too)
fn loop_items(items: &Value, ctx: &ExecutionContext) -> Result<Vec<Value>, ActionFailure> {
    let resolved = match items {
        Value::String(expr) => resolve(expr, ctx)?,
        other => resolve_value(other, ctx)?,
    };

    match resolved {
        Value::Array(items) => Ok(items),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(ActionFailure::invalid_input(format!(
                "for-loop items must be a list, got '{}'",
                text
            ))),
        },
        other => Err(ActionFailure::invalid_input(format!(
            "for-loop items must be a list, got {}",
            other
        ))),
    }
}

fn restore_variable(ctx: &mut ExecutionContext, name: &str, previous: Option<Value>) {
    match previous {
        Some(value) => ctx.set_variable(name, value),
        None => {
            ctx.remove_variable(name);
        }
    }
}

/// Filter an action's outputs down to what the step declares
fn declared_outputs(
    step: &Step,
    produced: Map<String, Value>,
) -> Result<Map<String, Value>, ActionFailure> {
    if step.outputs.is_empty() {
        return Ok(match step.kind() {
            ActionKind::Parallel | ActionKind::ExecuteWorkflow => produced,
            _ => Map::new(),
        });
    }

    let mut recorded = Map::new();
    for name in &step.outputs {
        match produced.get(name) {
            Some(value) => {
                recorded.insert(name.clone(), value.clone());
            }
            None => {
                let available: Vec<&str> = produced.keys().map(String::as_str).collect();
                return Err(ActionFailure::new(
                    StepErrorKind::MissingOutput,
                    format!(
                        "declared output '{}' was not produced (available: {})",
                        name,
                        available.join(", ")
                    ),
                ));
            }
        }
    }
    Ok(recorded)
}

fn failed_entry(step: &Step, attempt: u32, started_at: DateTime<Utc>, error: StepError) -> HistoryEntry {
    HistoryEntry {
        step_id: step.id.clone(),
        action: step.kind(),
        status: StepStatus::Failed,
        attempt,
        started_at,
        ended_at: Utc::now(),
        message: None,
        error: Some(error),
        nested: Vec::new(),
    }
}

fn evaluate_criteria(definition: &WorkflowDefinition, ctx: &ExecutionContext) -> Vec<CriterionReport> {
    definition
        .success_criteria
        .iter()
        .map(|criterion| {
            let outcome = match &criterion.check {
                None => CriterionOutcome::Unchecked,
                Some(check) => match evaluate_condition(check, ctx) {
                    Ok(true) => CriterionOutcome::Passed,
                    Ok(false) => CriterionOutcome::Failed,
                    Err(e) => CriterionOutcome::Error(e.to_string()),
                },
            };
            CriterionReport {
                description: criterion.description.clone(),
                check: criterion.check.clone(),
                outcome,
            }
        })
        .collect()
}
