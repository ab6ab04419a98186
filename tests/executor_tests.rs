mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use persona_workflows::bridge::WorkItemDraft;
use persona_workflows::prelude::*;
use persona_workflows::workflow::{GitOperation, StepDuration, TrackerOperation};
use persona_workflows::{
    CollectingSink, CriterionOutcome, InMemoryTracker, InMemoryVcs, StepErrorKind, StepStatus,
};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    executor: Executor,
    vcs: Arc<InMemoryVcs>,
    tracker: Arc<InMemoryTracker>,
}

fn harness(docs: &[&str]) -> Harness {
    let vcs = Arc::new(InMemoryVcs::new());
    let tracker = Arc::new(InMemoryTracker::new());
    let executor = Executor::new(registry_of(docs))
        .with_vcs(vcs.clone())
        .with_tracker(tracker.clone());
    Harness {
        executor,
        vcs,
        tracker,
    }
}

fn step_ids(result: &RunResult) -> Vec<&str> {
    result.history.iter().map(|e| e.step_id.as_str()).collect()
}

const BRANCH_CREATION: &str = r#"
metadata:
  id: branch-creation
  name: Branch Creation
  version: "1.0.0"
  type: core
  tags: [git]
inputs:
  - name: WORK_ITEM_ID
    type: string
    pattern: "^WI-[0-9]+$"
  - name: REPO
    type: string
    default: api
steps:
  - id: name
    action: set-variable
    variable: branch
    value: feature/${inputs.WORK_ITEM_ID}
  - id: branch
    action: git-operation
    operation: create-branch
    inputs:
      repository: ${inputs.REPO}
      branch: ${context.branch}
      base: main
    outputs: [branch, base]
  - id: commit
    action: git-operation
    operation: commit
    inputs:
      repository: ${inputs.REPO}
      message: "${inputs.WORK_ITEM_ID}: scaffold"
    outputs: [sha]
  - id: announce
    action: log
    message: Created ${steps.branch.branch} at ${steps.commit.sha}
outputs:
  - name: BRANCH
    value: ${steps.branch.branch}
  - name: COMMIT
    value: ${steps.commit.sha}
successCriteria:
  - Branch follows naming convention
  - description: Branch cut from main
    check: "${steps.branch.base} eq main"
  - description: Commit recorded
    check: "${outputs.COMMIT} eq ''"
"#;

// ============================================================================
// Inputs and expressions
// ============================================================================

#[tokio::test]
async fn test_steps_run_in_order_with_resolved_expressions() {
    let h = harness(&[BRANCH_CREATION]);

    let result = h
        .executor
        .run("branch-creation", inputs(json!({"WORK_ITEM_ID": "WI-42"})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(step_ids(&result), vec!["name", "branch", "commit", "announce"]);
    assert!(result.history.iter().all(|e| e.status == StepStatus::Succeeded));
    for pair in result.history.windows(2) {
        assert!(pair[0].started_at <= pair[1].started_at);
        assert!(pair[0].ended_at <= pair[1].started_at);
    }

    let sha = format!("{:040x}", 1);
    assert_eq!(result.outputs["BRANCH"], "feature/WI-42");
    assert_eq!(result.outputs["COMMIT"], json!(sha));
    assert_eq!(
        result.history[3].message.as_deref(),
        Some(format!("Created feature/WI-42 at {}", sha).as_str())
    );

    assert!(h.vcs.branches("api").contains(&"feature/WI-42".to_string()));
    assert_eq!(h.vcs.current_branch("api").as_deref(), Some("feature/WI-42"));
}

#[tokio::test]
async fn test_success_criteria_are_reported_not_enforced() {
    let h = harness(&[BRANCH_CREATION]);

    let result = h
        .executor
        .run("branch-creation", inputs(json!({"WORK_ITEM_ID": "WI-1"})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.criteria.len(), 3);
    assert_eq!(result.criteria[0].outcome, CriterionOutcome::Unchecked);
    assert_eq!(result.criteria[1].outcome, CriterionOutcome::Passed);
    assert_eq!(result.criteria[2].outcome, CriterionOutcome::Failed);
}

#[tokio::test]
async fn test_invalid_inputs_prevent_any_step() {
    let h = harness(&[BRANCH_CREATION]);

    let err = h
        .executor
        .run("branch-creation", inputs(json!({"WORK_ITEM_ID": "42", "REPO": ["a"]})))
        .await
        .unwrap_err();

    match err {
        ExecutorError::InputValidation { workflow_id, violations } => {
            assert_eq!(workflow_id, "branch-creation");
            assert_eq!(violations.len(), 2);
        }
        other => panic!("expected input validation error, got {other}"),
    }
    assert!(h.vcs.calls().is_empty());
    assert!(h.executor.active_runs().is_empty());
}

#[tokio::test]
async fn test_required_prerequisite_blocks_run() {
    let doc = r#"
metadata:
  id: deploy
  name: Deploy
  version: "1.0.0"
  type: core
inputs:
  - name: ENVIRONMENT
    type: enum
    values: [dev, prod]
  - name: APPROVED
    type: boolean
    default: false
prerequisites:
  - description: Production deploys need approval
    check: "${inputs.ENVIRONMENT} ne prod or ${inputs.APPROVED}"
steps:
  - id: go
    action: log
    message: deploying
"#;
    let h = harness(&[doc]);

    let err = h
        .executor
        .run("deploy", inputs(json!({"ENVIRONMENT": "prod"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Prerequisite { .. }));

    let ok = h
        .executor
        .run("deploy", inputs(json!({"ENVIRONMENT": "prod", "APPROVED": "true"})))
        .await
        .unwrap();
    assert_eq!(ok.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_unknown_workflow_is_an_error() {
    let h = harness(&[]);
    let err = h.executor.run("ghost", Default::default()).await.unwrap_err();
    assert!(matches!(err, ExecutorError::WorkflowNotFound(ref id) if id == "ghost"));
}

#[tokio::test]
async fn test_shell_outputs_feed_later_steps() {
    let doc = r#"
metadata:
  id: shell-chain
  name: Shell Chain
  version: "1.0.0"
  type: utility
inputs:
  - name: NAME
    type: string
steps:
  - id: greet
    action: shell-command
    command: echo "GREETING=hello $NAME"
    env:
      NAME: ${inputs.NAME}
    outputs: [GREETING, exit_code]
  - id: missing
    action: shell-command
    command: echo nothing
    condition: "${steps.greet.exit_code} ne 0"
outputs:
  - name: GREETING
    value: ${steps.greet.GREETING}
"#;
    let h = harness(&[doc]);

    let result = h
        .executor
        .run("shell-chain", inputs(json!({"NAME": "ops"})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["GREETING"], "hello ops");
    assert_eq!(result.entries_for("missing")[0].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_undeclared_output_fails_step() {
    let doc = r#"
metadata:
  id: strict-outputs
  name: Strict
  version: "1.0.0"
  type: utility
steps:
  - id: readiness
    action: shell-command
    command: echo READY=yes
    outputs: [READY, VERSION]
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("strict-outputs", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, StepErrorKind::MissingOutput);
    assert!(error.message.contains("VERSION"));
}

#[tokio::test]
async fn test_unresolvable_outputs() {
    let doc = |allow: bool| {
        format!(
            r#"
metadata:
  id: outputs-{allow}
  name: Outputs
  version: "1.0.0"
  type: utility
steps:
  - id: hello
    action: log
    message: hi
    outputs: [message]
outputs:
  - name: GHOST
    value: ${{steps.nowhere.value}}
  - name: GREETING
    value: ${{steps.hello.message}}
errorHandling:
  allowMissingOutputs: {allow}
"#
        )
    };
    let strict = doc(false);
    let lenient = doc(true);
    let h = harness(&[&strict, &lenient]);

    let result = h.executor.run("outputs-false", Default::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    assert_eq!(result.output_errors.len(), 1);
    assert_eq!(result.output_errors[0].output, "GHOST");

    let result = h.executor.run("outputs-true", Default::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert!(result.output_errors.is_empty());
    assert_eq!(result.outputs["GHOST"], serde_json::Value::Null);
    assert_eq!(result.outputs["GREETING"], "hi");
}

// ============================================================================
// Conditionals and loops
// ============================================================================

#[tokio::test]
async fn test_guard_and_conditional_branches() {
    let doc = r#"
metadata:
  id: release
  name: Release
  version: "1.0.0"
  type: core
inputs:
  - name: ENVIRONMENT
    type: enum
    values: [dev, prod]
  - name: DRY_RUN
    type: boolean
    default: false
steps:
  - id: push
    action: git-operation
    operation: push
    condition: "not ${inputs.DRY_RUN}"
    inputs:
      repository: api
      branch: main
  - id: route
    action: conditional
    condition: "${inputs.ENVIRONMENT} eq prod"
    outputs: [branch]
    then:
      - id: approve
        action: log
        message: production approval
    else:
      - id: sandbox
        action: log
        message: sandbox deploy
"#;
    let h = harness(&[doc]);

    let result = h
        .executor
        .run("release", inputs(json!({"ENVIRONMENT": "dev", "DRY_RUN": true})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.entries_for("push")[0].status, StepStatus::Skipped);
    assert!(h.vcs.calls().is_empty());

    let route = &result.entries_for("route")[0];
    let nested: Vec<(&str, StepStatus)> = route
        .nested
        .iter()
        .map(|e| (e.step_id.as_str(), e.status))
        .collect();
    assert_eq!(
        nested,
        vec![("sandbox", StepStatus::Succeeded), ("approve", StepStatus::Skipped)]
    );

    let result = h
        .executor
        .run("release", inputs(json!({"ENVIRONMENT": "prod"})))
        .await
        .unwrap();
    assert_eq!(result.entries_for("push")[0].status, StepStatus::Succeeded);
    assert_eq!(result.entries_for("approve")[0].status, StepStatus::Succeeded);
    assert_eq!(h.vcs.pushes("api"), vec![("origin".to_string(), "main".to_string())]);
}

#[tokio::test]
async fn test_skipped_step_outputs_are_unresolvable() {
    let doc = r#"
metadata:
  id: skipped-refs
  name: Skipped References
  version: "1.0.0"
  type: utility
inputs:
  - name: ENABLED
    type: boolean
    default: false
steps:
  - id: gated
    action: log
    condition: "${inputs.ENABLED}"
    message: gated ran
    outputs: [message]
  - id: route
    action: conditional
    condition: "${inputs.ENABLED}"
    then:
      - id: approve
        action: log
        message: approved
        outputs: [message]
  - id: use-gated
    action: log
    message: saw ${steps.gated.message}
  - id: use-approve
    action: log
    message: saw ${steps.approve.message}
errorHandling:
  strategy: continue-on-error
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("skipped-refs", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    assert_eq!(result.entries_for("gated")[0].status, StepStatus::Skipped);
    assert_eq!(result.entries_for("approve")[0].status, StepStatus::Skipped);
    for id in ["use-gated", "use-approve"] {
        let entry = &result.entries_for(id)[0];
        assert_eq!(entry.status, StepStatus::Failed);
        assert_eq!(entry.error.as_ref().unwrap().kind, StepErrorKind::Expression);
    }
}

#[tokio::test]
async fn test_wait_unit_scales_duration() {
    let doc = r#"
metadata:
  id: paced
  name: Paced
  version: "1.0.0"
  type: utility
steps:
  - id: pause
    action: wait
    duration: 0.005
    unit: minutes
    outputs: [waited_ms]
outputs:
  - name: WAITED
    value: ${steps.pause.waited_ms}
"#;
    let h = harness(&[doc]);

    let started = Instant::now();
    let result = h.executor.run("paced", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["WAITED"], 300);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_while_loop_until_condition_false() {
    let doc = r#"
metadata:
  id: counter
  name: Counter
  version: "1.0.0"
  type: utility
steps:
  - id: init
    action: set-variable
    variable: n
    value: 0
  - id: loop
    action: while-loop
    condition: "${context.n} lt 3"
    outputs: [iterations]
    steps:
      - id: count
        action: shell-command
        command: echo "COUNT=$(( ${context.n} + 1 ))"
        outputs: [COUNT]
      - id: store
        action: set-variable
        variable: n
        value: ${steps.count.COUNT}
outputs:
  - name: ITERATIONS
    value: ${steps.loop.iterations}
  - name: FINAL
    value: ${context.n}
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("counter", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["ITERATIONS"], 3);
    assert_eq!(result.outputs["FINAL"], "3");
    assert_eq!(result.entries_for("count").len(), 3);
}

#[tokio::test]
async fn test_while_loop_bound() {
    let doc = r#"
metadata:
  id: runaway
  name: Runaway
  version: "1.0.0"
  type: utility
steps:
  - id: spin
    action: while-loop
    condition: "true"
    maxIterations: 4
    steps:
      - id: tick
        action: log
        message: tick
  - id: after
    action: log
    message: unreachable
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("runaway", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, StepErrorKind::LoopBound);
    assert_eq!(error.step_id, "spin");
    assert_eq!(result.entries_for("tick").len(), 4);
    assert!(result.entries_for("after").is_empty());
}

#[tokio::test]
async fn test_while_loop_uses_configured_bound() {
    let doc = r#"
metadata:
  id: runaway
  name: Runaway
  version: "1.0.0"
  type: utility
steps:
  - id: spin
    action: while-loop
    condition: "true"
    steps:
      - id: tick
        action: log
        message: tick
"#;
    let h = harness(&[doc]);
    let executor = h.executor.with_config(EngineConfig {
        max_loop_iterations: 2,
        ..EngineConfig::default()
    });

    let result = executor.run("runaway", Default::default()).await.unwrap();
    assert_eq!(result.error.as_ref().unwrap().kind, StepErrorKind::LoopBound);
    assert_eq!(result.entries_for("tick").len(), 2);
}

#[tokio::test]
async fn test_for_loop_binds_item_and_index() {
    let doc = r#"
metadata:
  id: fan-branches
  name: Fan Branches
  version: "1.0.0"
  type: support
steps:
  - id: each
    action: for-loop
    items: ${inputs.REPOS}
    outputs: [iterations]
    steps:
      - id: cut
        action: git-operation
        operation: create-branch
        inputs:
          repository: ${context.item}
          branch: release/${context.index}
"#;
    let h = harness(&[doc]);

    let result = h
        .executor
        .run("fan-branches", inputs(json!({"REPOS": ["api", "web", "worker"]})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.entries_for("cut").len(), 3);
    assert!(h.vcs.branches("api").contains(&"release/0".to_string()));
    assert!(h.vcs.branches("web").contains(&"release/1".to_string()));
    assert!(h.vcs.branches("worker").contains(&"release/2".to_string()));
}

#[tokio::test]
async fn test_for_loop_rejects_non_list() {
    let doc = r#"
metadata:
  id: bad-items
  name: Bad Items
  version: "1.0.0"
  type: utility
steps:
  - id: each
    action: for-loop
    items: ${inputs.REPOS}
    steps:
      - id: noop
        action: log
        message: never
"#;
    let h = harness(&[doc]);

    let result = h
        .executor
        .run("bad-items", inputs(json!({"REPOS": 7})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.unwrap().kind, StepErrorKind::InvalidInput);
}

// ============================================================================
// Failure policy
// ============================================================================

fn three_step(id: &str, strategy: &str) -> String {
    format!(
        r#"
metadata:
  id: {id}
  name: {id}
  version: "1.0.0"
  type: utility
steps:
  - id: before
    action: log
    message: before
  - id: boom
    action: shell-command
    command: "echo broken >&2; exit 3"
  - id: after
    action: log
    message: after
errorHandling:
  strategy: {strategy}
"#
    )
}

#[tokio::test]
async fn test_fail_fast_stops_at_first_failure() {
    let doc = three_step("strict", "fail-fast");
    let h = harness(&[&doc]);

    let result = h.executor.run("strict", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(!result.is_success());
    assert_eq!(step_ids(&result), vec!["before", "boom"]);

    let error = result.error.unwrap();
    assert_eq!(error.step_id, "boom");
    assert_eq!(error.kind, StepErrorKind::Command);
    assert!(error.message.contains("exited with code 3"));
    assert!(error.message.contains("broken"));
}

#[tokio::test]
async fn test_continue_on_error_runs_remaining_steps() {
    let doc = three_step("lenient", "continue-on-error");
    let h = harness(&[&doc]);

    let result = h.executor.run("lenient", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    assert!(result.is_success());
    assert_eq!(step_ids(&result), vec!["before", "boom", "after"]);
    assert_eq!(result.entries_for("boom")[0].status, StepStatus::Failed);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_step_level_continue() {
    let doc = r#"
metadata:
  id: tolerant-step
  name: Tolerant
  version: "1.0.0"
  type: utility
steps:
  - id: optional
    action: azure-devops
    operation: get-work-item
    inputs:
      id: 99
    onError: continue
  - id: after
    action: log
    message: after
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("tolerant-step", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    let failed = &result.entries_for("optional")[0];
    assert_eq!(failed.error.as_ref().unwrap().kind, StepErrorKind::Tracker);
    assert_eq!(result.entries_for("after")[0].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_retry_until_success() {
    let doc = r#"
metadata:
  id: publish
  name: Publish
  version: "1.0.0"
  type: core
steps:
  - id: branch
    action: git-operation
    operation: create-branch
    inputs:
      repository: api
      branch: feature/x
  - id: push
    action: git-operation
    operation: push
    inputs:
      repo: api
      branch: feature/x
    onError:
      strategy: retry
      retries: 3
      delay: 10ms
"#;
    let h = harness(&[doc]);
    h.vcs.fail_times(GitOperation::Push, 2, "remote hung up");

    let result = h.executor.run("publish", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    let attempts: Vec<(u32, StepStatus)> = result
        .entries_for("push")
        .iter()
        .map(|e| (e.attempt, e.status))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (1, StepStatus::Failed),
            (2, StepStatus::Failed),
            (3, StepStatus::Succeeded)
        ]
    );
    assert_eq!(result.summary().retries, 2);
    assert_eq!(
        h.vcs.pushes("api"),
        vec![("origin".to_string(), "feature/x".to_string())]
    );
}

#[tokio::test]
async fn test_retries_exhausted() {
    let doc = r#"
metadata:
  id: publish
  name: Publish
  version: "1.0.0"
  type: core
steps:
  - id: comment
    action: azure-devops
    operation: add-comment
    inputs:
      id: 1
      text: shipped
    onError:
      strategy: retry
      retries: 1
      delay: 1ms
"#;
    let h = harness(&[doc]);
    h.tracker.fail_on(TrackerOperation::AddComment, "service unavailable");

    let result = h.executor.run("publish", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.entries_for("comment").len(), 2);
    let error = result.error.unwrap();
    assert_eq!(error.kind, StepErrorKind::Tracker);
    assert!(error.message.contains("service unavailable"));
}

#[tokio::test]
async fn test_pull_request_lifecycle() {
    let doc = r#"
metadata:
  id: review-and-merge
  name: Review And Merge
  version: "1.0.0"
  type: core
inputs:
  - name: WORK_ITEM
    type: number
    required: true
steps:
  - id: sync
    action: git-operation
    operation: pull
    inputs:
      repository: api
      branch: main
    outputs: [updated, commits]
  - id: branch
    action: git-operation
    operation: create-branch
    inputs:
      repository: api
      branch: feature/${inputs.WORK_ITEM}
    outputs: [branch]
  - id: pr
    action: azure-devops
    operation: create-pr
    inputs:
      repository: api
      title: Work item ${inputs.WORK_ITEM}
      source_branch: ${steps.branch.branch}
      work_items: ["${inputs.WORK_ITEM}"]
      reviewers: [lead@example.com]
    outputs: [id, status]
  - id: approve
    action: azure-devops
    operation: update-pr
    inputs:
      repository: api
      id: ${steps.pr.id}
      reviewers:
        - name: lead@example.com
          vote: 10
  - id: linked
    action: azure-devops
    operation: get-pr-work-items
    inputs:
      repository: api
      id: ${steps.pr.id}
    outputs: [count]
  - id: complete
    action: azure-devops
    operation: update-pr
    inputs:
      repository: api
      id: ${steps.pr.id}
      status: completed
    outputs: [status]
  - id: release
    action: git-operation
    operation: tag
    inputs:
      repository: api
      tag: v${inputs.WORK_ITEM}
    outputs: [tag]
outputs:
  PR_ID: ${steps.pr.id}
  PULLED: ${steps.sync.commits}
  LINKED: ${steps.linked.count}
  FINAL_STATUS: ${steps.complete.status}
  TAG: ${steps.release.tag}
"#;
    let h = harness(&[doc]);
    h.tracker.insert(WorkItemDraft {
        title: "Add login".to_string(),
        work_item_type: "User Story".to_string(),
        ..Default::default()
    });
    h.vcs.add_upstream_commits("api", "origin", "main", 2);

    let result = h
        .executor
        .run("review-and-merge", inputs(json!({"WORK_ITEM": 1})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded, "{:?}", result.error);
    assert_eq!(result.outputs["PR_ID"], 1);
    assert_eq!(result.outputs["PULLED"], 2);
    assert_eq!(result.outputs["LINKED"], 1);
    assert_eq!(result.outputs["FINAL_STATUS"], "completed");
    assert_eq!(result.outputs["TAG"], "v1");

    let pr = h.tracker.pull_request(1).unwrap();
    assert_eq!(pr.source_branch, "feature/1");
    assert_eq!(pr.reviewers[0].vote, 10);
    assert_eq!(h.vcs.tags("api").len(), 1);
}

#[tokio::test]
async fn test_rollback_compensates_in_reverse_order() {
    let doc = r#"
metadata:
  id: delivery
  name: Delivery
  version: "1.0.0"
  type: master
steps:
  - id: announce
    action: log
    message: starting
    onError:
      rollback:
        - id: retract
          action: log
          message: retracting announcement
  - id: branch
    action: git-operation
    operation: create-branch
    inputs:
      repository: api
      branch: feature/doomed
    onError:
      rollback:
        - id: restore-main
          action: git-operation
          operation: checkout
          inputs:
            repository: api
            branch: main
  - id: build
    action: shell-command
    command: exit 1
errorHandling:
  strategy: rollback
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("delivery", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        step_ids(&result),
        vec!["announce", "branch", "build", "restore-main", "retract"]
    );
    assert_eq!(h.vcs.current_branch("api").as_deref(), Some("main"));
    assert_eq!(result.error.unwrap().step_id, "build");
}

#[tokio::test]
async fn test_no_rollback_without_strategy() {
    let doc = r#"
metadata:
  id: delivery
  name: Delivery
  version: "1.0.0"
  type: master
steps:
  - id: announce
    action: log
    message: starting
    onError:
      rollback:
        - id: retract
          action: log
          message: retracting announcement
  - id: build
    action: shell-command
    command: exit 1
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("delivery", Default::default()).await.unwrap();
    assert_eq!(step_ids(&result), vec!["announce", "build"]);
}

// ============================================================================
// Parallel
// ============================================================================

#[tokio::test]
async fn test_parallel_branches_run_concurrently() {
    let doc = r#"
metadata:
  id: checks
  name: Checks
  version: "1.0.0"
  type: support
steps:
  - id: fanout
    action: parallel
    branches:
      - id: lint
        action: wait
        duration: 300ms
        outputs: [waited_ms]
      - id: unit
        action: wait
        duration: 300ms
        outputs: [waited_ms]
      - id: audit
        action: wait
        duration: 350ms
        outputs: [waited_ms]
  - id: report
    action: log
    message: lint ${steps.fanout.lint.waited_ms} unit ${steps.unit.waited_ms}
outputs:
  - name: AUDIT
    value: ${steps.fanout.audit.waited_ms}
"#;
    let h = harness(&[doc]);

    let started = Instant::now();
    let result = h.executor.run("checks", Default::default()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);

    let fanout = &result.entries_for("fanout")[0];
    let branches: Vec<&str> = fanout.nested.iter().map(|e| e.step_id.as_str()).collect();
    assert_eq!(branches, vec!["lint", "unit", "audit"]);
    assert_eq!(
        result.entries_for("report")[0].message.as_deref(),
        Some("lint 300 unit 300")
    );
    assert_eq!(result.outputs["AUDIT"], 350);

    // The parallel step ends only after its slowest branch
    let fanout_ms = (fanout.ended_at - fanout.started_at).num_milliseconds();
    assert!(fanout_ms >= 340, "fanout took {}ms", fanout_ms);
    for branch in &fanout.nested {
        assert!(branch.started_at >= fanout.started_at);
        assert!(branch.ended_at <= fanout.ended_at);
        assert!(fanout_ms >= (branch.ended_at - branch.started_at).num_milliseconds());
    }
    let report = &result.entries_for("report")[0];
    assert!(report.started_at >= fanout.ended_at);
}

#[tokio::test]
async fn test_parallel_fail_fast_cancels_siblings() {
    let doc = r#"
metadata:
  id: checks
  name: Checks
  version: "1.0.0"
  type: support
steps:
  - id: fanout
    action: parallel
    branches:
      - id: slow
        action: wait
        duration: 5s
      - id: broken
        action: shell-command
        command: exit 2
"#;
    let h = harness(&[doc]);

    let started = Instant::now();
    let result = h.executor.run("checks", Default::default()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.status, RunStatus::Failed);

    let error = result.error.as_ref().unwrap();
    assert_eq!(error.step_id, "fanout");
    assert_eq!(error.kind, StepErrorKind::Nested);
    assert!(error.message.contains("broken"));

    let slow = &result.entries_for("slow")[0];
    assert_eq!(slow.error.as_ref().unwrap().kind, StepErrorKind::Cancelled);
}

#[tokio::test]
async fn test_parallel_without_fail_fast_waits_for_all() {
    let doc = r#"
metadata:
  id: checks
  name: Checks
  version: "1.0.0"
  type: support
steps:
  - id: fanout
    action: parallel
    failFast: false
    branches:
      - id: slow
        action: wait
        duration: 200ms
      - id: broken
        action: shell-command
        command: exit 2
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("checks", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.entries_for("slow")[0].status, StepStatus::Succeeded);
    assert_eq!(result.entries_for("broken")[0].status, StepStatus::Failed);
}

// ============================================================================
// Nested workflows
// ============================================================================

const MAKE_BRANCH: &str = r#"
metadata:
  id: make-branch
  name: Make Branch
  version: "1.0.0"
  type: core
inputs:
  - name: NAME
    type: string
steps:
  - id: cut
    action: git-operation
    operation: create-branch
    inputs:
      repository: api
      branch: ${inputs.NAME}
    outputs: [branch]
outputs:
  - name: BRANCH
    value: ${steps.cut.branch}
"#;

const ONBOARD: &str = r#"
metadata:
  id: onboard
  name: Onboard
  version: "1.0.0"
  type: master
inputs:
  - name: WORK_ITEM_ID
    type: string
steps:
  - id: call
    action: execute-workflow
    workflow: make-branch
    inputs:
      NAME: feature/${inputs.WORK_ITEM_ID}
  - id: done
    action: log
    message: branch ${steps.call.BRANCH} ready
"#;

#[tokio::test]
async fn test_nested_workflow_outputs_and_history() {
    let sink = Arc::new(CollectingSink::new());
    let h = harness(&[MAKE_BRANCH, ONBOARD]);
    let executor = h.executor.with_history_sink(sink.clone());

    let result = executor
        .run("onboard", inputs(json!({"WORK_ITEM_ID": "WI-9"})))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        result.entries_for("done")[0].message.as_deref(),
        Some("branch feature/WI-9 ready")
    );

    let call = &result.entries_for("call")[0];
    assert_eq!(call.nested.len(), 1);
    assert_eq!(call.nested[0].step_id, "cut");

    // The child's steps reach the sink once, inside the parent's entry
    let recorded = sink.entries();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|(run_id, _)| run_id == &result.run_id));
    assert_eq!(recorded[0].1.step_id, "call");
    assert_eq!(recorded[0].1.nested[0].step_id, "cut");
}

#[tokio::test]
async fn test_cancelling_nested_run_fails_parent_step() {
    let parent = r#"
metadata:
  id: waits-on-child
  name: Waits On Child
  version: "1.0.0"
  type: master
steps:
  - id: call
    action: execute-workflow
    workflow: long-wait
    onError: continue
  - id: after
    action: log
    message: parent carried on
"#;
    let h = harness(&[parent, LONG_WAIT]);
    let executor = h.executor.clone();

    let handle =
        tokio::spawn(async move { executor.run("waits-on-child", Default::default()).await });

    let child_id = loop {
        let child = h
            .executor
            .active_runs()
            .into_iter()
            .find(|run| run.parent_run_id.is_some());
        if let Some(child) = child {
            break child.run_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert!(h.executor.cancel(&child_id));
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    let call = &result.entries_for("call")[0];
    let error = call.error.as_ref().unwrap();
    assert_eq!(error.kind, StepErrorKind::Nested);
    assert!(error.message.contains("cancelled"));
    assert_eq!(result.entries_for("after")[0].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_nested_failure_propagates() {
    let parent = workflow_with_deps("outer", &["inner"]);
    let child = failing_workflow("inner");
    let h = harness(&[&parent, &child]);

    let result = h.executor.run("outer", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.step_id, "call-inner");
    assert_eq!(error.kind, StepErrorKind::Nested);
    assert!(error.message.contains("exited with code 3"));

    let call = &result.entries_for("call-inner")[0];
    assert_eq!(call.nested[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn test_missing_nested_workflow_does_not_poison_run() {
    let doc = r#"
metadata:
  id: resilient
  name: Resilient
  version: "1.0.0"
  type: master
steps:
  - id: call
    action: execute-workflow
    workflow: not-registered
    onError: continue
  - id: after
    action: log
    message: still here
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("resilient", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallySucceeded);
    let call = &result.entries_for("call")[0];
    assert_eq!(call.error.as_ref().unwrap().kind, StepErrorKind::WorkflowNotFound);
    assert_eq!(result.entries_for("after")[0].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_nesting_depth_limit() {
    let recursive = workflow_with_deps("recur", &["recur"]);
    let h = harness(&[&recursive]);
    let executor = h.executor.with_config(EngineConfig {
        max_nesting_depth: 3,
        ..EngineConfig::default()
    });

    let result = executor.run("recur", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .error
        .unwrap()
        .message
        .contains("nesting depth limit 3 exceeded"));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let h = harness(&[MAKE_BRANCH]);

    let (a, b) = tokio::join!(
        h.executor.run("make-branch", inputs(json!({"NAME": "feature/a"}))),
        h.executor.run("make-branch", inputs(json!({"NAME": "feature/b"}))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.outputs["BRANCH"], "feature/a");
    assert_eq!(b.outputs["BRANCH"], "feature/b");
}

// ============================================================================
// Tracker
// ============================================================================

#[tokio::test]
async fn test_work_item_lifecycle() {
    let doc = r#"
metadata:
  id: triage
  name: Triage
  version: "1.0.0"
  type: support
steps:
  - id: create
    action: azure-devops
    operation: create-work-item
    inputs:
      type: Bug
      title: Login page broken
    outputs: [id, state]
  - id: assign
    action: azure-devops
    operation: assign-work-item
    inputs:
      id: ${steps.create.id}
      assignee: dev@example.com
  - id: note
    action: azure-devops
    operation: add-comment
    inputs:
      workItemId: ${steps.create.id}
      text: Triaged as ${steps.create.state}
outputs:
  - name: WORK_ITEM
    value: ${steps.create.id}
"#;
    let h = harness(&[doc]);

    let result = h.executor.run("triage", Default::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs["WORK_ITEM"], 1);

    let item = h.tracker.work_item(1).unwrap();
    assert_eq!(item.work_item_type, "Bug");
    assert_eq!(item.assigned_to.as_deref(), Some("dev@example.com"));
    assert_eq!(h.tracker.comments(1)[0].text, "Triaged as New");
}

// ============================================================================
// Cancellation and timeouts
// ============================================================================

const LONG_WAIT: &str = r#"
metadata:
  id: long-wait
  name: Long Wait
  version: "1.0.0"
  type: utility
steps:
  - id: nap
    action: wait
    duration: 10s
  - id: after
    action: log
    message: after
"#;

#[tokio::test]
async fn test_cancel_with_token() {
    let h = harness(&[LONG_WAIT]);
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = h
        .executor
        .run_with_cancel("long-wait", Default::default(), token)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.error.as_ref().unwrap().is_cancelled());
    assert!(result.entries_for("after").is_empty());
}

#[tokio::test]
async fn test_cancel_by_run_id() {
    let h = harness(&[LONG_WAIT]);
    let executor = h.executor.clone();

    let handle = tokio::spawn(async move { executor.run("long-wait", Default::default()).await });

    let run_id = loop {
        if let Some(run) = h.executor.active_runs().first() {
            break run.run_id.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert!(h.executor.cancel(&run_id));
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.run_id, run_id);
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(h.executor.active_runs().is_empty());
    assert!(!h.executor.cancel(&run_id));
}

#[tokio::test]
async fn test_step_timeout() {
    let doc = r#"
metadata:
  id: slow-shell
  name: Slow Shell
  version: "1.0.0"
  type: utility
steps:
  - id: hang
    action: shell-command
    command: sleep 5
    timeout: 100ms
"#;
    let h = harness(&[doc]);

    let started = Instant::now();
    let result = h.executor.run("slow-shell", Default::default()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, StepErrorKind::Timeout);
    assert!(error.message.contains("timed out"));
}

#[tokio::test]
async fn test_default_timeout_from_config() {
    let doc = r#"
metadata:
  id: slow-tracker
  name: Slow Tracker
  version: "1.0.0"
  type: utility
steps:
  - id: fetch
    action: azure-devops
    operation: query-work-items
    inputs:
      state: Active
"#;
    let h = harness(&[doc]);
    h.tracker.set_latency(Duration::from_secs(2));
    let executor = h.executor.with_config(EngineConfig {
        default_step_timeout: StepDuration(Duration::from_millis(100)),
        ..EngineConfig::default()
    });

    let result = executor.run("slow-tracker", Default::default()).await.unwrap();

    assert_eq!(result.error.unwrap().kind, StepErrorKind::Timeout);
}

#[tokio::test]
async fn test_run_result_serializes() {
    let h = harness(&[BRANCH_CREATION]);
    let result = h
        .executor
        .run("branch-creation", inputs(json!({"WORK_ITEM_ID": "WI-3"})))
        .await
        .unwrap();

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["status"], "succeeded");
    assert_eq!(value["history"].as_array().unwrap().len(), 4);
    assert_eq!(value["criteria"][1]["outcome"], "passed");
}
