//! `azure-devops` action
//!
//! Example:
//! ```yaml
//! - id: ticket
//!   action: azure-devops
//!   operation: create-work-item
//!   inputs:
//!     type: Bug
//!     title: "Build failed for ${inputs.BRANCH}"
//!     assigned_to: ${inputs.OWNER}
//!   outputs: [id, url]
//! ```

use serde_json::{json, Map, Value};
use tracing::info;

use super::{to_outputs, Args};
use crate::bridge::{
    BridgeError, IssueTracker, PullRequestDraft, PullRequestUpdate, WorkItemDraft, WorkItemQuery,
};
use crate::engine::error::{ActionFailure, StepErrorKind};
use crate::workflow::TrackerOperation;

const ID_KEYS: &[&str] = &["id", "workItemId", "work_item_id"];
const PR_ID_KEYS: &[&str] = &["id", "pullRequestId", "pull_request_id", "prId", "pr_id"];
const REPOSITORY_KEYS: &[&str] = &["repository", "repo"];

/// Execute one issue-tracker primitive with resolved inputs
pub async fn execute_tracker_operation(
    tracker: &dyn IssueTracker,
    operation: TrackerOperation,
    inputs: &Map<String, Value>,
) -> Result<Map<String, Value>, ActionFailure> {
    let name = operation.as_str();
    let args = Args::new(name, inputs);
    if operation.is_pull_request() {
        info!("azure-devops {} on {}", name, args.optional_str(REPOSITORY_KEYS).unwrap_or_default());
    }

    match operation {
        TrackerOperation::CreateWorkItem => {
            let draft: WorkItemDraft = serde_json::from_value(Value::Object(inputs.clone()))
                .map_err(|e| {
                    ActionFailure::invalid_input(format!("{}: invalid work item: {}", name, e))
                })?;
            info!("Creating {} '{}'", draft.work_item_type, draft.title);
            let item = tracker
                .create_work_item(draft)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&item)
        }
        TrackerOperation::GetWorkItem => {
            let id = args.required_u64(ID_KEYS)?;
            let item = tracker.get_work_item(id).await.map_err(tracker_failure)?;
            to_outputs(&item)
        }
        TrackerOperation::UpdateWorkItem => {
            let id = args.required_u64(ID_KEYS)?;
            let mut fields = args.object(&["fields"])?;
            if fields.is_empty() {
                fields = args
                    .inputs()
                    .iter()
                    .filter(|(k, _)| !ID_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }
            info!("Updating work item {}", id);
            let item = tracker
                .update_work_item(id, fields)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&item)
        }
        TrackerOperation::DeleteWorkItem => {
            let id = args.required_u64(ID_KEYS)?;
            tracker.delete_work_item(id).await.map_err(tracker_failure)?;
            info!("Deleted work item {}", id);
            to_outputs(&json!({"id": id, "deleted": true}))
        }
        TrackerOperation::QueryWorkItems => {
            let query: WorkItemQuery = serde_json::from_value(Value::Object(inputs.clone()))
                .map_err(|e| {
                    ActionFailure::invalid_input(format!("{}: invalid query: {}", name, e))
                })?;
            let items = tracker
                .query_work_items(&query)
                .await
                .map_err(tracker_failure)?;
            let ids: Vec<u64> = items.iter().map(|i| i.id).collect();
            to_outputs(&json!({
                "count": items.len(),
                "ids": ids,
                "items": items,
            }))
        }
        TrackerOperation::AssignWorkItem => {
            let id = args.required_u64(ID_KEYS)?;
            let assignee = args.required_str(&["assignee", "assignedTo", "assigned_to"])?;
            let item = tracker
                .assign_work_item(id, &assignee)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&item)
        }
        TrackerOperation::AddComment => {
            let id = args.required_u64(ID_KEYS)?;
            let text = args.required_str(&["text", "comment"])?;
            let comment = tracker
                .add_comment(id, &text)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&comment)
        }
        TrackerOperation::CreatePullRequest => {
            let draft: PullRequestDraft = serde_json::from_value(Value::Object(inputs.clone()))
                .map_err(|e| {
                    ActionFailure::invalid_input(format!("{}: invalid pull request: {}", name, e))
                })?;
            let pr = tracker
                .create_pull_request(draft)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&pr)
        }
        TrackerOperation::GetPullRequest => {
            let repository = args.required_str(REPOSITORY_KEYS)?;
            let id = args.required_u64(PR_ID_KEYS)?;
            let pr = tracker
                .get_pull_request(&repository, id)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&pr)
        }
        TrackerOperation::UpdatePullRequest => {
            let repository = args.required_str(REPOSITORY_KEYS)?;
            let id = args.required_u64(PR_ID_KEYS)?;
            let update: PullRequestUpdate = serde_json::from_value(Value::Object(inputs.clone()))
                .map_err(|e| {
                    ActionFailure::invalid_input(format!("{}: invalid update: {}", name, e))
                })?;
            if update.is_empty() {
                return Err(ActionFailure::invalid_input(format!(
                    "{} requires at least one of title, description, status, reviewers",
                    name
                )));
            }
            let pr = tracker
                .update_pull_request(&repository, id, update)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&pr)
        }
        TrackerOperation::AddPullRequestComment => {
            let repository = args.required_str(REPOSITORY_KEYS)?;
            let id = args.required_u64(PR_ID_KEYS)?;
            let text = args.required_str(&["text", "comment"])?;
            let comment = tracker
                .add_pull_request_comment(&repository, id, &text)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&comment)
        }
        TrackerOperation::PullRequestWorkItems => {
            let repository = args.required_str(REPOSITORY_KEYS)?;
            let id = args.required_u64(PR_ID_KEYS)?;
            let ids = tracker
                .pull_request_work_items(&repository, id)
                .await
                .map_err(tracker_failure)?;
            to_outputs(&json!({"count": ids.len(), "work_item_ids": ids}))
        }
    }
}

fn tracker_failure(e: BridgeError) -> ActionFailure {
    ActionFailure::new(StepErrorKind::Tracker, e.to_string())
}
