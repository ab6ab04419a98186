//! `git-operation` action
//!
//! Example:
//! ```yaml
//! - id: branch
//!   action: git-operation
//!   operation: create-branch
//!   inputs:
//!     repository: ${inputs.REPO}
//!     branch: feature/${inputs.WORK_ITEM_ID}
//!     base: main
//!   outputs: [branch, commit]
//! ```

use serde_json::{Map, Value};
use tracing::info;

use super::{to_outputs, Args};
use crate::bridge::{BridgeError, VersionControl};
use crate::engine::error::{ActionFailure, StepErrorKind};
use crate::workflow::GitOperation;

const DEFAULT_REMOTE: &str = "origin";

/// Execute one version-control primitive with resolved inputs
pub async fn execute_git_operation(
    vcs: &dyn VersionControl,
    operation: GitOperation,
    inputs: &Map<String, Value>,
) -> Result<Map<String, Value>, ActionFailure> {
    let name = operation.as_str();
    let args = Args::new(name, inputs);
    let repository = args.required_str(&["repository", "repo"])?;

    info!("git {} on {}", name, repository);

    match operation {
        GitOperation::CreateBranch => {
            let branch = args.required_str(&["branch"])?;
            let base = args.optional_str(&["base"]);
            let info = vcs
                .create_branch(&repository, &branch, base.as_deref())
                .await
                .map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::Checkout => {
            let branch = args.required_str(&["branch"])?;
            let info = vcs.checkout(&repository, &branch).await.map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::Commit => {
            let message = args.required_str(&["message"])?;
            let files = args.string_list(&["files"])?;
            let info = vcs
                .commit(&repository, &message, &files)
                .await
                .map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::Push => {
            let branch = args.required_str(&["branch"])?;
            let remote = args
                .optional_str(&["remote"])
                .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
            let info = vcs
                .push(&repository, &branch, &remote)
                .await
                .map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::Merge => {
            let source = args.required_str(&["source"])?;
            let target = args.required_str(&["target"])?;
            let info = vcs
                .merge(&repository, &source, &target)
                .await
                .map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::CheckConflicts => {
            let source = args.required_str(&["source"])?;
            let target = args.required_str(&["target"])?;
            let report = vcs
                .conflicts(&repository, &source, &target)
                .await
                .map_err(vcs_failure)?;
            to_outputs(&report)
        }
        GitOperation::Pull => {
            let branch = args.required_str(&["branch"])?;
            let remote = args
                .optional_str(&["remote"])
                .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
            let info = vcs
                .pull(&repository, &branch, &remote)
                .await
                .map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::Fetch => {
            let remote = args
                .optional_str(&["remote"])
                .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
            let info = vcs.fetch(&repository, &remote).await.map_err(vcs_failure)?;
            to_outputs(&info)
        }
        GitOperation::Tag => {
            let tag = args.required_str(&["tag", "tag_name", "name"])?;
            let message = args.optional_str(&["message"]);
            let info = vcs
                .tag(&repository, &tag, message.as_deref())
                .await
                .map_err(vcs_failure)?;
            to_outputs(&info)
        }
    }
}

fn vcs_failure(e: BridgeError) -> ActionFailure {
    ActionFailure::new(StepErrorKind::Vcs, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::InMemoryVcs;
    use serde_json::json;

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_branch_and_commit() {
        let vcs = InMemoryVcs::new();

        let out = execute_git_operation(
            &vcs,
            GitOperation::CreateBranch,
            &inputs(json!({"repository": "api", "branch": "feature/7", "base": "main"})),
        )
        .await
        .unwrap();
        assert_eq!(out["branch"], "feature/7");
        assert_eq!(out["base"], "main");

        let out = execute_git_operation(
            &vcs,
            GitOperation::Commit,
            &inputs(json!({"repository": "api", "message": "wip"})),
        )
        .await
        .unwrap();
        assert_eq!(out["branch"], "feature/7");
        assert_eq!(out["sha"].as_str().unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_push_defaults_remote() {
        let vcs = InMemoryVcs::new();
        let out = execute_git_operation(
            &vcs,
            GitOperation::Push,
            &inputs(json!({"repository": "api", "branch": "main"})),
        )
        .await
        .unwrap();
        assert_eq!(out["remote"], "origin");
    }

    #[tokio::test]
    async fn test_pull_fetch_and_tag() {
        let vcs = InMemoryVcs::new();
        vcs.commit("api", "initial", &[]).await.unwrap();
        vcs.add_upstream_commits("api", "origin", "main", 1);

        let out = execute_git_operation(
            &vcs,
            GitOperation::Pull,
            &inputs(json!({"repository": "api", "branch": "main"})),
        )
        .await
        .unwrap();
        assert_eq!(out["remote"], "origin");
        assert_eq!(out["updated"], true);
        assert_eq!(out["commits"], 1);

        let out = execute_git_operation(
            &vcs,
            GitOperation::Fetch,
            &inputs(json!({"repository": "api", "remote": "upstream"})),
        )
        .await
        .unwrap();
        assert_eq!(out["remote"], "upstream");

        let out = execute_git_operation(
            &vcs,
            GitOperation::Tag,
            &inputs(json!({"repository": "api", "tag_name": "v2.1.0", "message": "release"})),
        )
        .await
        .unwrap();
        assert_eq!(out["tag"], "v2.1.0");
        assert_eq!(out["commit"], vcs.tags("api")[0].1.as_str());
    }

    #[tokio::test]
    async fn test_option_like_branch_is_vcs_error() {
        let vcs = InMemoryVcs::new();
        let err = execute_git_operation(
            &vcs,
            GitOperation::Checkout,
            &inputs(json!({"repository": "api", "branch": "--orphan"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Vcs);
        assert!(vcs.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_is_invalid_input() {
        let vcs = InMemoryVcs::new();
        let err = execute_git_operation(
            &vcs,
            GitOperation::Merge,
            &inputs(json!({"repository": "api", "source": "feature/7"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::InvalidInput);
        assert_eq!(err.message, "merge requires input 'target'");
    }

    #[tokio::test]
    async fn test_collaborator_error_is_preserved() {
        let vcs = InMemoryVcs::new();
        vcs.fail_on(GitOperation::Push, "remote rejected");

        let err = execute_git_operation(
            &vcs,
            GitOperation::Push,
            &inputs(json!({"repository": "api", "branch": "main"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Vcs);
        assert!(err.message.contains("remote rejected"));
    }
}
