//! Bridge modules for external collaborators
//!
//! The engine talks to two external systems through traits defined here:
//! - `VersionControl`: branch, commit, push, pull, fetch, tag, merge and
//!   conflict queries
//! - `IssueTracker`: work item CRUD, queries, assignment, comments, and the
//!   pull request lifecycle (create, review, complete)
//!
//! Implementations:
//! - `git`: the git command line
//! - `azure_devops`: the Azure DevOps work item and Git REST APIs
//! - `memory`: deterministic in-memory collaborators with failure injection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod azure_devops;
pub mod git;
pub mod memory;

pub use azure_devops::AzureDevopsClient;
pub use git::GitCli;
pub use memory::{InMemoryTracker, InMemoryVcs};

/// Common error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Command failed ({command}, exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    Injected(String),
}

// ============================================================================
// Version control
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub repository: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub repository: String,
    pub branch: String,
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushInfo {
    pub repository: String,
    pub branch: String,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeInfo {
    pub repository: String,
    pub source: String,
    pub target: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub repository: String,
    pub source: String,
    pub target: String,
    pub has_conflicts: bool,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullInfo {
    pub repository: String,
    pub branch: String,
    pub remote: String,
    /// Whether the branch head moved
    pub updated: bool,
    pub commits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchInfo {
    pub repository: String,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub repository: String,
    pub tag: String,
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Refuse names git would read as an option
pub(crate) fn check_ref(kind: &str, name: &str) -> Result<(), BridgeError> {
    if name.is_empty() {
        return Err(BridgeError::InvalidRequest(format!("{} name is empty", kind)));
    }
    if name.starts_with('-') {
        return Err(BridgeError::InvalidRequest(format!(
            "{} name '{}' must not start with '-'",
            kind, name
        )));
    }
    Ok(())
}

/// Version-control primitives keyed by repository and branch
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create `branch` from `base` (or the current branch) and switch to it
    async fn create_branch(
        &self,
        repository: &str,
        branch: &str,
        base: Option<&str>,
    ) -> Result<BranchInfo, BridgeError>;

    async fn checkout(&self, repository: &str, branch: &str) -> Result<BranchInfo, BridgeError>;

    /// Commit the given files, or every change when `files` is empty
    async fn commit(
        &self,
        repository: &str,
        message: &str,
        files: &[String],
    ) -> Result<CommitInfo, BridgeError>;

    async fn push(
        &self,
        repository: &str,
        branch: &str,
        remote: &str,
    ) -> Result<PushInfo, BridgeError>;

    /// Merge `source` into `target`
    async fn merge(
        &self,
        repository: &str,
        source: &str,
        target: &str,
    ) -> Result<MergeInfo, BridgeError>;

    /// Report files that would conflict when merging `source` into `target`
    async fn conflicts(
        &self,
        repository: &str,
        source: &str,
        target: &str,
    ) -> Result<ConflictReport, BridgeError>;

    /// Fast-forward `branch` from `remote`
    async fn pull(
        &self,
        repository: &str,
        branch: &str,
        remote: &str,
    ) -> Result<PullInfo, BridgeError>;

    async fn fetch(&self, repository: &str, remote: &str) -> Result<FetchInfo, BridgeError>;

    /// Tag the current head; a message makes it an annotated tag
    async fn tag(
        &self,
        repository: &str,
        tag: &str,
        message: Option<&str>,
    ) -> Result<TagInfo, BridgeError>;
}

// ============================================================================
// Issue tracker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub state: String,
    pub work_item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Fields for a new work item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemDraft {
    #[serde(default = "default_work_item_type", alias = "type")]
    pub work_item_type: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub parent: Option<u64>,
    /// Additional tracker fields, e.g. `Microsoft.VSTS.Common.Priority`
    #[serde(default)]
    pub fields: Map<String, Value>,
}

fn default_work_item_type() -> String {
    "Task".to_string()
}

/// Criteria for `query_work_items`; a raw WIQL query wins over the filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemQuery {
    #[serde(default)]
    pub wiql: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, alias = "type")]
    pub work_item_type: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl WorkItemQuery {
    pub fn matches(&self, item: &WorkItem) -> bool {
        self.state.as_ref().map_or(true, |s| s == &item.state)
            && self
                .work_item_type
                .as_ref()
                .map_or(true, |t| t == &item.work_item_type)
            && self
                .assigned_to
                .as_ref()
                .map_or(true, |a| item.assigned_to.as_ref() == Some(a))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub work_item_id: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reviewer {
    pub name: String,
    /// Azure DevOps vote: 10 approved, 5 approved with suggestions, 0 none,
    /// -5 waiting for author, -10 rejected
    #[serde(default)]
    pub vote: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    pub repository: String,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    /// `active`, `completed` or `abandoned`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub reviewers: Vec<Reviewer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PullRequest {
    pub const STATUSES: [&'static str; 3] = ["active", "completed", "abandoned"];
}

/// Fields for a new pull request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequestDraft {
    #[serde(alias = "repo")]
    pub repository: String,
    pub title: String,
    #[serde(alias = "source", alias = "sourceBranch")]
    pub source_branch: String,
    #[serde(default = "default_target_branch", alias = "target", alias = "targetBranch")]
    pub target_branch: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    /// Work items linked to the pull request
    #[serde(default, alias = "workItems", alias = "work_item_ids")]
    pub work_items: Vec<u64>,
}

fn default_target_branch() -> String {
    "main".to_string()
}

/// Changes to an existing pull request; `status: completed` merges it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequestUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Reviewers to add or re-vote
    #[serde(default)]
    pub reviewers: Vec<Reviewer>,
}

impl PullRequestUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.reviewers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestComment {
    pub id: u64,
    pub pull_request_id: u64,
    /// Discussion thread holding the comment
    pub thread_id: u64,
    pub text: String,
}

/// Work tracking primitives: work items and pull requests
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_work_item(&self, draft: WorkItemDraft) -> Result<WorkItem, BridgeError>;

    async fn get_work_item(&self, id: u64) -> Result<WorkItem, BridgeError>;

    async fn update_work_item(
        &self,
        id: u64,
        fields: Map<String, Value>,
    ) -> Result<WorkItem, BridgeError>;

    async fn delete_work_item(&self, id: u64) -> Result<(), BridgeError>;

    async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>, BridgeError>;

    async fn assign_work_item(&self, id: u64, assignee: &str) -> Result<WorkItem, BridgeError>;

    async fn add_comment(&self, id: u64, text: &str) -> Result<Comment, BridgeError>;

    async fn create_pull_request(
        &self,
        draft: PullRequestDraft,
    ) -> Result<PullRequest, BridgeError>;

    async fn get_pull_request(&self, repository: &str, id: u64)
        -> Result<PullRequest, BridgeError>;

    async fn update_pull_request(
        &self,
        repository: &str,
        id: u64,
        update: PullRequestUpdate,
    ) -> Result<PullRequest, BridgeError>;

    async fn add_pull_request_comment(
        &self,
        repository: &str,
        id: u64,
        text: &str,
    ) -> Result<PullRequestComment, BridgeError>;

    /// Ids of the work items linked to a pull request
    async fn pull_request_work_items(
        &self,
        repository: &str,
        id: u64,
    ) -> Result<Vec<u64>, BridgeError>;
}
