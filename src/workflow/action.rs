//! Action kinds and operation names
//!
//! Every step is tagged with exactly one action kind from a closed set. The
//! external actions additionally carry a typed operation name.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of step behaviors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    ExecuteWorkflow,
    ShellCommand,
    GitOperation,
    AzureDevops,
    Conditional,
    WhileLoop,
    ForLoop,
    Parallel,
    SetVariable,
    Log,
    Wait,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::ExecuteWorkflow,
        ActionKind::ShellCommand,
        ActionKind::GitOperation,
        ActionKind::AzureDevops,
        ActionKind::Conditional,
        ActionKind::WhileLoop,
        ActionKind::ForLoop,
        ActionKind::Parallel,
        ActionKind::SetVariable,
        ActionKind::Log,
        ActionKind::Wait,
    ];

    /// The tag used in definition documents
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ExecuteWorkflow => "execute-workflow",
            ActionKind::ShellCommand => "shell-command",
            ActionKind::GitOperation => "git-operation",
            ActionKind::AzureDevops => "azure-devops",
            ActionKind::Conditional => "conditional",
            ActionKind::WhileLoop => "while-loop",
            ActionKind::ForLoop => "for-loop",
            ActionKind::Parallel => "parallel",
            ActionKind::SetVariable => "set-variable",
            ActionKind::Log => "log",
            ActionKind::Wait => "wait",
        }
    }

    /// Parse an action tag like "shell-command"
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Actions that talk to something outside the engine and honor timeouts
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            ActionKind::ShellCommand | ActionKind::GitOperation | ActionKind::AzureDevops
        )
    }

    /// Actions that contain nested steps
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            ActionKind::Conditional
                | ActionKind::WhileLoop
                | ActionKind::ForLoop
                | ActionKind::Parallel
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version-control primitives available to `git-operation` steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitOperation {
    CreateBranch,
    Checkout,
    Commit,
    Push,
    Merge,
    CheckConflicts,
    Pull,
    Fetch,
    Tag,
}

impl GitOperation {
    pub const NAMES: [&'static str; 9] = [
        "create-branch",
        "checkout",
        "commit",
        "push",
        "merge",
        "check-conflicts",
        "pull",
        "fetch",
        "tag",
    ];

    pub fn as_str(&self) -> &'static str {
        Self::NAMES[*self as usize]
    }
}

/// Work item and pull request primitives available to `azure-devops` steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerOperation {
    CreateWorkItem,
    GetWorkItem,
    UpdateWorkItem,
    DeleteWorkItem,
    QueryWorkItems,
    AssignWorkItem,
    AddComment,
    #[serde(rename = "create-pr")]
    CreatePullRequest,
    #[serde(rename = "get-pr")]
    GetPullRequest,
    #[serde(rename = "update-pr")]
    UpdatePullRequest,
    #[serde(rename = "add-pr-comment")]
    AddPullRequestComment,
    #[serde(rename = "get-pr-work-items")]
    PullRequestWorkItems,
}

impl TrackerOperation {
    pub const NAMES: [&'static str; 12] = [
        "create-work-item",
        "get-work-item",
        "update-work-item",
        "delete-work-item",
        "query-work-items",
        "assign-work-item",
        "add-comment",
        "create-pr",
        "get-pr",
        "update-pr",
        "add-pr-comment",
        "get-pr-work-items",
    ];

    /// Operations on pull requests rather than work items
    pub fn is_pull_request(&self) -> bool {
        matches!(
            self,
            TrackerOperation::CreatePullRequest
                | TrackerOperation::GetPullRequest
                | TrackerOperation::UpdatePullRequest
                | TrackerOperation::AddPullRequestComment
                | TrackerOperation::PullRequestWorkItems
        )
    }

    pub fn as_str(&self) -> &'static str {
        Self::NAMES[*self as usize]
    }
}
