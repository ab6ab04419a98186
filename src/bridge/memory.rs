//! In-memory collaborators
//!
//! Deterministic stand-ins for version control and the issue tracker. Both
//! record every call, can be told to fail a given operation, and can add
//! artificial latency so timeouts can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{
    check_ref, BranchInfo, BridgeError, CommitInfo, Comment, ConflictReport, FetchInfo,
    IssueTracker, MergeInfo, PullInfo, PullRequest, PullRequestComment, PullRequestDraft,
    PullRequestUpdate, PushInfo, Reviewer, TagInfo, VersionControl, WorkItem, WorkItemDraft,
    WorkItemQuery,
};
use crate::workflow::{GitOperation, TrackerOperation};

const DEFAULT_BRANCH: &str = "main";

/// A failure armed for one operation; `remaining: None` fails forever
#[derive(Debug, Clone)]
struct InjectedFailure {
    message: String,
    remaining: Option<usize>,
}

/// Consume one armed failure for `operation`, if any
fn take_failure<K: std::hash::Hash + Eq>(
    failures: &Mutex<HashMap<K, InjectedFailure>>,
    operation: K,
) -> Result<(), BridgeError> {
    let mut failures = failures.lock().unwrap_or_else(|e| e.into_inner());
    let Some(failure) = failures.get_mut(&operation) else {
        return Ok(());
    };

    let message = failure.message.clone();
    if let Some(remaining) = failure.remaining.as_mut() {
        *remaining -= 1;
        if *remaining == 0 {
            failures.remove(&operation);
        }
    }
    Err(BridgeError::Injected(message))
}

fn arm<K: std::hash::Hash + Eq>(
    failures: &Mutex<HashMap<K, InjectedFailure>>,
    operation: K,
    message: &str,
    remaining: Option<usize>,
) {
    failures.lock().unwrap_or_else(|e| e.into_inner()).insert(
        operation,
        InjectedFailure {
            message: message.to_string(),
            remaining,
        },
    );
}

#[derive(Debug, Default)]
struct RepoState {
    /// branch -> commit shas, oldest first
    branches: BTreeMap<String, Vec<String>>,
    current: String,
    pushed: Vec<(String, String)>,
    /// `(remote, branch)` -> commits waiting upstream for the next pull
    upstream: HashMap<(String, String), usize>,
    fetched: Vec<String>,
    /// tag -> commit
    tags: BTreeMap<String, String>,
}

impl RepoState {
    fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(DEFAULT_BRANCH.to_string(), Vec::new());
        Self {
            branches,
            current: DEFAULT_BRANCH.to_string(),
            pushed: Vec::new(),
            upstream: HashMap::new(),
            fetched: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    fn head(&self, branch: &str) -> Option<String> {
        self.branches.get(branch).and_then(|c| c.last().cloned())
    }
}

#[derive(Debug, Default)]
struct VcsState {
    repos: HashMap<String, RepoState>,
    sequence: u64,
    calls: Vec<String>,
}

/// Version control held in memory; repositories spring into existence with a
/// `main` branch on first use
#[derive(Debug, Default)]
pub struct InMemoryVcs {
    state: Mutex<VcsState>,
    failures: Mutex<HashMap<GitOperation, InjectedFailure>>,
    conflicts: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail with `message`
    pub fn fail_on(&self, operation: GitOperation, message: &str) {
        arm(&self.failures, operation, message, None);
    }

    /// Fail only the next `times` calls of `operation`
    pub fn fail_times(&self, operation: GitOperation, times: usize, message: &str) {
        arm(&self.failures, operation, message, Some(times));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Files reported as conflicting by `conflicts`; also makes `merge` fail
    pub fn set_conflicts(&self, files: &[&str]) {
        *self.conflicts.lock().unwrap_or_else(|e| e.into_inner()) =
            files.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    /// Calls made so far, as `operation repository args...`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).calls.clone()
    }

    pub fn branches(&self, repository: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(repository)
            .map(|r| r.branches.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// `(remote, branch)` pairs pushed so far
    pub fn pushes(&self, repository: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(repository)
            .map(|r| r.pushed.clone())
            .unwrap_or_default()
    }

    /// Pretend `commits` new commits landed on `remote/branch`; the next
    /// `pull` of that branch brings them in
    pub fn add_upstream_commits(&self, repository: &str, remote: &str, branch: &str, commits: usize) {
        let _ = self.with_repo(repository, |repo, _| {
            *repo
                .upstream
                .entry((remote.to_string(), branch.to_string()))
                .or_default() += commits;
            Ok(())
        });
    }

    /// Remotes fetched so far, in order
    pub fn fetches(&self, repository: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(repository)
            .map(|r| r.fetched.clone())
            .unwrap_or_default()
    }

    /// `(tag, commit)` pairs
    pub fn tags(&self, repository: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(repository)
            .map(|r| r.tags.clone().into_iter().collect())
            .unwrap_or_default()
    }

    pub fn current_branch(&self, repository: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(repository)
            .map(|r| r.current.clone())
    }

    async fn enter(&self, operation: GitOperation, call: String) -> Result<(), BridgeError> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .push(call);

        take_failure(&self.failures, operation)
    }

    fn with_repo<T>(
        &self,
        repository: &str,
        f: impl FnOnce(&mut RepoState, &mut dyn FnMut() -> String) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let VcsState {
            repos, sequence, ..
        } = &mut *state;
        let repo = repos
            .entry(repository.to_string())
            .or_insert_with(RepoState::new);
        let mut next_sha = || {
            *sequence += 1;
            format!("{:040x}", *sequence)
        };
        f(repo, &mut next_sha)
    }
}

#[async_trait]
impl VersionControl for InMemoryVcs {
    async fn create_branch(
        &self,
        repository: &str,
        branch: &str,
        base: Option<&str>,
    ) -> Result<BranchInfo, BridgeError> {
        check_ref("branch", branch)?;
        self.enter(
            GitOperation::CreateBranch,
            format!("create-branch {} {}", repository, branch),
        )
        .await?;

        self.with_repo(repository, |repo, _| {
            if repo.branches.contains_key(branch) {
                return Err(BridgeError::Conflict(format!("branch {} already exists", branch)));
            }
            let base_name = base.unwrap_or(repo.current.as_str()).to_string();
            let commits = repo
                .branches
                .get(&base_name)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(format!("branch {}", base_name)))?;
            let commit = commits.last().cloned();
            repo.branches.insert(branch.to_string(), commits);
            repo.current = branch.to_string();

            Ok(BranchInfo {
                repository: repository.to_string(),
                branch: branch.to_string(),
                base: Some(base_name),
                commit,
            })
        })
    }

    async fn checkout(&self, repository: &str, branch: &str) -> Result<BranchInfo, BridgeError> {
        check_ref("branch", branch)?;
        self.enter(GitOperation::Checkout, format!("checkout {} {}", repository, branch))
            .await?;

        self.with_repo(repository, |repo, _| {
            if !repo.branches.contains_key(branch) {
                return Err(BridgeError::NotFound(format!("branch {}", branch)));
            }
            repo.current = branch.to_string();
            Ok(BranchInfo {
                repository: repository.to_string(),
                branch: branch.to_string(),
                base: None,
                commit: repo.head(branch),
            })
        })
    }

    async fn commit(
        &self,
        repository: &str,
        message: &str,
        _files: &[String],
    ) -> Result<CommitInfo, BridgeError> {
        self.enter(GitOperation::Commit, format!("commit {} {}", repository, message))
            .await?;

        self.with_repo(repository, |repo, next_sha| {
            let sha = next_sha();
            let branch = repo.current.clone();
            repo.branches.entry(branch.clone()).or_default().push(sha.clone());
            Ok(CommitInfo {
                repository: repository.to_string(),
                branch,
                sha,
                message: message.to_string(),
            })
        })
    }

    async fn push(
        &self,
        repository: &str,
        branch: &str,
        remote: &str,
    ) -> Result<PushInfo, BridgeError> {
        self.enter(GitOperation::Push, format!("push {} {} {}", repository, remote, branch))
            .await?;

        self.with_repo(repository, |repo, _| {
            if !repo.branches.contains_key(branch) {
                return Err(BridgeError::NotFound(format!("branch {}", branch)));
            }
            repo.pushed.push((remote.to_string(), branch.to_string()));
            Ok(PushInfo {
                repository: repository.to_string(),
                branch: branch.to_string(),
                remote: remote.to_string(),
            })
        })
    }

    async fn merge(
        &self,
        repository: &str,
        source: &str,
        target: &str,
    ) -> Result<MergeInfo, BridgeError> {
        self.enter(GitOperation::Merge, format!("merge {} {} {}", repository, source, target))
            .await?;

        let conflicts = self.conflicts.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if !conflicts.is_empty() {
            return Err(BridgeError::Conflict(format!(
                "merge conflict in {}",
                conflicts.join(", ")
            )));
        }

        self.with_repo(repository, |repo, next_sha| {
            let source_commits = repo
                .branches
                .get(source)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(format!("branch {}", source)))?;
            let target_commits = repo
                .branches
                .get_mut(target)
                .ok_or_else(|| BridgeError::NotFound(format!("branch {}", target)))?;

            for sha in source_commits {
                if !target_commits.contains(&sha) {
                    target_commits.push(sha);
                }
            }
            let sha = next_sha();
            target_commits.push(sha.clone());
            repo.current = target.to_string();

            Ok(MergeInfo {
                repository: repository.to_string(),
                source: source.to_string(),
                target: target.to_string(),
                sha,
            })
        })
    }

    async fn conflicts(
        &self,
        repository: &str,
        source: &str,
        target: &str,
    ) -> Result<ConflictReport, BridgeError> {
        self.enter(
            GitOperation::CheckConflicts,
            format!("check-conflicts {} {} {}", repository, source, target),
        )
        .await?;

        let files = self.conflicts.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(ConflictReport {
            repository: repository.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            has_conflicts: !files.is_empty(),
            files,
        })
    }

    async fn pull(
        &self,
        repository: &str,
        branch: &str,
        remote: &str,
    ) -> Result<PullInfo, BridgeError> {
        check_ref("branch", branch)?;
        self.enter(GitOperation::Pull, format!("pull {} {} {}", repository, remote, branch))
            .await?;

        self.with_repo(repository, |repo, next_sha| {
            if !repo.branches.contains_key(branch) {
                return Err(BridgeError::NotFound(format!("branch {}", branch)));
            }
            let commits = repo
                .upstream
                .remove(&(remote.to_string(), branch.to_string()))
                .unwrap_or_default();
            let history = repo.branches.entry(branch.to_string()).or_default();
            for _ in 0..commits {
                history.push(next_sha());
            }
            Ok(PullInfo {
                repository: repository.to_string(),
                branch: branch.to_string(),
                remote: remote.to_string(),
                updated: commits > 0,
                commits,
                head: repo.head(branch),
            })
        })
    }

    async fn fetch(&self, repository: &str, remote: &str) -> Result<FetchInfo, BridgeError> {
        self.enter(GitOperation::Fetch, format!("fetch {} {}", repository, remote))
            .await?;

        self.with_repo(repository, |repo, _| {
            repo.fetched.push(remote.to_string());
            Ok(FetchInfo {
                repository: repository.to_string(),
                remote: remote.to_string(),
            })
        })
    }

    async fn tag(
        &self,
        repository: &str,
        tag: &str,
        message: Option<&str>,
    ) -> Result<TagInfo, BridgeError> {
        check_ref("tag", tag)?;
        self.enter(GitOperation::Tag, format!("tag {} {}", repository, tag))
            .await?;

        self.with_repo(repository, |repo, _| {
            if repo.tags.contains_key(tag) {
                return Err(BridgeError::Conflict(format!("tag {} already exists", tag)));
            }
            let commit = repo.head(&repo.current).ok_or_else(|| {
                BridgeError::InvalidRequest(format!("branch {} has no commits to tag", repo.current))
            })?;
            repo.tags.insert(tag.to_string(), commit.clone());
            Ok(TagInfo {
                repository: repository.to_string(),
                tag: tag.to_string(),
                commit,
                message: message.map(str::to_string),
            })
        })
    }
}

// ============================================================================
// Issue tracker
// ============================================================================

#[derive(Debug)]
struct StoredPullRequest {
    pull_request: PullRequest,
    work_items: Vec<u64>,
}

#[derive(Debug)]
struct TrackerState {
    items: BTreeMap<u64, WorkItem>,
    comments: Vec<Comment>,
    next_id: u64,
    pull_requests: BTreeMap<u64, StoredPullRequest>,
    pr_comments: Vec<PullRequestComment>,
    next_pr_id: u64,
    calls: Vec<String>,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            comments: Vec::new(),
            next_id: 1,
            pull_requests: BTreeMap::new(),
            pr_comments: Vec::new(),
            next_pr_id: 1,
            calls: Vec::new(),
        }
    }
}

impl TrackerState {
    fn pull_request_mut(
        &mut self,
        repository: &str,
        id: u64,
    ) -> Result<&mut StoredPullRequest, BridgeError> {
        self.pull_requests
            .get_mut(&id)
            .filter(|stored| stored.pull_request.repository == repository)
            .ok_or_else(|| {
                BridgeError::NotFound(format!("pull request {} in {}", id, repository))
            })
    }
}

/// Issue tracker held in memory; ids are assigned sequentially from 1
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    state: Mutex<TrackerState>,
    failures: Mutex<HashMap<TrackerOperation, InjectedFailure>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, operation: TrackerOperation, message: &str) {
        arm(&self.failures, operation, message, None);
    }

    /// Fail only the next `times` calls of `operation`
    pub fn fail_times(&self, operation: TrackerOperation, times: usize, message: &str) {
        arm(&self.failures, operation, message, Some(times));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).calls.clone()
    }

    pub fn work_item(&self, id: u64) -> Option<WorkItem> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .get(&id)
            .cloned()
    }

    pub fn comments(&self, id: u64) -> Vec<Comment> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .comments
            .iter()
            .filter(|c| c.work_item_id == id)
            .cloned()
            .collect()
    }

    pub fn pull_request(&self, id: u64) -> Option<PullRequest> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pull_requests
            .get(&id)
            .map(|stored| stored.pull_request.clone())
    }

    pub fn pull_request_comments(&self, id: u64) -> Vec<PullRequestComment> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pr_comments
            .iter()
            .filter(|c| c.pull_request_id == id)
            .cloned()
            .collect()
    }

    /// Seed a work item directly, bypassing failure injection
    pub fn insert(&self, draft: WorkItemDraft) -> WorkItem {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::create_locked(&mut state, draft)
    }

    fn create_locked(state: &mut TrackerState, draft: WorkItemDraft) -> WorkItem {
        let id = state.next_id;
        state.next_id += 1;

        let mut fields = draft.fields;
        if let Some(description) = draft.description {
            fields.insert("System.Description".to_string(), Value::String(description));
        }
        if let Some(parent) = draft.parent {
            fields.insert("System.Parent".to_string(), Value::from(parent));
        }

        let item = WorkItem {
            id,
            title: draft.title,
            state: "New".to_string(),
            work_item_type: draft.work_item_type,
            assigned_to: draft.assigned_to,
            fields,
            url: Some(format!("memory://workitems/{}", id)),
        };
        state.items.insert(id, item.clone());
        item
    }

    async fn enter(&self, operation: TrackerOperation, call: String) -> Result<(), BridgeError> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .push(call);

        take_failure(&self.failures, operation)
    }

    fn with_item<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut WorkItem) -> T,
    ) -> Result<T, BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .items
            .get_mut(&id)
            .map(f)
            .ok_or_else(|| BridgeError::NotFound(format!("work item {}", id)))
    }
}

fn apply_fields(item: &mut WorkItem, fields: Map<String, Value>) {
    for (field, value) in fields {
        match (field.as_str(), &value) {
            ("title" | "System.Title", Value::String(s)) => item.title = s.clone(),
            ("state" | "System.State", Value::String(s)) => item.state = s.clone(),
            ("assigned_to" | "System.AssignedTo", Value::String(s)) => {
                item.assigned_to = Some(s.clone())
            }
            _ => {
                item.fields.insert(field, value);
            }
        }
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn create_work_item(&self, draft: WorkItemDraft) -> Result<WorkItem, BridgeError> {
        self.enter(
            TrackerOperation::CreateWorkItem,
            format!("create-work-item {}", draft.title),
        )
        .await?;
        Ok(self.insert(draft))
    }

    async fn get_work_item(&self, id: u64) -> Result<WorkItem, BridgeError> {
        self.enter(TrackerOperation::GetWorkItem, format!("get-work-item {}", id))
            .await?;
        self.with_item(id, |item| item.clone())
    }

    async fn update_work_item(
        &self,
        id: u64,
        fields: Map<String, Value>,
    ) -> Result<WorkItem, BridgeError> {
        self.enter(TrackerOperation::UpdateWorkItem, format!("update-work-item {}", id))
            .await?;
        self.with_item(id, |item| {
            apply_fields(item, fields);
            item.clone()
        })
    }

    async fn delete_work_item(&self, id: u64) -> Result<(), BridgeError> {
        self.enter(TrackerOperation::DeleteWorkItem, format!("delete-work-item {}", id))
            .await?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .items
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound(format!("work item {}", id)))
    }

    async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>, BridgeError> {
        self.enter(TrackerOperation::QueryWorkItems, "query-work-items".to_string())
            .await?;
        if query.wiql.is_some() {
            return Err(BridgeError::InvalidRequest(
                "WIQL queries are not supported in memory".to_string(),
            ));
        }

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .items
            .values()
            .filter(|item| query.matches(item))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn assign_work_item(&self, id: u64, assignee: &str) -> Result<WorkItem, BridgeError> {
        self.enter(
            TrackerOperation::AssignWorkItem,
            format!("assign-work-item {} {}", id, assignee),
        )
        .await?;
        self.with_item(id, |item| {
            item.assigned_to = Some(assignee.to_string());
            item.clone()
        })
    }

    async fn add_comment(&self, id: u64, text: &str) -> Result<Comment, BridgeError> {
        self.enter(TrackerOperation::AddComment, format!("add-comment {}", id))
            .await?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.items.contains_key(&id) {
            return Err(BridgeError::NotFound(format!("work item {}", id)));
        }
        let comment = Comment {
            id: state.comments.len() as u64 + 1,
            work_item_id: id,
            text: text.to_string(),
        };
        state.comments.push(comment.clone());
        Ok(comment)
    }

    async fn create_pull_request(
        &self,
        draft: PullRequestDraft,
    ) -> Result<PullRequest, BridgeError> {
        self.enter(
            TrackerOperation::CreatePullRequest,
            format!("create-pr {} {}", draft.repository, draft.source_branch),
        )
        .await?;

        if draft.title.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("pull request title is empty".to_string()));
        }
        if draft.source_branch == draft.target_branch {
            return Err(BridgeError::InvalidRequest(format!(
                "source and target are both {}",
                draft.source_branch
            )));
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(missing) = draft.work_items.iter().find(|id| !state.items.contains_key(*id)) {
            return Err(BridgeError::NotFound(format!("work item {}", missing)));
        }
        let duplicate = state.pull_requests.values().any(|stored| {
            let pr = &stored.pull_request;
            pr.status == "active"
                && pr.repository == draft.repository
                && pr.source_branch == draft.source_branch
                && pr.target_branch == draft.target_branch
        });
        if duplicate {
            return Err(BridgeError::Conflict(format!(
                "an active pull request from {} to {} already exists",
                draft.source_branch, draft.target_branch
            )));
        }

        let id = state.next_pr_id;
        state.next_pr_id += 1;
        let pull_request = PullRequest {
            id,
            repository: draft.repository,
            title: draft.title,
            source_branch: draft.source_branch,
            target_branch: draft.target_branch,
            status: "active".to_string(),
            description: draft.description,
            reviewers: draft
                .reviewers
                .into_iter()
                .map(|name| Reviewer { name, vote: 0 })
                .collect(),
            url: Some(format!("memory://pullrequests/{}", id)),
        };
        state.pull_requests.insert(
            id,
            StoredPullRequest {
                pull_request: pull_request.clone(),
                work_items: draft.work_items,
            },
        );
        Ok(pull_request)
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        id: u64,
    ) -> Result<PullRequest, BridgeError> {
        self.enter(TrackerOperation::GetPullRequest, format!("get-pr {} {}", repository, id))
            .await?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.pull_request_mut(repository, id)?.pull_request.clone())
    }

    async fn update_pull_request(
        &self,
        repository: &str,
        id: u64,
        update: PullRequestUpdate,
    ) -> Result<PullRequest, BridgeError> {
        self.enter(
            TrackerOperation::UpdatePullRequest,
            format!("update-pr {} {}", repository, id),
        )
        .await?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let pr = &mut state.pull_request_mut(repository, id)?.pull_request;

        if let Some(status) = &update.status {
            if !PullRequest::STATUSES.contains(&status.as_str()) {
                return Err(BridgeError::InvalidRequest(format!(
                    "unknown pull request status '{}'",
                    status
                )));
            }
            if pr.status != "active" && status != &pr.status {
                return Err(BridgeError::Conflict(format!(
                    "pull request {} is already {}",
                    id, pr.status
                )));
            }
        }

        if let Some(title) = update.title {
            pr.title = title;
        }
        if let Some(description) = update.description {
            pr.description = Some(description);
        }
        for reviewer in update.reviewers {
            match pr.reviewers.iter_mut().find(|r| r.name == reviewer.name) {
                Some(existing) => existing.vote = reviewer.vote,
                None => pr.reviewers.push(reviewer),
            }
        }
        if let Some(status) = update.status {
            pr.status = status;
        }
        Ok(pr.clone())
    }

    async fn add_pull_request_comment(
        &self,
        repository: &str,
        id: u64,
        text: &str,
    ) -> Result<PullRequestComment, BridgeError> {
        self.enter(
            TrackerOperation::AddPullRequestComment,
            format!("add-pr-comment {} {}", repository, id),
        )
        .await?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pull_request_mut(repository, id)?;
        let next = state.pr_comments.len() as u64 + 1;
        let comment = PullRequestComment {
            id: next,
            pull_request_id: id,
            thread_id: next,
            text: text.to_string(),
        };
        state.pr_comments.push(comment.clone());
        Ok(comment)
    }

    async fn pull_request_work_items(
        &self,
        repository: &str,
        id: u64,
    ) -> Result<Vec<u64>, BridgeError> {
        self.enter(
            TrackerOperation::PullRequestWorkItems,
            format!("get-pr-work-items {} {}", repository, id),
        )
        .await?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.pull_request_mut(repository, id)?.work_items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_branch_commit_merge() {
        let vcs = InMemoryVcs::new();
        let branch = vcs.create_branch("api", "feature/7", None).await.unwrap();
        assert_eq!(branch.base.as_deref(), Some("main"));

        let commit = vcs.commit("api", "work", &[]).await.unwrap();
        assert_eq!(commit.branch, "feature/7");
        assert_eq!(commit.sha, format!("{:040x}", 1));

        let merged = vcs.merge("api", "feature/7", "main").await.unwrap();
        assert_eq!(merged.target, "main");
        assert_eq!(vcs.current_branch("api").as_deref(), Some("main"));
        assert_eq!(vcs.branches("api"), vec!["feature/7", "main"]);
    }

    #[tokio::test]
    async fn test_vcs_errors() {
        let vcs = InMemoryVcs::new();
        vcs.create_branch("api", "b", None).await.unwrap();
        assert!(matches!(
            vcs.create_branch("api", "b", None).await,
            Err(BridgeError::Conflict(_))
        ));
        assert!(matches!(
            vcs.checkout("api", "missing").await,
            Err(BridgeError::NotFound(_))
        ));

        vcs.fail_on(GitOperation::Push, "remote rejected");
        let err = vcs.push("api", "b", "origin").await.unwrap_err();
        assert_eq!(err.to_string(), "remote rejected");
        vcs.clear_failures();
        vcs.push("api", "b", "origin").await.unwrap();
        assert_eq!(vcs.pushes("api"), vec![("origin".to_string(), "b".to_string())]);

        vcs.set_conflicts(&["src/main.rs"]);
        let report = vcs.conflicts("api", "b", "main").await.unwrap();
        assert!(report.has_conflicts);
        assert!(vcs.merge("api", "b", "main").await.is_err());
    }

    #[tokio::test]
    async fn test_tracker_lifecycle() {
        let tracker = InMemoryTracker::new();
        let item = tracker
            .create_work_item(WorkItemDraft {
                title: "Add login".to_string(),
                work_item_type: "User Story".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(item.id, 1);
        assert_eq!(item.state, "New");

        let mut fields = Map::new();
        fields.insert("state".to_string(), Value::from("Active"));
        fields.insert("Microsoft.VSTS.Common.Priority".to_string(), Value::from(1));
        let updated = tracker.update_work_item(1, fields).await.unwrap();
        assert_eq!(updated.state, "Active");
        assert_eq!(updated.fields["Microsoft.VSTS.Common.Priority"], 1);

        tracker.assign_work_item(1, "dev@example.com").await.unwrap();
        tracker.add_comment(1, "started").await.unwrap();
        assert_eq!(tracker.comments(1).len(), 1);

        let active = tracker
            .query_work_items(&WorkItemQuery {
                state: Some("Active".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);

        tracker.delete_work_item(1).await.unwrap();
        assert!(matches!(
            tracker.get_work_item(1).await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_fetch_and_tag() {
        let vcs = InMemoryVcs::new();
        vcs.commit("api", "initial", &[]).await.unwrap();

        let pulled = vcs.pull("api", "main", "origin").await.unwrap();
        assert!(!pulled.updated);

        vcs.add_upstream_commits("api", "origin", "main", 2);
        let pulled = vcs.pull("api", "main", "origin").await.unwrap();
        assert!(pulled.updated);
        assert_eq!(pulled.commits, 2);
        assert_eq!(pulled.head, Some(format!("{:040x}", 3)));

        vcs.fetch("api", "upstream").await.unwrap();
        assert_eq!(vcs.fetches("api"), vec!["upstream"]);

        let tag = vcs.tag("api", "v1.0.0", Some("release")).await.unwrap();
        assert_eq!(tag.commit, format!("{:040x}", 3));
        assert!(matches!(
            vcs.tag("api", "v1.0.0", None).await,
            Err(BridgeError::Conflict(_))
        ));
        assert!(matches!(
            vcs.tag("empty", "v0", None).await,
            Err(BridgeError::InvalidRequest(_))
        ));
        assert!(matches!(
            vcs.create_branch("api", "-D", None).await,
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_request_lifecycle() {
        let tracker = InMemoryTracker::new();
        tracker.insert(WorkItemDraft {
            title: "Add login".to_string(),
            ..Default::default()
        });

        let pr = tracker
            .create_pull_request(PullRequestDraft {
                repository: "api".to_string(),
                title: "Add login".to_string(),
                source_branch: "feature/1".to_string(),
                target_branch: "main".to_string(),
                reviewers: vec!["lead@example.com".to_string()],
                work_items: vec![1],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pr.id, 1);
        assert_eq!(pr.status, "active");
        assert_eq!(pr.reviewers[0].vote, 0);

        let approved = tracker
            .update_pull_request(
                "api",
                1,
                PullRequestUpdate {
                    reviewers: vec![Reviewer {
                        name: "lead@example.com".to_string(),
                        vote: 10,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(approved.reviewers.len(), 1);
        assert_eq!(approved.reviewers[0].vote, 10);

        let comment = tracker.add_pull_request_comment("api", 1, "LGTM").await.unwrap();
        assert_eq!(comment.pull_request_id, 1);
        assert_eq!(tracker.pull_request_work_items("api", 1).await.unwrap(), vec![1]);

        let completed = tracker
            .update_pull_request(
                "api",
                1,
                PullRequestUpdate {
                    status: Some("completed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.status, "completed");

        let reopen = PullRequestUpdate {
            status: Some("abandoned".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            tracker.update_pull_request("api", 1, reopen).await,
            Err(BridgeError::Conflict(_))
        ));
        assert!(matches!(
            tracker.get_pull_request("web", 1).await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_request_validation() {
        let tracker = InMemoryTracker::new();
        let draft = PullRequestDraft {
            repository: "api".to_string(),
            title: "Fix".to_string(),
            source_branch: "bugfix/2".to_string(),
            target_branch: "main".to_string(),
            ..Default::default()
        };

        let missing_item = PullRequestDraft {
            work_items: vec![42],
            ..draft.clone()
        };
        assert!(matches!(
            tracker.create_pull_request(missing_item).await,
            Err(BridgeError::NotFound(_))
        ));

        tracker.create_pull_request(draft.clone()).await.unwrap();
        assert!(matches!(
            tracker.create_pull_request(draft.clone()).await,
            Err(BridgeError::Conflict(_))
        ));

        let same_branch = PullRequestDraft {
            target_branch: "bugfix/2".to_string(),
            ..draft
        };
        assert!(matches!(
            tracker.create_pull_request(same_branch).await,
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_times_recovers() {
        let tracker = InMemoryTracker::new();
        tracker.insert(WorkItemDraft {
            title: "x".to_string(),
            ..Default::default()
        });
        tracker.fail_times(TrackerOperation::GetWorkItem, 2, "503 unavailable");

        assert!(tracker.get_work_item(1).await.is_err());
        assert!(tracker.get_work_item(1).await.is_err());
        assert!(tracker.get_work_item(1).await.is_ok());
        assert_eq!(tracker.calls().len(), 3);
    }
}
