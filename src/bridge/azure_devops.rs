//! Azure DevOps work item and pull request collaborator
//!
//! Talks to the work item tracking and git REST APIs with reqwest. Authentication is
//! a personal access token read from the environment variable named in
//! `AzureDevopsConfig::token_env`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{
    BridgeError, Comment, IssueTracker, PullRequest, PullRequestComment, PullRequestDraft,
    PullRequestUpdate, Reviewer, WorkItem, WorkItemDraft, WorkItemQuery,
};
use crate::workflow::AzureDevopsConfig;

const FIELD_TITLE: &str = "System.Title";
const FIELD_STATE: &str = "System.State";
const FIELD_TYPE: &str = "System.WorkItemType";
const FIELD_ASSIGNED_TO: &str = "System.AssignedTo";
const FIELD_DESCRIPTION: &str = "System.Description";

const REFS_HEADS: &str = "refs/heads/";

const COMMENTS_API_VERSION: &str = "7.0-preview.3";
const DEFAULT_QUERY_LIMIT: usize = 200;

#[derive(Debug)]
pub struct AzureDevopsClient {
    client: reqwest::Client,
    base_url: String,
    project: String,
    token: String,
    api_version: String,
}

impl AzureDevopsClient {
    pub fn new(config: &AzureDevopsConfig) -> Result<Self, BridgeError> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            BridgeError::ConfigError(format!(
                "environment variable {} is not set",
                config.token_env
            ))
        })?;
        Self::with_token(config, token)
    }

    pub fn with_token(config: &AzureDevopsConfig, token: String) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BridgeError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.organization_url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            token,
            api_version: config.api_version.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/_apis/{}", self.base_url, self.project, path)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        api_version: &str,
        body: Option<(Value, &str)>,
    ) -> Result<Value, BridgeError> {
        let start = Instant::now();
        let mut request = self
            .client
            .request(method.clone(), url)
            .query(&[("api-version", api_version)])
            .basic_auth("", Some(&self.token));

        if let Some((body, content_type)) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(serde_json::to_vec(&body)?);
        }

        debug!("Executing {} {}", method, url);
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BridgeError::Timeout
            } else {
                BridgeError::ServerError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::ServerError(e.to_string()))?;
        info!("{} {} -> {} ({}ms)", method, url, status, start.elapsed().as_millis());

        match status {
            200..=299 => Ok(if text.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }),
            404 => Err(BridgeError::NotFound(error_message(&text))),
            _ => Err(BridgeError::HttpError {
                status,
                message: error_message(&text),
            }),
        }
    }

    async fn patch_document(
        &self,
        method: reqwest::Method,
        url: &str,
        operations: Vec<Value>,
    ) -> Result<WorkItem, BridgeError> {
        let api_version = self.api_version.clone();
        let value = self
            .send(
                method,
                url,
                &api_version,
                Some((Value::Array(operations), "application/json-patch+json")),
            )
            .await?;
        parse_work_item(&value)
    }

    fn pull_request_url(&self, repository: &str, id: Option<u64>) -> String {
        let base = self.url(&format!("git/repositories/{}/pullrequests", repository));
        match id {
            Some(id) => format!("{}/{}", base, id),
            None => base,
        }
    }

    async fn json(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let api_version = self.api_version.clone();
        self.send(
            method,
            url,
            &api_version,
            body.map(|b| (b, "application/json")),
        )
        .await
    }

    fn wiql_for(&self, query: &WorkItemQuery) -> String {
        if let Some(wiql) = &query.wiql {
            return wiql.clone();
        }

        let mut clauses = vec![format!("[System.TeamProject] = '{}'", escape(&self.project))];
        if let Some(state) = &query.state {
            clauses.push(format!("[{}] = '{}'", FIELD_STATE, escape(state)));
        }
        if let Some(t) = &query.work_item_type {
            clauses.push(format!("[{}] = '{}'", FIELD_TYPE, escape(t)));
        }
        if let Some(a) = &query.assigned_to {
            clauses.push(format!("[{}] = '{}'", FIELD_ASSIGNED_TO, escape(a)));
        }
        format!(
            "SELECT [System.Id] FROM WorkItems WHERE {} ORDER BY [System.ChangedDate] DESC",
            clauses.join(" AND ")
        )
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn add_field(field: &str, value: Value) -> Value {
    json!({"op": "add", "path": format!("/fields/{}", field), "value": value})
}

fn identity_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("uniqueName")
            .or_else(|| map.get("displayName"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn parse_work_item(value: &Value) -> Result<WorkItem, BridgeError> {
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::ServerError("work item response has no id".to_string()))?;
    let fields: Map<String, Value> = value
        .get("fields")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(WorkItem {
        id,
        title: text(FIELD_TITLE),
        state: text(FIELD_STATE),
        work_item_type: text(FIELD_TYPE),
        assigned_to: fields.get(FIELD_ASSIGNED_TO).and_then(identity_name),
        url: value
            .pointer("/_links/html/href")
            .or_else(|| value.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string),
        fields,
    })
}

fn branch_ref(branch: &str) -> String {
    if branch.starts_with(REFS_HEADS) {
        branch.to_string()
    } else {
        format!("{}{}", REFS_HEADS, branch)
    }
}

fn parse_pull_request(value: &Value) -> Result<PullRequest, BridgeError> {
    let id = value
        .get("pullRequestId")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            BridgeError::ServerError("pull request response has no pullRequestId".to_string())
        })?;
    let text = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default();
    let branch = |key: &str| text(key).trim_start_matches(REFS_HEADS).to_string();

    let reviewers = value
        .get("reviewers")
        .and_then(Value::as_array)
        .map(|reviewers| {
            reviewers
                .iter()
                .filter_map(|r| {
                    Some(Reviewer {
                        name: identity_name(r)?,
                        vote: r.get("vote").and_then(Value::as_i64).unwrap_or_default() as i32,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(PullRequest {
        id,
        repository: value
            .pointer("/repository/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        title: text("title").to_string(),
        source_branch: branch("sourceRefName"),
        target_branch: branch("targetRefName"),
        status: text("status").to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        reviewers,
        url: value
            .pointer("/_links/web/href")
            .or_else(|| value.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl IssueTracker for AzureDevopsClient {
    async fn create_work_item(&self, draft: WorkItemDraft) -> Result<WorkItem, BridgeError> {
        let mut ops = vec![add_field(FIELD_TITLE, Value::String(draft.title.clone()))];
        if let Some(description) = draft.description {
            ops.push(add_field(FIELD_DESCRIPTION, Value::String(description)));
        }
        if let Some(assignee) = draft.assigned_to {
            ops.push(add_field(FIELD_ASSIGNED_TO, Value::String(assignee)));
        }
        for (field, value) in draft.fields {
            ops.push(add_field(&field, value));
        }
        if let Some(parent) = draft.parent {
            ops.push(json!({
                "op": "add",
                "path": "/relations/-",
                "value": {
                    "rel": "System.LinkTypes.Hierarchy-Reverse",
                    "url": format!("{}/_apis/wit/workItems/{}", self.base_url, parent),
                }
            }));
        }

        let url = self.url(&format!("wit/workitems/${}", draft.work_item_type));
        let item = self.patch_document(reqwest::Method::POST, &url, ops).await?;
        info!("Created work item {} ({})", item.id, item.title);
        Ok(item)
    }

    async fn get_work_item(&self, id: u64) -> Result<WorkItem, BridgeError> {
        let url = self.url(&format!("wit/workitems/{}", id));
        let value = self
            .send(reqwest::Method::GET, &url, &self.api_version, None)
            .await?;
        parse_work_item(&value)
    }

    async fn update_work_item(
        &self,
        id: u64,
        fields: Map<String, Value>,
    ) -> Result<WorkItem, BridgeError> {
        if fields.is_empty() {
            return Err(BridgeError::InvalidRequest("no fields to update".to_string()));
        }
        let ops = fields
            .into_iter()
            .map(|(field, value)| add_field(&field, value))
            .collect();
        let url = self.url(&format!("wit/workitems/{}", id));
        self.patch_document(reqwest::Method::PATCH, &url, ops).await
    }

    async fn delete_work_item(&self, id: u64) -> Result<(), BridgeError> {
        let url = self.url(&format!("wit/workitems/{}", id));
        self.send(reqwest::Method::DELETE, &url, &self.api_version, None)
            .await?;
        Ok(())
    }

    async fn query_work_items(&self, query: &WorkItemQuery) -> Result<Vec<WorkItem>, BridgeError> {
        let url = self.url("wit/wiql");
        let result = self
            .send(
                reqwest::Method::POST,
                &url,
                &self.api_version,
                Some((json!({"query": self.wiql_for(query)}), "application/json")),
            )
            .await?;

        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let ids: Vec<String> = result
            .get("workItems")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("id").and_then(Value::as_u64))
                    .take(limit)
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}&ids={}", self.url("wit/workitems?$expand=none"), ids.join(","));
        let batch = self
            .send(reqwest::Method::GET, &url, &self.api_version, None)
            .await?;
        batch
            .get("value")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_work_item).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn assign_work_item(&self, id: u64, assignee: &str) -> Result<WorkItem, BridgeError> {
        let mut fields = Map::new();
        fields.insert(FIELD_ASSIGNED_TO.to_string(), Value::String(assignee.to_string()));
        self.update_work_item(id, fields).await
    }

    async fn add_comment(&self, id: u64, text: &str) -> Result<Comment, BridgeError> {
        let url = self.url(&format!("wit/workItems/{}/comments", id));
        let value = self
            .send(
                reqwest::Method::POST,
                &url,
                COMMENTS_API_VERSION,
                Some((json!({"text": text}), "application/json")),
            )
            .await?;

        Ok(Comment {
            id: value.get("id").and_then(Value::as_u64).unwrap_or_default(),
            work_item_id: id,
            text: text.to_string(),
        })
    }

    async fn create_pull_request(
        &self,
        draft: PullRequestDraft,
    ) -> Result<PullRequest, BridgeError> {
        let mut body = json!({
            "sourceRefName": branch_ref(&draft.source_branch),
            "targetRefName": branch_ref(&draft.target_branch),
            "title": draft.title,
            "reviewers": draft.reviewers.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
            "workItemRefs": draft
                .work_items
                .iter()
                .map(|id| json!({"id": id.to_string()}))
                .collect::<Vec<_>>(),
        });
        if let Some(description) = &draft.description {
            body["description"] = Value::String(description.clone());
        }

        let url = self.pull_request_url(&draft.repository, None);
        let value = self.json(reqwest::Method::POST, &url, Some(body)).await?;
        let pr = parse_pull_request(&value)?;
        info!(
            "Created pull request {} ({} -> {})",
            pr.id, pr.source_branch, pr.target_branch
        );
        Ok(pr)
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        id: u64,
    ) -> Result<PullRequest, BridgeError> {
        let url = self.pull_request_url(repository, Some(id));
        let value = self.json(reqwest::Method::GET, &url, None).await?;
        parse_pull_request(&value)
    }

    async fn update_pull_request(
        &self,
        repository: &str,
        id: u64,
        update: PullRequestUpdate,
    ) -> Result<PullRequest, BridgeError> {
        if update.is_empty() {
            return Err(BridgeError::InvalidRequest("no pull request changes".to_string()));
        }
        if let Some(status) = &update.status {
            if !PullRequest::STATUSES.contains(&status.as_str()) {
                return Err(BridgeError::InvalidRequest(format!(
                    "unknown pull request status '{}'",
                    status
                )));
            }
        }

        let url = self.pull_request_url(repository, Some(id));
        for reviewer in &update.reviewers {
            let reviewer_url = format!("{}/reviewers/{}", url, reviewer.name);
            self.json(
                reqwest::Method::PUT,
                &reviewer_url,
                Some(json!({"vote": reviewer.vote})),
            )
            .await?;
        }

        let mut body = Map::new();
        if let Some(title) = update.title {
            body.insert("title".to_string(), Value::String(title));
        }
        if let Some(description) = update.description {
            body.insert("description".to_string(), Value::String(description));
        }
        if let Some(status) = update.status {
            // Completing needs the source commit the caller last saw
            if status == "completed" {
                let current = self.json(reqwest::Method::GET, &url, None).await?;
                if let Some(commit) = current.get("lastMergeSourceCommit") {
                    body.insert("lastMergeSourceCommit".to_string(), commit.clone());
                }
            }
            body.insert("status".to_string(), Value::String(status));
        }

        let value = if body.is_empty() {
            self.json(reqwest::Method::GET, &url, None).await?
        } else {
            self.json(reqwest::Method::PATCH, &url, Some(Value::Object(body)))
                .await?
        };
        parse_pull_request(&value)
    }

    async fn add_pull_request_comment(
        &self,
        repository: &str,
        id: u64,
        text: &str,
    ) -> Result<PullRequestComment, BridgeError> {
        let url = format!("{}/threads", self.pull_request_url(repository, Some(id)));
        let body = json!({
            "comments": [{"parentCommentId": 0, "content": text, "commentType": 1}],
            "status": 1,
        });
        let value = self.json(reqwest::Method::POST, &url, Some(body)).await?;

        Ok(PullRequestComment {
            id: value
                .pointer("/comments/0/id")
                .and_then(Value::as_u64)
                .unwrap_or(1),
            pull_request_id: id,
            thread_id: value.get("id").and_then(Value::as_u64).unwrap_or_default(),
            text: text.to_string(),
        })
    }

    async fn pull_request_work_items(
        &self,
        repository: &str,
        id: u64,
    ) -> Result<Vec<u64>, BridgeError> {
        let url = format!("{}/workitems", self.pull_request_url(repository, Some(id)));
        let value = self.json(reqwest::Method::GET, &url, None).await?;
        Ok(work_item_refs(&value))
    }
}

/// Ids from a `ResourceRef` list; the API returns them as strings
fn work_item_refs(value: &Value) -> Vec<u64> {
    value
        .get("value")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| match r.get("id")? {
                    Value::String(s) => s.parse().ok(),
                    other => other.as_u64(),
                })
                .collect()
        })
        .unwrap_or_default()
}
