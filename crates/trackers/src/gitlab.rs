//! GitLab adapter.
//!
//! Speaks the v4 REST API with `PRIVATE-TOKEN` auth. Issue listings page
//! with `page`/`per_page` until exhaustion; the first label that matches one
//! of the configured category keys is folded into the single-element neutral
//! `labels`, every other label is ignored.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::http::ApiClient;
use crate::types::{IssueState, IssueView, MemberView, TrackerResult};

const PAGE_SIZE: i64 = 100;

/// Uniform read/write contract over a GitLab instance.
#[async_trait]
pub trait GitlabApi: Send + Sync {
    /// Numeric project id for a `group/name` path, or NotFound.
    async fn resolve_project_id(&self, path_with_namespace: &str) -> TrackerResult<i64>;
    async fn list_members(&self, project_id: i64) -> TrackerResult<Vec<MemberView>>;
    /// All issues of the project regardless of state, paged until exhaustion.
    async fn list_issues(&self, project_id: i64) -> TrackerResult<Vec<IssueView>>;
    async fn get_issue(&self, project_id: i64, issue_iid: i64) -> TrackerResult<IssueView>;
    /// Returns the new issue's iid.
    async fn create_issue(&self, project_id: i64, draft: &GitlabIssueDraft) -> TrackerResult<i64>;
    async fn update_issue(
        &self,
        project_id: i64,
        issue_iid: i64,
        patch: &GitlabIssuePatch,
    ) -> TrackerResult<()>;
}

/// Fields for a new GitLab issue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GitlabIssueDraft {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_label_list"
    )]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

/// Partial update. An unset field means "do not touch"; `Some(None)` clears
/// the due date, an empty `assignee_ids` clears the assignee.
///
/// Label changes go through `add_labels`/`remove_labels` so labels outside
/// the synchronized category vocabulary survive a patch untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GitlabIssuePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_labels"
    )]
    pub add_labels: Option<Vec<String>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_labels"
    )]
    pub remove_labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_ids: Option<Vec<i64>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_clearable_date"
    )]
    pub due_date: Option<Option<NaiveDate>>,
    /// `close` or `reopen`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_event: Option<String>,
}

impl GitlabIssuePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.add_labels.is_none()
            && self.remove_labels.is_none()
            && self.assignee_ids.is_none()
            && self.due_date.is_none()
            && self.state_event.is_none()
    }
}

// GitLab takes labels as a comma-separated string.
fn serialize_label_list<S>(labels: &[String], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&labels.join(","))
}

fn serialize_labels<S>(value: &Option<Vec<String>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(labels) => serializer.serialize_str(&labels.join(",")),
        None => serializer.serialize_none(),
    }
}

// GitLab clears the due date with an empty string.
fn serialize_clearable_date<S>(
    value: &Option<Option<NaiveDate>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(Some(date)) => serializer.serialize_str(&date.to_string()),
        _ => serializer.serialize_str(""),
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireProject {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    id: i64,
    username: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireAssignee {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    iid: i64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    assignee: Option<WireAssignee>,
    #[serde(default)]
    due_date: Option<NaiveDate>,
    state: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    web_url: Option<String>,
}

fn state_from_wire(state: &str) -> IssueState {
    if state.eq_ignore_ascii_case("closed") {
        IssueState::Closed
    } else {
        IssueState::Open
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitlabClient {
    api: ApiClient,
    category_keys: Vec<String>,
}

impl GitlabClient {
    pub fn new(
        base_url: &str,
        token: &str,
        category_keys: Vec<String>,
    ) -> Result<Self, reqwest::Error> {
        let api = ApiClient::new(base_url, "PRIVATE-TOKEN", token.to_string())?;
        Ok(Self { api, category_keys })
    }

    /// The first issue label lying in the configured category keys, if any.
    fn fold_category_label(&self, labels: &[String]) -> Option<String> {
        labels
            .iter()
            .find(|label| {
                self.category_keys
                    .iter()
                    .any(|key| key.eq_ignore_ascii_case(label))
            })
            .cloned()
    }

    fn view_from_wire(&self, issue: WireIssue) -> IssueView {
        let labels = self
            .fold_category_label(&issue.labels)
            .map(|label| vec![label])
            .unwrap_or_default();
        IssueView {
            id: issue.iid,
            title: issue.title,
            description: issue.description,
            labels,
            assignee_id: issue.assignee.map(|assignee| assignee.id),
            due_date: issue.due_date,
            state: state_from_wire(&issue.state),
            updated_at: Some(issue.updated_at),
            web_url: issue.web_url,
        }
    }
}

#[async_trait]
impl GitlabApi for GitlabClient {
    async fn resolve_project_id(&self, path_with_namespace: &str) -> TrackerResult<i64> {
        let encoded = urlencoding::encode(path_with_namespace);
        let project: WireProject = self
            .api
            .get_json(&format!("/api/v4/projects/{encoded}"), &[])
            .await?;
        Ok(project.id)
    }

    async fn list_members(&self, project_id: i64) -> TrackerResult<Vec<MemberView>> {
        let mut members = Vec::new();
        let mut page = 1i64;
        loop {
            let batch: Vec<WireMember> = self
                .api
                .get_json(
                    &format!("/api/v4/projects/{project_id}/members/all"),
                    &[
                        ("page", page.to_string()),
                        ("per_page", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = batch.len() as i64;
            members.extend(batch.into_iter().map(|member| MemberView {
                id: member.id,
                handle: member.username,
                name: member.name,
            }));
            if fetched < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(members)
    }

    async fn list_issues(&self, project_id: i64) -> TrackerResult<Vec<IssueView>> {
        let mut issues = Vec::new();
        let mut page = 1i64;
        loop {
            let batch: Vec<WireIssue> = self
                .api
                .get_json(
                    &format!("/api/v4/projects/{project_id}/issues"),
                    &[
                        ("scope", "all".to_string()),
                        ("state", "all".to_string()),
                        ("page", page.to_string()),
                        ("per_page", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = batch.len() as i64;
            issues.extend(batch.into_iter().map(|issue| self.view_from_wire(issue)));
            if fetched < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(issues)
    }

    async fn get_issue(&self, project_id: i64, issue_iid: i64) -> TrackerResult<IssueView> {
        let issue: WireIssue = self
            .api
            .get_json(
                &format!("/api/v4/projects/{project_id}/issues/{issue_iid}"),
                &[],
            )
            .await?;
        Ok(self.view_from_wire(issue))
    }

    async fn create_issue(&self, project_id: i64, draft: &GitlabIssueDraft) -> TrackerResult<i64> {
        let body = serde_json::to_value(draft).expect("draft serialization is infallible");
        let issue: WireIssue = self
            .api
            .post_json(&format!("/api/v4/projects/{project_id}/issues"), &body)
            .await?;
        Ok(issue.iid)
    }

    async fn update_issue(
        &self,
        project_id: i64,
        issue_iid: i64,
        patch: &GitlabIssuePatch,
    ) -> TrackerResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(patch).expect("patch serialization is infallible");
        self.api
            .put(
                &format!("/api/v4/projects/{project_id}/issues/{issue_iid}"),
                &body,
            )
            .await
    }
}
