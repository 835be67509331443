//! Redmine adapter.
//!
//! Translates Redmine's REST shapes into the neutral DTOs: `subject` becomes
//! `title`, the tracker name becomes the single-element `labels`, and the
//! status named "Closed" maps to the closed state (anything else is open).
//! Authentication uses the `X-Redmine-API-Key` header; listings page with
//! `offset`/`limit` until exhaustion.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::http::ApiClient;
use crate::types::{IssueState, IssueView, MemberView, TrackerResult};

const PAGE_SIZE: i64 = 100;

/// Uniform read/write contract over a Redmine instance.
#[async_trait]
pub trait RedmineApi: Send + Sync {
    async fn list_projects(&self) -> TrackerResult<Vec<RedmineProjectView>>;
    async fn list_members(&self, project_id: i64) -> TrackerResult<Vec<MemberView>>;
    /// All issues of the project regardless of state, paged until exhaustion.
    async fn list_issues(&self, project_id: i64) -> TrackerResult<Vec<IssueView>>;
    async fn get_issue(&self, issue_id: i64) -> TrackerResult<IssueView>;
    /// Returns the new issue's id.
    async fn create_issue(&self, project_id: i64, draft: &RedmineIssueDraft)
    -> TrackerResult<i64>;
    async fn update_issue(&self, issue_id: i64, patch: &RedmineIssuePatch) -> TrackerResult<()>;
    async fn list_trackers(&self) -> TrackerResult<Vec<(i64, String)>>;
    async fn list_statuses(&self) -> TrackerResult<Vec<(i64, String)>>;
}

/// A Redmine project with its custom fields, as seen by project discovery.
#[derive(Debug, Clone)]
pub struct RedmineProjectView {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub custom_fields: Vec<(String, Option<String>)>,
}

impl RedmineProjectView {
    /// Value of a custom field by name, when present and non-empty.
    pub fn custom_field(&self, name: &str) -> Option<&str> {
        self.custom_fields
            .iter()
            .find(|(field, _)| field == name)
            .and_then(|(_, value)| value.as_deref())
            .filter(|value| !value.trim().is_empty())
    }
}

/// Fields for a new Redmine issue. Ids are already translated by the caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RedmineIssueDraft {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

/// Partial update. An unset field means "do not touch"; `Some(None)` on the
/// clearable fields clears the remote value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RedmineIssuePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_clearable_assignee"
    )]
    pub assigned_to_id: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
}

impl RedmineIssuePatch {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none()
            && self.description.is_none()
            && self.tracker_id.is_none()
            && self.status_id.is_none()
            && self.assigned_to_id.is_none()
            && self.due_date.is_none()
    }
}

// Redmine clears the assignee with an empty string, not null.
fn serialize_clearable_assignee<S>(
    value: &Option<Option<i64>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(Some(id)) => serializer.serialize_i64(*id),
        _ => serializer.serialize_str(""),
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NamedRef {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireCustomField {
    name: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

impl WireCustomField {
    fn value_as_string(&self) -> Option<String> {
        match &self.value {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireProject {
    id: i64,
    identifier: String,
    name: String,
    #[serde(default)]
    custom_fields: Vec<WireCustomField>,
}

#[derive(Debug, Deserialize)]
struct ProjectsPage {
    projects: Vec<WireProject>,
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct WireMembership {
    #[serde(default)]
    user: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct MembershipsPage {
    memberships: Vec<WireMembership>,
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    id: i64,
    subject: String,
    #[serde(default)]
    description: Option<String>,
    tracker: NamedRef,
    status: NamedRef,
    #[serde(default)]
    assigned_to: Option<IdRef>,
    #[serde(default)]
    due_date: Option<NaiveDate>,
    updated_on: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct IssuesPage {
    issues: Vec<WireIssue>,
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct IssueEnvelope {
    issue: WireIssue,
}

#[derive(Debug, Deserialize)]
struct CreatedEnvelope {
    issue: IdRef,
}

#[derive(Debug, Deserialize)]
struct TrackersEnvelope {
    trackers: Vec<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct StatusesEnvelope {
    issue_statuses: Vec<NamedRef>,
}

fn state_from_status(name: &str) -> IssueState {
    if name.eq_ignore_ascii_case("closed") {
        IssueState::Closed
    } else {
        IssueState::Open
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RedmineClient {
    api: ApiClient,
    public_base: String,
}

impl RedmineClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        public_url: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let api = ApiClient::new(base_url, "X-Redmine-API-Key", api_key.to_string())?;
        let public_base = public_url
            .unwrap_or(base_url)
            .trim_end_matches('/')
            .to_string();
        Ok(Self { api, public_base })
    }

    /// Public URL of an issue, used for `Source:` backlinks on GitLab.
    pub fn issue_url(&self, issue_id: i64) -> String {
        format!("{}/issues/{}", self.public_base, issue_id)
    }

    fn view_from_wire(&self, issue: WireIssue) -> IssueView {
        IssueView {
            id: issue.id,
            web_url: Some(self.issue_url(issue.id)),
            title: issue.subject,
            description: issue.description,
            labels: vec![issue.tracker.name],
            assignee_id: issue.assigned_to.map(|user| user.id),
            due_date: issue.due_date,
            state: state_from_status(&issue.status.name),
            updated_at: Some(issue.updated_on),
        }
    }
}

#[async_trait]
impl RedmineApi for RedmineClient {
    async fn list_projects(&self) -> TrackerResult<Vec<RedmineProjectView>> {
        let mut projects = Vec::new();
        let mut offset = 0i64;
        loop {
            let page: ProjectsPage = self
                .api
                .get_json(
                    "/projects.json",
                    &[
                        ("offset", offset.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = page.projects.len() as i64;
            projects.extend(page.projects.into_iter().map(|project| RedmineProjectView {
                id: project.id,
                identifier: project.identifier,
                name: project.name,
                custom_fields: project
                    .custom_fields
                    .iter()
                    .map(|field| (field.name.clone(), field.value_as_string()))
                    .collect(),
            }));
            offset += fetched;
            if fetched == 0 || offset >= page.total_count {
                break;
            }
        }
        Ok(projects)
    }

    async fn list_members(&self, project_id: i64) -> TrackerResult<Vec<MemberView>> {
        let mut members = Vec::new();
        let mut offset = 0i64;
        loop {
            let page: MembershipsPage = self
                .api
                .get_json(
                    &format!("/projects/{project_id}/memberships.json"),
                    &[
                        ("offset", offset.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = page.memberships.len() as i64;
            // Group memberships have no user and are skipped.
            members.extend(page.memberships.into_iter().filter_map(|membership| {
                membership.user.map(|user| MemberView {
                    id: user.id,
                    handle: user.name.clone(),
                    name: user.name,
                })
            }));
            offset += fetched;
            if fetched == 0 || offset >= page.total_count {
                break;
            }
        }
        Ok(members)
    }

    async fn list_issues(&self, project_id: i64) -> TrackerResult<Vec<IssueView>> {
        let mut issues = Vec::new();
        let mut offset = 0i64;
        loop {
            let page: IssuesPage = self
                .api
                .get_json(
                    "/issues.json",
                    &[
                        ("project_id", project_id.to_string()),
                        ("status_id", "*".to_string()),
                        ("offset", offset.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = page.issues.len() as i64;
            issues.extend(page.issues.into_iter().map(|issue| self.view_from_wire(issue)));
            offset += fetched;
            if fetched == 0 || offset >= page.total_count {
                break;
            }
        }
        Ok(issues)
    }

    async fn get_issue(&self, issue_id: i64) -> TrackerResult<IssueView> {
        let envelope: IssueEnvelope = self
            .api
            .get_json(&format!("/issues/{issue_id}.json"), &[])
            .await?;
        Ok(self.view_from_wire(envelope.issue))
    }

    async fn create_issue(
        &self,
        project_id: i64,
        draft: &RedmineIssueDraft,
    ) -> TrackerResult<i64> {
        let mut body = serde_json::to_value(draft).expect("draft serialization is infallible");
        body["project_id"] = serde_json::json!(project_id);
        let envelope: CreatedEnvelope = self
            .api
            .post_json("/issues.json", &serde_json::json!({ "issue": body }))
            .await?;
        Ok(envelope.issue.id)
    }

    async fn update_issue(&self, issue_id: i64, patch: &RedmineIssuePatch) -> TrackerResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.api
            .put(
                &format!("/issues/{issue_id}.json"),
                &serde_json::json!({ "issue": patch }),
            )
            .await
    }

    async fn list_trackers(&self) -> TrackerResult<Vec<(i64, String)>> {
        let envelope: TrackersEnvelope = self.api.get_json("/trackers.json", &[]).await?;
        Ok(envelope
            .trackers
            .into_iter()
            .map(|tracker| (tracker.id, tracker.name))
            .collect())
    }

    async fn list_statuses(&self) -> TrackerResult<Vec<(i64, String)>> {
        let envelope: StatusesEnvelope = self.api.get_json("/issue_statuses.json", &[]).await?;
        Ok(envelope
            .issue_statuses
            .into_iter()
            .map(|status| (status.id, status.name))
            .collect())
    }
}
