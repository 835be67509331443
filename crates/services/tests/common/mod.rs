//! Shared fixtures for the engine integration tests: in-memory mock
//! adapters over `HashMap`s with a mutation log, plus a harness wiring them
//! into a `SyncEngine` on a migrated temp database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use db::test_utils::create_test_pool;
use services::services::config::BridgeConfig;
use services::services::pass::{PassSummary, SyncEngine};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use trackers::{
    GitlabApi, GitlabIssueDraft, GitlabIssuePatch, IssueState, IssueView, MemberView, RedmineApi,
    RedmineIssueDraft, RedmineIssuePatch, RedmineProjectView, TrackerError, TrackerResult,
};

pub const GITLAB_PROJECT_ID: i64 = 900;
pub const REDMINE_PROJECT_ID: i64 = 1;
pub const GITLAB_WEB_BASE: &str = "https://gitlab.example.com/group/alpha";

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateRedmine { id: i64 },
    UpdateRedmine { id: i64 },
    CreateGitlab { iid: i64 },
    UpdateGitlab { iid: i64 },
}

pub fn ts(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

pub fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

/// A Redmine-side issue view: the label is the tracker name.
pub fn redmine_issue(id: i64, title: &str, tracker: &str) -> IssueView {
    IssueView {
        id,
        title: title.to_string(),
        description: None,
        labels: vec![tracker.to_string()],
        assignee_id: None,
        due_date: None,
        state: IssueState::Open,
        updated_at: ts(1_700_000_000),
        web_url: None,
    }
}

/// A GitLab-side issue view with its canonical web URL.
pub fn gitlab_issue(iid: i64, title: &str, label: &str) -> IssueView {
    IssueView {
        id: iid,
        title: title.to_string(),
        description: None,
        labels: vec![label.to_string()],
        assignee_id: None,
        due_date: None,
        state: IssueState::Open,
        updated_at: ts(1_700_000_000),
        web_url: Some(format!("{GITLAB_WEB_BASE}/-/issues/{iid}")),
    }
}

pub fn member(id: i64, handle: &str, name: &str) -> MemberView {
    MemberView {
        id,
        handle: handle.to_string(),
        name: name.to_string(),
    }
}

pub fn gitlab_issue_url(iid: i64) -> String {
    format!("{GITLAB_WEB_BASE}/-/issues/{iid}")
}

pub fn redmine_issue_url(id: i64) -> String {
    format!("https://redmine.example.com/issues/{id}")
}

// ---------------------------------------------------------------------------
// Mock Redmine
// ---------------------------------------------------------------------------

pub struct MockRedmine {
    pub projects: Mutex<Vec<RedmineProjectView>>,
    pub members: Mutex<Vec<MemberView>>,
    pub trackers: Vec<(i64, String)>,
    pub statuses: Vec<(i64, String)>,
    pub issues: Mutex<HashMap<i64, IssueView>>,
    pub mutations: Mutex<Vec<Mutation>>,
    next_id: AtomicI64,
}

impl MockRedmine {
    pub fn with_default_project() -> Self {
        Self {
            projects: Mutex::new(vec![RedmineProjectView {
                id: REDMINE_PROJECT_ID,
                identifier: "alpha".to_string(),
                name: "Alpha".to_string(),
                custom_fields: vec![(
                    "Gitlab Repo".to_string(),
                    Some("https://gitlab.example.com/group/alpha".to_string()),
                )],
            }]),
            members: Mutex::new(Vec::new()),
            trackers: vec![
                (1, "Feature".to_string()),
                (2, "Bug".to_string()),
                (3, "Task".to_string()),
                (9, "Support".to_string()),
            ],
            statuses: vec![
                (1, "New".to_string()),
                (2, "In Progress".to_string()),
                (5, "Closed".to_string()),
            ],
            issues: Mutex::new(HashMap::new()),
            mutations: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        }
    }

    pub fn insert_issue(&self, view: IssueView) {
        self.issues.lock().unwrap().insert(view.id, view);
    }

    pub fn remove_issue(&self, id: i64) {
        self.issues.lock().unwrap().remove(&id);
    }

    pub fn issue(&self, id: i64) -> Option<IssueView> {
        self.issues.lock().unwrap().get(&id).cloned()
    }

    pub fn set_members(&self, members: Vec<MemberView>) {
        *self.members.lock().unwrap() = members;
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().unwrap().len()
    }

    fn tracker_name(&self, tracker_id: i64) -> Option<String> {
        self.trackers
            .iter()
            .find(|(id, _)| *id == tracker_id)
            .map(|(_, name)| name.clone())
    }

    fn status_is_closed(&self, status_id: i64) -> bool {
        self.statuses
            .iter()
            .any(|(id, name)| *id == status_id && name.eq_ignore_ascii_case("closed"))
    }
}

#[async_trait]
impl RedmineApi for MockRedmine {
    async fn list_projects(&self) -> TrackerResult<Vec<RedmineProjectView>> {
        Ok(self.projects.lock().unwrap().clone())
    }

    async fn list_members(&self, _project_id: i64) -> TrackerResult<Vec<MemberView>> {
        Ok(self.members.lock().unwrap().clone())
    }

    async fn list_issues(&self, _project_id: i64) -> TrackerResult<Vec<IssueView>> {
        let mut views: Vec<IssueView> = self.issues.lock().unwrap().values().cloned().collect();
        views.sort_by_key(|view| view.id);
        Ok(views)
    }

    async fn get_issue(&self, issue_id: i64) -> TrackerResult<IssueView> {
        self.issues
            .lock()
            .unwrap()
            .get(&issue_id)
            .cloned()
            .ok_or(TrackerError::NotFound)
    }

    async fn create_issue(
        &self,
        _project_id: i64,
        draft: &RedmineIssueDraft,
    ) -> TrackerResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let view = IssueView {
            id,
            title: draft.subject.clone(),
            description: draft.description.clone(),
            labels: draft
                .tracker_id
                .and_then(|tracker_id| self.tracker_name(tracker_id))
                .map(|name| vec![name])
                .unwrap_or_default(),
            assignee_id: draft.assigned_to_id,
            due_date: draft.due_date,
            state: if draft.status_id.is_some_and(|id| self.status_is_closed(id)) {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            updated_at: ts(1_700_000_000),
            web_url: None,
        };
        self.issues.lock().unwrap().insert(id, view);
        self.mutations
            .lock()
            .unwrap()
            .push(Mutation::CreateRedmine { id });
        Ok(id)
    }

    async fn update_issue(&self, issue_id: i64, patch: &RedmineIssuePatch) -> TrackerResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut issues = self.issues.lock().unwrap();
        let Some(view) = issues.get_mut(&issue_id) else {
            return Err(TrackerError::NotFound);
        };
        if let Some(subject) = &patch.subject {
            view.title = subject.clone();
        }
        if let Some(description) = &patch.description {
            view.description = Some(description.clone());
        }
        if let Some(tracker_id) = patch.tracker_id {
            if let Some(name) = self.tracker_name(tracker_id) {
                view.labels = vec![name];
            }
        }
        if let Some(status_id) = patch.status_id {
            view.state = if self.status_is_closed(status_id) {
                IssueState::Closed
            } else {
                IssueState::Open
            };
        }
        if let Some(assignee) = patch.assigned_to_id {
            view.assignee_id = assignee;
        }
        if let Some(due_date) = patch.due_date {
            view.due_date = due_date;
        }
        self.mutations
            .lock()
            .unwrap()
            .push(Mutation::UpdateRedmine { id: issue_id });
        Ok(())
    }

    async fn list_trackers(&self) -> TrackerResult<Vec<(i64, String)>> {
        Ok(self.trackers.clone())
    }

    async fn list_statuses(&self) -> TrackerResult<Vec<(i64, String)>> {
        Ok(self.statuses.clone())
    }
}

// ---------------------------------------------------------------------------
// Mock GitLab
// ---------------------------------------------------------------------------

pub struct MockGitlab {
    pub project_paths: Mutex<HashMap<String, i64>>,
    pub members: Mutex<Vec<MemberView>>,
    pub issues: Mutex<HashMap<i64, IssueView>>,
    pub mutations: Mutex<Vec<Mutation>>,
    pub category_keys: Vec<String>,
    next_iid: AtomicI64,
}

impl MockGitlab {
    pub fn with_default_project() -> Self {
        Self {
            project_paths: Mutex::new(HashMap::from([(
                "group/alpha".to_string(),
                GITLAB_PROJECT_ID,
            )])),
            members: Mutex::new(Vec::new()),
            issues: Mutex::new(HashMap::new()),
            mutations: Mutex::new(Vec::new()),
            category_keys: vec![
                "Feature".to_string(),
                "Bug".to_string(),
                "Task".to_string(),
            ],
            next_iid: AtomicI64::new(1000),
        }
    }

    pub fn insert_issue(&self, view: IssueView) {
        self.issues.lock().unwrap().insert(view.id, view);
    }

    pub fn remove_issue(&self, iid: i64) {
        self.issues.lock().unwrap().remove(&iid);
    }

    pub fn issue(&self, iid: i64) -> Option<IssueView> {
        self.issues.lock().unwrap().get(&iid).cloned()
    }

    pub fn set_members(&self, members: Vec<MemberView>) {
        *self.members.lock().unwrap() = members;
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().unwrap().len()
    }

    /// Fold the raw label list the way the real adapter does.
    fn fold(&self, mut view: IssueView) -> IssueView {
        view.labels = view
            .labels
            .iter()
            .find(|label| {
                self.category_keys
                    .iter()
                    .any(|key| key.eq_ignore_ascii_case(label))
            })
            .map(|label| vec![label.clone()])
            .unwrap_or_default();
        view
    }
}

#[async_trait]
impl GitlabApi for MockGitlab {
    async fn resolve_project_id(&self, path_with_namespace: &str) -> TrackerResult<i64> {
        self.project_paths
            .lock()
            .unwrap()
            .get(path_with_namespace)
            .copied()
            .ok_or(TrackerError::NotFound)
    }

    async fn list_members(&self, _project_id: i64) -> TrackerResult<Vec<MemberView>> {
        Ok(self.members.lock().unwrap().clone())
    }

    async fn list_issues(&self, _project_id: i64) -> TrackerResult<Vec<IssueView>> {
        let mut views: Vec<IssueView> = self
            .issues
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(|view| self.fold(view))
            .collect();
        views.sort_by_key(|view| view.id);
        Ok(views)
    }

    async fn get_issue(&self, _project_id: i64, issue_iid: i64) -> TrackerResult<IssueView> {
        self.issues
            .lock()
            .unwrap()
            .get(&issue_iid)
            .cloned()
            .map(|view| self.fold(view))
            .ok_or(TrackerError::NotFound)
    }

    async fn create_issue(
        &self,
        _project_id: i64,
        draft: &GitlabIssueDraft,
    ) -> TrackerResult<i64> {
        let iid = self.next_iid.fetch_add(1, Ordering::SeqCst);
        let view = IssueView {
            id: iid,
            title: draft.title.clone(),
            description: draft.description.clone(),
            labels: draft.labels.clone(),
            assignee_id: draft.assignee_ids.as_ref().and_then(|ids| ids.first().copied()),
            due_date: draft.due_date,
            state: IssueState::Open,
            updated_at: ts(1_700_000_000),
            web_url: Some(format!("{GITLAB_WEB_BASE}/-/issues/{iid}")),
        };
        self.issues.lock().unwrap().insert(iid, view);
        self.mutations
            .lock()
            .unwrap()
            .push(Mutation::CreateGitlab { iid });
        Ok(iid)
    }

    async fn update_issue(
        &self,
        _project_id: i64,
        issue_iid: i64,
        patch: &GitlabIssuePatch,
    ) -> TrackerResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut issues = self.issues.lock().unwrap();
        let Some(view) = issues.get_mut(&issue_iid) else {
            return Err(TrackerError::NotFound);
        };
        if let Some(title) = &patch.title {
            view.title = title.clone();
        }
        if let Some(description) = &patch.description {
            view.description = Some(description.clone());
        }
        if let Some(remove) = &patch.remove_labels {
            view.labels
                .retain(|label| !remove.iter().any(|gone| gone.eq_ignore_ascii_case(label)));
        }
        if let Some(add) = &patch.add_labels {
            for label in add {
                if !view.labels.iter().any(|have| have.eq_ignore_ascii_case(label)) {
                    view.labels.push(label.clone());
                }
            }
        }
        if let Some(assignee_ids) = &patch.assignee_ids {
            view.assignee_id = assignee_ids.first().copied();
        }
        if let Some(due_date) = patch.due_date {
            view.due_date = due_date;
        }
        if let Some(event) = &patch.state_event {
            view.state = if event == "close" {
                IssueState::Closed
            } else {
                IssueState::Open
            };
        }
        self.mutations
            .lock()
            .unwrap()
            .push(Mutation::UpdateGitlab { iid: issue_iid });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn test_config() -> BridgeConfig {
    serde_json::from_value(serde_json::json!({
        "redmine": {
            "base_url": "https://redmine.example.com",
            "api_key": "test-key"
        },
        "gitlab": {
            "base_url": "https://gitlab.example.com",
            "token": "test-token"
        },
        "category_keys": ["Feature", "Bug", "Task"],
        "storage": { "connection_string": "sqlite://unused.db" }
    }))
    .expect("test config parses")
}

pub struct TestHarness {
    pub pool: SqlitePool,
    pub redmine: Arc<MockRedmine>,
    pub gitlab: Arc<MockGitlab>,
    pub engine: SyncEngine,
    _temp_dir: TempDir,
}

pub async fn harness() -> TestHarness {
    let (pool, temp_dir) = create_test_pool().await;
    let redmine = Arc::new(MockRedmine::with_default_project());
    let gitlab = Arc::new(MockGitlab::with_default_project());
    let engine = SyncEngine::new(
        pool.clone(),
        redmine.clone(),
        gitlab.clone(),
        test_config(),
    );
    TestHarness {
        pool,
        redmine,
        gitlab,
        engine,
        _temp_dir: temp_dir,
    }
}

pub async fn run_pass(harness: &TestHarness) -> PassSummary {
    harness
        .engine
        .run_pass(&CancellationToken::new())
        .await
        .expect("pass succeeds")
}
