//! Three-way convergence of issue pairs.
//!
//! Per link per pass: observe both live views (listing hints first, probe
//! otherwise), normalize backlinks so description equality compares the
//! payload, classify both sides against the canonical snapshot, and either
//! copy the single writer's state across or merge field-by-field. Patches
//! carry only fields that differ; the canonical snapshot advances only after
//! every required patch succeeded, so a failed patch is retried by the next
//! pass with the same delta.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use db::models::issue_link::{CanonicalSnapshot, IssueLink, SNAPSHOT_VERSION};
use db::models::project::LinkedProject;
use sqlx::SqlitePool;
use trackers::{
    GitlabApi, GitlabIssuePatch, IssueState, IssueView, RedmineApi, RedmineIssuePatch,
    TrackerError,
};
use uuid::Uuid;

use super::backlink;
use super::member_correlator::UserLinkMaps;
use super::pair_discovery::ProjectIssues;
use super::reference_cache::ReferenceCache;

/// The synchronized fields, in classification order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    Title,
    Description,
    Labels,
    Assignee,
    DueDate,
    State,
}

pub(crate) const FIELDS: [Field; 6] = [
    Field::Title,
    Field::Description,
    Field::Labels,
    Field::Assignee,
    Field::DueDate,
    Field::State,
];

/// Neutral, comparison-ready projection of one side of a pair.
///
/// The description is the backlink-stripped payload (absence is the empty
/// payload); the assignee is translated to the correlation-row id so both
/// sides compare in a common vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IssueFields {
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub assignee: Option<Uuid>,
    pub due_date: Option<NaiveDate>,
    pub state: IssueState,
    pub updated_at: Option<DateTime<Utc>>,
}

impl IssueFields {
    pub fn from_redmine(view: &IssueView, users: &UserLinkMaps, category_keys: &[String]) -> Self {
        Self {
            title: view.title.clone(),
            description: backlink::payload(view.description.as_deref()),
            labels: normalize_labels(&view.labels, category_keys),
            assignee: view.assignee_id.and_then(|id| users.link_for_redmine(id)),
            due_date: view.due_date,
            state: view.state,
            updated_at: view.updated_at,
        }
    }

    pub fn from_gitlab(view: &IssueView, users: &UserLinkMaps, category_keys: &[String]) -> Self {
        Self {
            title: view.title.clone(),
            description: backlink::payload(view.description.as_deref()),
            labels: normalize_labels(&view.labels, category_keys),
            assignee: view.assignee_id.and_then(|id| users.link_for_gitlab(id)),
            due_date: view.due_date,
            state: view.state,
            updated_at: view.updated_at,
        }
    }

    pub fn from_snapshot(snapshot: &CanonicalSnapshot) -> Self {
        Self {
            title: snapshot.title.clone(),
            description: snapshot.description.clone().unwrap_or_default(),
            labels: snapshot.labels.clone(),
            assignee: snapshot.assignee,
            due_date: snapshot.due_date,
            state: snapshot.state,
            updated_at: snapshot.updated_at,
        }
    }

    pub fn to_snapshot(&self) -> CanonicalSnapshot {
        CanonicalSnapshot {
            version: SNAPSHOT_VERSION,
            title: self.title.clone(),
            description: if self.description.is_empty() {
                None
            } else {
                Some(self.description.clone())
            },
            labels: self.labels.clone(),
            assignee: self.assignee,
            due_date: self.due_date,
            state: self.state,
            updated_at: self.updated_at,
        }
    }
}

fn label_set(labels: &[String]) -> BTreeSet<String> {
    labels.iter().map(|label| label.to_lowercase()).collect()
}

/// Project a label list onto the category vocabulary: the first label in
/// the vocabulary, or nothing. A tracker outside the vocabulary compares
/// as "no category" on both sides, so such pairs stay converged instead of
/// oscillating between a name one platform cannot represent.
fn normalize_labels(labels: &[String], category_keys: &[String]) -> Vec<String> {
    labels
        .iter()
        .find(|label| {
            category_keys
                .iter()
                .any(|key| key.eq_ignore_ascii_case(label))
        })
        .map(|label| vec![label.clone()])
        .unwrap_or_default()
}

/// Field-wise value equality, the basis of every merge decision.
pub(crate) fn field_eq(a: &IssueFields, b: &IssueFields, field: Field) -> bool {
    match field {
        Field::Title => a.title == b.title,
        Field::Description => a.description == b.description,
        Field::Labels => label_set(&a.labels) == label_set(&b.labels),
        Field::Assignee => a.assignee == b.assignee,
        Field::DueDate => a.due_date == b.due_date,
        Field::State => a.state == b.state,
    }
}

pub(crate) fn fields_differ(a: &IssueFields, b: &IssueFields) -> bool {
    FIELDS.iter().any(|field| !field_eq(a, b, *field))
}

fn assign_field(target: &mut IssueFields, source: &IssueFields, field: Field) {
    match field {
        Field::Title => target.title = source.title.clone(),
        Field::Description => target.description = source.description.clone(),
        Field::Labels => target.labels = source.labels.clone(),
        Field::Assignee => target.assignee = source.assignee,
        Field::DueDate => target.due_date = source.due_date,
        Field::State => target.state = source.state,
    }
}

/// Compose the winner of a both-sides conflict.
///
/// Per field: a change on exactly one side wins outright; a change on both
/// sides goes to the side with the greater `updated_at`, ties to GitLab.
pub(crate) fn merge(a: &IssueFields, b: &IssueFields, canonical: &IssueFields) -> IssueFields {
    let prefer_b = match (a.updated_at, b.updated_at) {
        (Some(at), Some(bt)) => bt >= at,
        (Some(_), None) => false,
        _ => true,
    };

    let mut winner = canonical.clone();
    for field in FIELDS {
        let a_changed = !field_eq(a, canonical, field);
        let b_changed = !field_eq(b, canonical, field);
        let source = match (a_changed, b_changed) {
            (false, false) => continue,
            (true, false) => a,
            (false, true) => b,
            (true, true) => {
                if prefer_b {
                    b
                } else {
                    a
                }
            }
        };
        assign_field(&mut winner, source, field);
    }
    winner.updated_at = a.updated_at.max(b.updated_at);
    winner
}

/// Build the Redmine patch that moves `current` to `target`, translating
/// names and neutral ids into Redmine's numeric vocabulary at patch time.
/// Untranslatable fields are logged and omitted rather than failing the
/// pair.
///
/// The description is compared as raw remote text against the backlinked
/// target text, so a missing or stale `Source:` line is rewritten even when
/// the payloads already agree.
pub(crate) fn build_redmine_patch(
    reference: &ReferenceCache,
    users: &UserLinkMaps,
    current: &IssueFields,
    current_raw_description: Option<&str>,
    target: &IssueFields,
    gitlab_url: &str,
) -> RedmineIssuePatch {
    let mut patch = RedmineIssuePatch::default();

    if !field_eq(current, target, Field::Title) {
        patch.subject = Some(target.title.clone());
    }
    let desired_description = backlink::apply(gitlab_url, Some(&target.description));
    if current_raw_description.unwrap_or("") != desired_description {
        patch.description = Some(desired_description);
    }
    if !field_eq(current, target, Field::Labels) {
        match target.labels.first() {
            Some(name) => match reference.tracker_id(name) {
                Some(tracker_id) => patch.tracker_id = Some(tracker_id),
                None => {
                    tracing::warn!(label = %name, "No Redmine tracker with this name; leaving tracker untouched");
                }
            },
            // Redmine issues always carry a tracker; there is nothing to
            // translate an empty label set to.
            None => {}
        }
    }
    if !field_eq(current, target, Field::State) {
        match reference.status_id(target.state) {
            Some(status_id) => patch.status_id = Some(status_id),
            None => {
                tracing::warn!(state = ?target.state, "Redmine status vocabulary is missing the mapped name; leaving status untouched");
            }
        }
    }
    if !field_eq(current, target, Field::Assignee) {
        match target.assignee {
            Some(link_id) => match users.redmine_for_link(link_id) {
                Some(user_id) => patch.assigned_to_id = Some(Some(user_id)),
                None => {
                    tracing::warn!(%link_id, "Assignee has no Redmine account correlated; leaving assignee untouched");
                }
            },
            None => patch.assigned_to_id = Some(None),
        }
    }
    if !field_eq(current, target, Field::DueDate) {
        patch.due_date = Some(target.due_date);
    }

    patch
}

/// Symmetric GitLab patch builder. Category labels are written lowercased;
/// labels outside the category vocabulary are untouched by construction
/// (`add_labels`/`remove_labels`).
pub(crate) fn build_gitlab_patch(
    users: &UserLinkMaps,
    current: &IssueFields,
    current_raw_description: Option<&str>,
    target: &IssueFields,
    redmine_url: &str,
) -> GitlabIssuePatch {
    let mut patch = GitlabIssuePatch::default();

    if !field_eq(current, target, Field::Title) {
        patch.title = Some(target.title.clone());
    }
    let desired_description = backlink::apply(redmine_url, Some(&target.description));
    if current_raw_description.unwrap_or("") != desired_description {
        patch.description = Some(desired_description);
    }
    if !field_eq(current, target, Field::Labels) {
        if let Some(label) = target.labels.first() {
            patch.add_labels = Some(vec![label.to_lowercase()]);
        }
        if let Some(label) = current.labels.first() {
            patch.remove_labels = Some(vec![label.clone()]);
        }
    }
    if !field_eq(current, target, Field::State) {
        patch.state_event = Some(
            match target.state {
                IssueState::Closed => "close",
                IssueState::Open => "reopen",
            }
            .to_string(),
        );
    }
    if !field_eq(current, target, Field::Assignee) {
        match target.assignee {
            Some(link_id) => match users.gitlab_for_link(link_id) {
                Some(user_id) => patch.assignee_ids = Some(vec![user_id]),
                None => {
                    tracing::warn!(%link_id, "Assignee has no GitLab account correlated; leaving assignee untouched");
                }
            },
            None => patch.assignee_ids = Some(Vec::new()),
        }
    }
    if !field_eq(current, target, Field::DueDate) {
        patch.due_date = Some(target.due_date);
    }

    patch
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Links already converged; nothing was sent.
    pub unchanged: usize,
    /// Links that required at least one patch.
    pub patched: usize,
    /// Links removed because a counterpart is gone.
    pub deleted: usize,
    /// Links skipped this pass (transient or rejected patches); the
    /// canonical was not advanced so the next pass retries.
    pub failed: usize,
}

enum LinkOutcome {
    Unchanged,
    Patched,
    Deleted,
    Failed,
}

pub struct Reconciler<'a> {
    pool: &'a SqlitePool,
    redmine: &'a dyn RedmineApi,
    gitlab: &'a dyn GitlabApi,
    reference: &'a ReferenceCache,
    users: &'a UserLinkMaps,
    category_keys: &'a [String],
    redmine_public_url: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        redmine: &'a dyn RedmineApi,
        gitlab: &'a dyn GitlabApi,
        reference: &'a ReferenceCache,
        users: &'a UserLinkMaps,
        category_keys: &'a [String],
        redmine_public_url: &'a str,
    ) -> Self {
        Self {
            pool,
            redmine,
            gitlab,
            reference,
            users,
            category_keys,
            redmine_public_url,
        }
    }

    /// Reconcile every link of a project. Per-link failures degrade to
    /// "retried next pass"; only storage errors propagate.
    pub async fn reconcile_project(
        &self,
        project: &LinkedProject,
        issues: &ProjectIssues,
    ) -> Result<ReconcileOutcome, sqlx::Error> {
        let links = IssueLink::find_by_project(self.pool, project.id).await?;

        let redmine_hints: HashMap<i64, &IssueView> =
            issues.redmine.iter().map(|view| (view.id, view)).collect();
        let gitlab_hints: HashMap<i64, &IssueView> =
            issues.gitlab.iter().map(|view| (view.id, view)).collect();

        let mut outcome = ReconcileOutcome::default();
        for link in &links {
            match self
                .reconcile_link(project, link, &redmine_hints, &gitlab_hints)
                .await?
            {
                LinkOutcome::Unchanged => outcome.unchanged += 1,
                LinkOutcome::Patched => outcome.patched += 1,
                LinkOutcome::Deleted => outcome.deleted += 1,
                LinkOutcome::Failed => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }

    async fn reconcile_link(
        &self,
        project: &LinkedProject,
        link: &IssueLink,
        redmine_hints: &HashMap<i64, &IssueView>,
        gitlab_hints: &HashMap<i64, &IssueView>,
    ) -> Result<LinkOutcome, sqlx::Error> {
        // Observe both sides. NotFound deletes the link (and nothing else:
        // deletions never propagate to the counterpart).
        let redmine_view = match redmine_hints.get(&link.redmine_issue_id) {
            Some(view) => (*view).clone(),
            None => match self.redmine.get_issue(link.redmine_issue_id).await {
                Ok(view) => view,
                Err(TrackerError::NotFound) => {
                    tracing::info!(
                        redmine_issue_id = link.redmine_issue_id,
                        gitlab_issue_iid = link.gitlab_issue_iid,
                        "Redmine issue is gone; dropping link"
                    );
                    IssueLink::delete(self.pool, link.id).await?;
                    return Ok(LinkOutcome::Deleted);
                }
                Err(e) => {
                    tracing::warn!(
                        redmine_issue_id = link.redmine_issue_id,
                        error = %e,
                        "Could not observe Redmine side; retrying next pass"
                    );
                    return Ok(LinkOutcome::Failed);
                }
            },
        };
        let gitlab_view = match gitlab_hints.get(&link.gitlab_issue_iid) {
            Some(view) => (*view).clone(),
            None => match self
                .gitlab
                .get_issue(project.gitlab_id, link.gitlab_issue_iid)
                .await
            {
                Ok(view) => view,
                Err(TrackerError::NotFound) => {
                    tracing::info!(
                        redmine_issue_id = link.redmine_issue_id,
                        gitlab_issue_iid = link.gitlab_issue_iid,
                        "GitLab issue is gone; dropping link"
                    );
                    IssueLink::delete(self.pool, link.id).await?;
                    return Ok(LinkOutcome::Deleted);
                }
                Err(e) => {
                    tracing::warn!(
                        gitlab_issue_iid = link.gitlab_issue_iid,
                        error = %e,
                        "Could not observe GitLab side; retrying next pass"
                    );
                    return Ok(LinkOutcome::Failed);
                }
            },
        };

        let a = IssueFields::from_redmine(&redmine_view, self.users, self.category_keys);
        let b = IssueFields::from_gitlab(&gitlab_view, self.users, self.category_keys);

        let redmine_url = format!(
            "{}/issues/{}",
            self.redmine_public_url.trim_end_matches('/'),
            link.redmine_issue_id
        );
        let gitlab_url = gitlab_view.web_url.clone().unwrap_or_else(|| {
            format!(
                "{}/-/issues/{}",
                project.url.trim_end_matches('/'),
                link.gitlab_issue_iid
            )
        });

        let Some(snapshot) = &link.canonical_snapshot else {
            // First observation of this pair: GitLab is the initial source
            // of truth. Push Redmine toward it and record the base.
            return self
                .first_observe(link, &a, redmine_view.description.as_deref(), &b, &gitlab_url)
                .await;
        };
        let canonical = IssueFields::from_snapshot(snapshot);

        let a_changed = fields_differ(&a, &canonical);
        let b_changed = fields_differ(&b, &canonical);

        match (a_changed, b_changed) {
            (false, false) => Ok(LinkOutcome::Unchanged),
            (true, false) => {
                let patch = build_gitlab_patch(
                    self.users,
                    &b,
                    gitlab_view.description.as_deref(),
                    &a,
                    &redmine_url,
                );
                if !patch.is_empty() {
                    if let Err(e) = self
                        .gitlab
                        .update_issue(project.gitlab_id, link.gitlab_issue_iid, &patch)
                        .await
                    {
                        tracing::warn!(
                            gitlab_issue_iid = link.gitlab_issue_iid,
                            error = %e,
                            "GitLab patch failed; canonical not advanced"
                        );
                        return Ok(LinkOutcome::Failed);
                    }
                }
                IssueLink::advance_canonical(self.pool, link.id, &a.to_snapshot()).await?;
                Ok(LinkOutcome::Patched)
            }
            (false, true) => {
                let patch = build_redmine_patch(
                    self.reference,
                    self.users,
                    &a,
                    redmine_view.description.as_deref(),
                    &b,
                    &gitlab_url,
                );
                if !patch.is_empty() {
                    if let Err(e) = self
                        .redmine
                        .update_issue(link.redmine_issue_id, &patch)
                        .await
                    {
                        tracing::warn!(
                            redmine_issue_id = link.redmine_issue_id,
                            error = %e,
                            "Redmine patch failed; canonical not advanced"
                        );
                        return Ok(LinkOutcome::Failed);
                    }
                }
                IssueLink::advance_canonical(self.pool, link.id, &b.to_snapshot()).await?;
                Ok(LinkOutcome::Patched)
            }
            (true, true) => {
                let winner = merge(&a, &b, &canonical);
                tracing::info!(
                    redmine_issue_id = link.redmine_issue_id,
                    gitlab_issue_iid = link.gitlab_issue_iid,
                    "Both sides changed; merging field-wise"
                );

                let redmine_patch = build_redmine_patch(
                    self.reference,
                    self.users,
                    &a,
                    redmine_view.description.as_deref(),
                    &winner,
                    &gitlab_url,
                );
                let gitlab_patch = build_gitlab_patch(
                    self.users,
                    &b,
                    gitlab_view.description.as_deref(),
                    &winner,
                    &redmine_url,
                );

                if !redmine_patch.is_empty() {
                    if let Err(e) = self
                        .redmine
                        .update_issue(link.redmine_issue_id, &redmine_patch)
                        .await
                    {
                        tracing::warn!(
                            redmine_issue_id = link.redmine_issue_id,
                            error = %e,
                            "Redmine merge patch failed; canonical not advanced"
                        );
                        return Ok(LinkOutcome::Failed);
                    }
                }
                if !gitlab_patch.is_empty() {
                    if let Err(e) = self
                        .gitlab
                        .update_issue(project.gitlab_id, link.gitlab_issue_iid, &gitlab_patch)
                        .await
                    {
                        tracing::warn!(
                            gitlab_issue_iid = link.gitlab_issue_iid,
                            error = %e,
                            "GitLab merge patch failed; canonical not advanced"
                        );
                        return Ok(LinkOutcome::Failed);
                    }
                }

                IssueLink::advance_canonical(self.pool, link.id, &winner.to_snapshot()).await?;
                Ok(LinkOutcome::Patched)
            }
        }
    }

    async fn first_observe(
        &self,
        link: &IssueLink,
        a: &IssueFields,
        a_raw_description: Option<&str>,
        b: &IssueFields,
        gitlab_url: &str,
    ) -> Result<LinkOutcome, sqlx::Error> {
        let patch =
            build_redmine_patch(self.reference, self.users, a, a_raw_description, b, gitlab_url);
        let patched = !patch.is_empty();
        if patched {
            if let Err(e) = self
                .redmine
                .update_issue(link.redmine_issue_id, &patch)
                .await
            {
                tracing::warn!(
                    redmine_issue_id = link.redmine_issue_id,
                    error = %e,
                    "First-observe patch failed; snapshot not recorded"
                );
                return Ok(LinkOutcome::Failed);
            }
        }
        IssueLink::advance_canonical(self.pool, link.id, &b.to_snapshot()).await?;
        if patched {
            Ok(LinkOutcome::Patched)
        } else {
            Ok(LinkOutcome::Unchanged)
        }
    }
}
