//! Pair discovery: seeding, stale-link sweeping, and create-missing.
//!
//! Works from one unfiltered issue listing per side per pass. The category
//! filter applies to seeding and create-missing candidates only, so links
//! whose live state drifted outside the vocabulary keep reconciling, and
//! the existence sweep checks against the complete lists. The sweep runs
//! before create-missing so a deleted remote is not resurrected.

use std::collections::{HashMap, HashSet};

use db::models::issue_link::{IssueLink, IssueLinkError};
use db::models::project::LinkedProject;
use sqlx::SqlitePool;
use trackers::{
    GitlabApi, GitlabIssueDraft, GitlabIssuePatch, IssueState, IssueView, RedmineApi,
    RedmineIssueDraft, TrackerError,
};

use super::backlink;
use super::member_correlator::UserLinkMaps;
use super::reference_cache::ReferenceCache;

/// Unfiltered per-project listings, used as reconciliation hints after
/// discovery appends the views of freshly created counterparts.
#[derive(Debug, Default)]
pub struct ProjectIssues {
    pub redmine: Vec<IssueView>,
    pub gitlab: Vec<IssueView>,
}

#[derive(Debug, Default)]
pub struct PairDiscoveryOutcome {
    pub seeded: usize,
    pub swept: usize,
    pub created_gitlab: usize,
    pub created_redmine: usize,
    pub skipped_conflicts: usize,
}

pub struct PairDiscovery<'a> {
    pool: &'a SqlitePool,
    redmine: &'a dyn RedmineApi,
    gitlab: &'a dyn GitlabApi,
    reference: &'a ReferenceCache,
    users: &'a UserLinkMaps,
    category_keys: &'a [String],
    redmine_public_url: &'a str,
}

impl<'a> PairDiscovery<'a> {
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

    /// First label when it lies in the category vocabulary.
    fn category_label<'v>(&self, view: &'v IssueView) -> Option<&'v str> {
        let first = view.labels.first()?;
        self.category_keys
            .iter()
            .any(|key| key.eq_ignore_ascii_case(first))
            .then_some(first.as_str())
    }

    fn redmine_issue_url(&self, issue_id: i64) -> String {
        format!(
            "{}/issues/{}",
            self.redmine_public_url.trim_end_matches('/'),
            issue_id
        )
    }

    fn gitlab_issue_url(&self, project: &LinkedProject, view: &IssueView) -> String {
        view.web_url.clone().unwrap_or_else(|| {
            format!("{}/-/issues/{}", project.url.trim_end_matches('/'), view.id)
        })
    }

    pub async fn run(
        &self,
        project: &LinkedProject,
        issues: &mut ProjectIssues,
    ) -> Result<PairDiscoveryOutcome, sqlx::Error> {
        let mut outcome = PairDiscoveryOutcome::default();

        let links = IssueLink::find_by_project(self.pool, project.id).await?;
        let mut mapped_redmine: HashSet<i64> =
            links.iter().map(|link| link.redmine_issue_id).collect();
        let mut mapped_gitlab: HashSet<i64> =
            links.iter().map(|link| link.gitlab_issue_iid).collect();

        self.seed_by_title(project, issues, &mut mapped_redmine, &mut mapped_gitlab, &mut outcome)
            .await?;
        self.sweep_stale_links(project, &links, issues, &mut outcome)
            .await?;
        self.create_missing_on_gitlab(project, issues, &mut mapped_redmine, &mut mapped_gitlab, &mut outcome)
            .await?;
        self.create_missing_on_redmine(project, issues, &mut mapped_redmine, &mut mapped_gitlab, &mut outcome)
            .await?;

        Ok(outcome)
    }

    /// Step 1: pair unmapped issues whose trimmed titles match uniquely.
    async fn seed_by_title(
        &self,
        project: &LinkedProject,
        issues: &ProjectIssues,
        mapped_redmine: &mut HashSet<i64>,
        mapped_gitlab: &mut HashSet<i64>,
        outcome: &mut PairDiscoveryOutcome,
    ) -> Result<(), sqlx::Error> {
        let mut gitlab_by_title: HashMap<String, Vec<i64>> = HashMap::new();
        for view in &issues.gitlab {
            if mapped_gitlab.contains(&view.id) || self.category_label(view).is_none() {
                continue;
            }
            gitlab_by_title
                .entry(view.title.trim().to_lowercase())
                .or_default()
                .push(view.id);
        }

        for view in &issues.redmine {
            if mapped_redmine.contains(&view.id) || self.category_label(view).is_none() {
                continue;
            }
            let key = view.title.trim().to_lowercase();
            let Some(candidates) = gitlab_by_title.get(&key) else {
                continue;
            };
            // Only a unique match to a single unmapped counterpart seeds
            let [gitlab_iid] = candidates.as_slice() else {
                continue;
            };
            if mapped_gitlab.contains(gitlab_iid) {
                continue;
            }
            match IssueLink::create(self.pool, project.id, view.id, *gitlab_iid).await {
                Ok(_) => {
                    tracing::info!(
                        redmine_issue_id = view.id,
                        gitlab_issue_iid = gitlab_iid,
                        title = %view.title,
                        "Seeded pair by title"
                    );
                    mapped_redmine.insert(view.id);
                    mapped_gitlab.insert(*gitlab_iid);
                    outcome.seeded += 1;
                }
                Err(IssueLinkError::AlreadyPaired) => {
                    tracing::warn!(
                        redmine_issue_id = view.id,
                        gitlab_issue_iid = gitlab_iid,
                        "Seed candidate already paired elsewhere; skipping"
                    );
                    outcome.skipped_conflicts += 1;
                }
                Err(IssueLinkError::Database(e)) => return Err(e),
            }
        }
        Ok(())
    }

    /// Step 2: confirm both sides of every link still exist; a side missing
    /// from its listing is probed directly, and NotFound drops the link.
    async fn sweep_stale_links(
        &self,
        project: &LinkedProject,
        links: &[IssueLink],
        issues: &mut ProjectIssues,
        outcome: &mut PairDiscoveryOutcome,
    ) -> Result<(), sqlx::Error> {
        let redmine_listed: HashSet<i64> = issues.redmine.iter().map(|view| view.id).collect();
        let gitlab_listed: HashSet<i64> = issues.gitlab.iter().map(|view| view.id).collect();

        for link in links {
            let mut gone = false;

            if !redmine_listed.contains(&link.redmine_issue_id) {
                match self.redmine.get_issue(link.redmine_issue_id).await {
                    Ok(view) => issues.redmine.push(view),
                    Err(TrackerError::NotFound) => gone = true,
                    Err(e) => {
                        tracing::warn!(
                            redmine_issue_id = link.redmine_issue_id,
                            error = %e,
                            "Existence probe failed; keeping link for now"
                        );
                    }
                }
            }
            if !gone && !gitlab_listed.contains(&link.gitlab_issue_iid) {
                match self
                    .gitlab
                    .get_issue(project.gitlab_id, link.gitlab_issue_iid)
                    .await
                {
                    Ok(view) => issues.gitlab.push(view),
                    Err(TrackerError::NotFound) => gone = true,
                    Err(e) => {
                        tracing::warn!(
                            gitlab_issue_iid = link.gitlab_issue_iid,
                            error = %e,
                            "Existence probe failed; keeping link for now"
                        );
                    }
                }
            }

            if gone {
                tracing::info!(
                    redmine_issue_id = link.redmine_issue_id,
                    gitlab_issue_iid = link.gitlab_issue_iid,
                    "Counterpart confirmed gone; dropping link"
                );
                IssueLink::delete(self.pool, link.id).await?;
                // Both ids stay in the mapped sets: the surviving side must
                // not be resurrected by create-missing in this pass.
                outcome.swept += 1;
            }
        }
        Ok(())
    }

    /// Step 3: create GitLab counterparts for unmapped Redmine issues in
    /// the category vocabulary.
    async fn create_missing_on_gitlab(
        &self,
        project: &LinkedProject,
        issues: &mut ProjectIssues,
        mapped_redmine: &mut HashSet<i64>,
        mapped_gitlab: &mut HashSet<i64>,
        outcome: &mut PairDiscoveryOutcome,
    ) -> Result<(), sqlx::Error> {
        let candidates: Vec<IssueView> = issues
            .redmine
            .iter()
            .filter(|view| !mapped_redmine.contains(&view.id))
            .filter(|view| self.category_label(view).is_some())
            .cloned()
            .collect();

        for view in candidates {
            let Some(label) = self.category_label(&view).map(str::to_lowercase) else {
                continue;
            };
            let draft = GitlabIssueDraft {
                title: view.title.clone(),
                description: Some(backlink::apply(
                    &self.redmine_issue_url(view.id),
                    view.description.as_deref(),
                )),
                labels: vec![label],
                assignee_ids: view
                    .assignee_id
                    .and_then(|id| self.users.link_for_redmine(id))
                    .and_then(|link_id| self.users.gitlab_for_link(link_id))
                    .map(|id| vec![id]),
                due_date: view.due_date,
            };

            let gitlab_iid = match self.gitlab.create_issue(project.gitlab_id, &draft).await {
                Ok(iid) => iid,
                Err(e) => {
                    tracing::warn!(
                        redmine_issue_id = view.id,
                        error = %e,
                        "Could not create GitLab counterpart; retrying next pass"
                    );
                    continue;
                }
            };
            // The create API only opens issues; closed ones need a follow-up
            if view.state == IssueState::Closed {
                let close = GitlabIssuePatch {
                    state_event: Some("close".to_string()),
                    ..Default::default()
                };
                if let Err(e) = self
                    .gitlab
                    .update_issue(project.gitlab_id, gitlab_iid, &close)
                    .await
                {
                    tracing::warn!(gitlab_issue_iid = gitlab_iid, error = %e, "Could not close created counterpart");
                }
            }

            match IssueLink::create(self.pool, project.id, view.id, gitlab_iid).await {
                Ok(_) => {
                    tracing::info!(
                        redmine_issue_id = view.id,
                        gitlab_issue_iid = gitlab_iid,
                        title = %view.title,
                        "Created GitLab counterpart"
                    );
                    mapped_redmine.insert(view.id);
                    mapped_gitlab.insert(gitlab_iid);
                    outcome.created_gitlab += 1;
                }
                Err(IssueLinkError::AlreadyPaired) => {
                    tracing::warn!(
                        redmine_issue_id = view.id,
                        "Issue got paired concurrently; skipping"
                    );
                    outcome.skipped_conflicts += 1;
                    continue;
                }
                Err(IssueLinkError::Database(e)) => return Err(e),
            }

            match self.gitlab.get_issue(project.gitlab_id, gitlab_iid).await {
                Ok(created) => issues.gitlab.push(created),
                Err(e) => {
                    tracing::warn!(gitlab_issue_iid = gitlab_iid, error = %e, "Could not fetch created counterpart; reconciler will probe");
                }
            }
        }
        Ok(())
    }

    /// Step 4: create Redmine counterparts for unmapped GitLab issues,
    /// picking the tracker from the matched category key.
    async fn create_missing_on_redmine(
        &self,
        project: &LinkedProject,
        issues: &mut ProjectIssues,
        mapped_redmine: &mut HashSet<i64>,
        mapped_gitlab: &mut HashSet<i64>,
        outcome: &mut PairDiscoveryOutcome,
    ) -> Result<(), sqlx::Error> {
        let candidates: Vec<IssueView> = issues
            .gitlab
            .iter()
            .filter(|view| !mapped_gitlab.contains(&view.id))
            .filter(|view| self.category_label(view).is_some())
            .cloned()
            .collect();

        for view in candidates {
            let Some(label) = self.category_label(&view) else {
                continue;
            };
            let Some(tracker_id) = self.reference.tracker_id(label) else {
                tracing::warn!(
                    gitlab_issue_iid = view.id,
                    label = %label,
                    "No Redmine tracker for this category; skipping creation"
                );
                continue;
            };

            let draft = RedmineIssueDraft {
                subject: view.title.clone(),
                description: Some(backlink::apply(
                    &self.gitlab_issue_url(project, &view),
                    view.description.as_deref(),
                )),
                tracker_id: Some(tracker_id),
                status_id: self.reference.status_id(view.state),
                assigned_to_id: view
                    .assignee_id
                    .and_then(|id| self.users.link_for_gitlab(id))
                    .and_then(|link_id| self.users.redmine_for_link(link_id)),
                due_date: view.due_date,
            };

            let redmine_id = match self.redmine.create_issue(project.redmine_id, &draft).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(
                        gitlab_issue_iid = view.id,
                        error = %e,
                        "Could not create Redmine counterpart; retrying next pass"
                    );
                    continue;
                }
            };

            match IssueLink::create(self.pool, project.id, redmine_id, view.id).await {
                Ok(_) => {
                    tracing::info!(
                        redmine_issue_id = redmine_id,
                        gitlab_issue_iid = view.id,
                        title = %view.title,
                        "Created Redmine counterpart"
                    );
                    mapped_redmine.insert(redmine_id);
                    mapped_gitlab.insert(view.id);
                    outcome.created_redmine += 1;
                }
                Err(IssueLinkError::AlreadyPaired) => {
                    tracing::warn!(
                        gitlab_issue_iid = view.id,
                        "Issue got paired concurrently; skipping"
                    );
                    outcome.skipped_conflicts += 1;
                    continue;
                }
                Err(IssueLinkError::Database(e)) => return Err(e),
            }

            match self.redmine.get_issue(redmine_id).await {
                Ok(created) => issues.redmine.push(created),
                Err(e) => {
                    tracing::warn!(redmine_issue_id = redmine_id, error = %e, "Could not fetch created counterpart; reconciler will probe");
                }
            }
        }
        Ok(())
    }
}
