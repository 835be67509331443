//! One full pass of the pipeline.
//!
//! Order matters: the reference cache refresh completes before any patch is
//! built, and pair discovery for a project completes before that project's
//! reconciliation. Errors are caught per project; storage errors and global
//! setup failures (vocabulary refresh, project listing) fail the pass.

use std::sync::Arc;

use db::models::project::{LinkedProject, Project};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trackers::{GitlabApi, RedmineApi, TrackerError};

use super::config::BridgeConfig;
use super::member_correlator::{self, UserLinkMaps};
use super::pair_discovery::{PairDiscovery, ProjectIssues};
use super::project_discovery::{ProjectDiscovery, ProjectDiscoveryError};
use super::reconciler::Reconciler;
use super::reference_cache::{self, ReferenceCache, ReferenceCacheError};

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Reference(#[from] ReferenceCacheError),
    #[error(transparent)]
    Discovery(#[from] ProjectDiscoveryError),
    #[error("pass cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
enum ProjectSyncError {
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error("failed to fetch members: {0}")]
    Members(TrackerError),
    #[error("failed to list issues: {0}")]
    Issues(TrackerError),
}

#[derive(Debug, Default)]
pub struct PassSummary {
    pub projects: usize,
    pub failed_projects: usize,
    pub users_correlated: usize,
    pub pairs_seeded: usize,
    pub pairs_created: usize,
    pub links_patched: usize,
    pub links_deleted: usize,
    pub links_failed: usize,
}

/// The long-lived engine: owns the construction graph below the process
/// host and executes passes on demand.
pub struct SyncEngine {
    pool: SqlitePool,
    redmine: Arc<dyn RedmineApi>,
    gitlab: Arc<dyn GitlabApi>,
    config: BridgeConfig,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        redmine: Arc<dyn RedmineApi>,
        gitlab: Arc<dyn GitlabApi>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            pool,
            redmine,
            gitlab,
            config,
        }
    }

    /// Run one pass: reference refresh, project discovery, then per linked
    /// project member correlation, pair discovery, and reconciliation.
    ///
    /// Cancellation is observed between projects; a cancelled pass leaves
    /// partial work committed (snapshots already advanced are valid) and
    /// reports [`PassError::Cancelled`] so the driver does not record a
    /// success.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassSummary, PassError> {
        let reference = reference_cache::refresh(&self.pool, self.redmine.as_ref()).await?;

        let discovery = ProjectDiscovery::new(
            &self.pool,
            self.redmine.as_ref(),
            self.gitlab.as_ref(),
            &self.config.redmine.custom_field_name,
        );
        let linked = discovery.run().await?;

        let mut summary = PassSummary::default();
        for project in &linked {
            if cancel.is_cancelled() {
                return Err(PassError::Cancelled);
            }
            summary.projects += 1;
            match self.sync_project(project, &reference).await {
                Ok(report) => {
                    summary.users_correlated += report.correlated;
                    summary.pairs_seeded += report.seeded;
                    summary.pairs_created += report.created;
                    summary.links_patched += report.patched;
                    summary.links_deleted += report.deleted;
                    summary.links_failed += report.failed;
                    Project::touch_last_sync(&self.pool, project.id).await?;
                }
                Err(ProjectSyncError::Storage(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(
                        project = %project.redmine_key,
                        error = %e,
                        "Skipping project for this pass"
                    );
                    summary.failed_projects += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn sync_project(
        &self,
        project: &LinkedProject,
        reference: &ReferenceCache,
    ) -> Result<ProjectReport, ProjectSyncError> {
        let redmine_members = self
            .redmine
            .list_members(project.redmine_id)
            .await
            .map_err(ProjectSyncError::Members)?;
        let gitlab_members = self
            .gitlab
            .list_members(project.gitlab_id)
            .await
            .map_err(ProjectSyncError::Members)?;
        let correlated =
            member_correlator::correlate_members(&self.pool, &redmine_members, &gitlab_members)
                .await?;

        let users = UserLinkMaps::load(&self.pool).await?;

        let mut issues = ProjectIssues {
            redmine: self
                .redmine
                .list_issues(project.redmine_id)
                .await
                .map_err(ProjectSyncError::Issues)?,
            gitlab: self
                .gitlab
                .list_issues(project.gitlab_id)
                .await
                .map_err(ProjectSyncError::Issues)?,
        };

        let discovery = PairDiscovery::new(
            &self.pool,
            self.redmine.as_ref(),
            self.gitlab.as_ref(),
            reference,
            &users,
            &self.config.category_keys,
            self.config.redmine_public_url(),
        );
        let discovered = discovery.run(project, &mut issues).await?;

        let reconciler = Reconciler::new(
            &self.pool,
            self.redmine.as_ref(),
            self.gitlab.as_ref(),
            reference,
            &users,
            &self.config.category_keys,
            self.config.redmine_public_url(),
        );
        let reconciled = reconciler.reconcile_project(project, &issues).await?;

        info!(
            project = %project.redmine_key,
            correlated = correlated.inserted,
            seeded = discovered.seeded,
            created = discovered.created_gitlab + discovered.created_redmine,
            swept = discovered.swept,
            patched = reconciled.patched,
            unchanged = reconciled.unchanged,
            deleted = reconciled.deleted,
            failed = reconciled.failed,
            "Project pass complete"
        );
        Ok(ProjectReport {
            correlated: correlated.inserted,
            seeded: discovered.seeded,
            created: discovered.created_gitlab + discovered.created_redmine,
            patched: reconciled.patched,
            deleted: discovered.swept + reconciled.deleted,
            failed: reconciled.failed,
        })
    }
}

#[derive(Debug, Default)]
struct ProjectReport {
    correlated: usize,
    seeded: usize,
    created: usize,
    patched: usize,
    deleted: usize,
    failed: usize,
}
