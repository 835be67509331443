//! Project discovery.
//!
//! Walks Redmine's project list looking for a repository URL in the
//! configured custom field, upserts the project pair, and resolves the
//! numeric GitLab project id. Resolution failures leave the project
//! unlinked until a later pass; projects without a parseable custom field
//! are silently skipped.

use db::models::project::{GitlabProject, LinkedProject, Project};
use sqlx::SqlitePool;
use thiserror::Error;
use trackers::{GitlabApi, RedmineApi, TrackerError};
use url::Url;

#[derive(Debug, Error)]
pub enum ProjectDiscoveryError {
    #[error("failed to list Redmine projects: {0}")]
    Remote(#[from] TrackerError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct ProjectDiscovery<'a> {
    pool: &'a SqlitePool,
    redmine: &'a dyn RedmineApi,
    gitlab: &'a dyn GitlabApi,
    custom_field_name: &'a str,
}

impl<'a> ProjectDiscovery<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        redmine: &'a dyn RedmineApi,
        gitlab: &'a dyn GitlabApi,
        custom_field_name: &'a str,
    ) -> Self {
        Self {
            pool,
            redmine,
            gitlab,
            custom_field_name,
        }
    }

    /// Discover and link projects, returning every project ready for
    /// reconciliation (including ones linked on earlier passes).
    pub async fn run(&self) -> Result<Vec<LinkedProject>, ProjectDiscoveryError> {
        let remote_projects = self.redmine.list_projects().await?;

        for remote in &remote_projects {
            let Some(raw) = remote.custom_field(self.custom_field_name) else {
                continue;
            };
            let Some((path_with_namespace, repo_url)) = parse_repo_url(raw) else {
                tracing::debug!(
                    project = %remote.identifier,
                    value = %raw,
                    "Custom field does not hold a repository URL; skipping"
                );
                continue;
            };

            let project = Project::upsert(self.pool, remote.id, &remote.identifier).await?;
            let gitlab_project =
                GitlabProject::upsert(self.pool, project.id, &path_with_namespace, &repo_url)
                    .await?;

            if gitlab_project.gitlab_id.is_none() {
                match self.gitlab.resolve_project_id(&path_with_namespace).await {
                    Ok(gitlab_id) => {
                        GitlabProject::set_gitlab_id(self.pool, project.id, gitlab_id).await?;
                        tracing::info!(
                            project = %remote.identifier,
                            path = %path_with_namespace,
                            gitlab_id,
                            "Linked project to GitLab"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            project = %remote.identifier,
                            path = %path_with_namespace,
                            error = %e,
                            "Could not resolve GitLab project id; project stays unlinked"
                        );
                    }
                }
            }
        }

        Ok(Project::find_linked(self.pool).await?)
    }
}

/// Parse a custom-field value into `(path_with_namespace, canonical URL)`.
/// Accepts absolute http(s) URLs, strips a trailing `.git`.
pub(crate) fn parse_repo_url(raw: &str) -> Option<(String, String)> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;

    let path = url.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    if path.is_empty() {
        return None;
    }

    let mut base = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        base.push_str(&format!(":{port}"));
    }
    Some((path.to_string(), format!("{base}/{path}")))
}
