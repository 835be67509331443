//! Project model: a Redmine project paired with its GitLab counterpart.
//!
//! A `Project` row is created by project discovery when a Redmine project
//! carries a repository URL in the configured custom field. The one-to-one
//! `GitlabProject` child holds the parsed URL; until its numeric `gitlab_id`
//! is resolved the project is *unlinked* and skipped by reconciliation.
//! Rows are updated in place and never deleted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("project not found")]
    NotFound,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub redmine_id: i64,
    pub redmine_key: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GitlabProject {
    pub id: Uuid,
    pub project_id: Uuid,
    pub gitlab_id: Option<i64>,
    pub path_with_namespace: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Joined view of a project whose GitLab id is resolved, ready for a pass.
#[derive(Debug, Clone, FromRow)]
pub struct LinkedProject {
    pub id: Uuid,
    pub redmine_id: i64,
    pub redmine_key: String,
    pub gitlab_id: i64,
    pub path_with_namespace: String,
    pub url: String,
}

impl Project {
    /// Insert or refresh the project for a Redmine id.
    pub async fn upsert(
        pool: &SqlitePool,
        redmine_id: i64,
        redmine_key: &str,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (id, redmine_id, redmine_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (redmine_id)
            DO UPDATE SET redmine_key = excluded.redmine_key,
                          updated_at = excluded.updated_at
            RETURNING id, redmine_id, redmine_key, last_sync_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(redmine_id)
        .bind(redmine_key)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"
            SELECT id, redmine_id, redmine_key, last_sync_at, created_at, updated_at
            FROM projects
            ORDER BY redmine_id ASC
            "#,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_redmine_id(
        pool: &SqlitePool,
        redmine_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"
            SELECT id, redmine_id, redmine_key, last_sync_at, created_at, updated_at
            FROM projects
            WHERE redmine_id = $1
            "#,
        )
        .bind(redmine_id)
        .fetch_optional(pool)
        .await
    }

    /// Record a completed pass for this project.
    pub async fn touch_last_sync(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE projects SET last_sync_at = $2, updated_at = $2 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// All projects whose GitLab counterpart is resolved.
    pub async fn find_linked(pool: &SqlitePool) -> Result<Vec<LinkedProject>, sqlx::Error> {
        sqlx::query_as::<_, LinkedProject>(
            r#"
            SELECT p.id, p.redmine_id, p.redmine_key,
                   g.gitlab_id, g.path_with_namespace, g.url
            FROM projects p
            INNER JOIN gitlab_projects g ON g.project_id = p.id
            WHERE g.gitlab_id IS NOT NULL
            ORDER BY p.redmine_id ASC
            "#,
        )
        .fetch_all(pool)
        .await
    }
}

impl GitlabProject {
    /// Insert or refresh the GitLab counterpart of a project.
    ///
    /// When the repository path changes, the resolved `gitlab_id` is cleared
    /// so the next pass re-resolves it against the new path.
    pub async fn upsert(
        pool: &SqlitePool,
        project_id: Uuid,
        path_with_namespace: &str,
        url: &str,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, GitlabProject>(
            r#"
            INSERT INTO gitlab_projects (id, project_id, path_with_namespace, url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (project_id)
            DO UPDATE SET
                gitlab_id = CASE
                    WHEN gitlab_projects.path_with_namespace = excluded.path_with_namespace
                    THEN gitlab_projects.gitlab_id
                    ELSE NULL
                END,
                path_with_namespace = excluded.path_with_namespace,
                url = excluded.url,
                updated_at = excluded.updated_at
            RETURNING id, project_id, gitlab_id, path_with_namespace, url, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(path_with_namespace)
        .bind(url)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn set_gitlab_id(
        pool: &SqlitePool,
        project_id: Uuid,
        gitlab_id: i64,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE gitlab_projects SET gitlab_id = $2, updated_at = $3 WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .bind(gitlab_id)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, GitlabProject>(
            r#"
            SELECT id, project_id, gitlab_id, path_with_namespace, url, created_at, updated_at
            FROM gitlab_projects
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_pool;

    #[tokio::test]
    async fn test_upsert_creates_then_updates_in_place() {
        let (pool, _temp_dir) = create_test_pool().await;

        let first = Project::upsert(&pool, 42, "infra").await.unwrap();
        assert_eq!(first.redmine_id, 42);
        assert_eq!(first.redmine_key, "infra");

        let second = Project::upsert(&pool, 42, "infrastructure").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.redmine_key, "infrastructure");

        let all = Project::find_all(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_redmine_id() {
        let (pool, _temp_dir) = create_test_pool().await;

        Project::upsert(&pool, 7, "alpha").await.unwrap();

        let found = Project::find_by_redmine_id(&pool, 7).await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().redmine_key, "alpha");

        let missing = Project::find_by_redmine_id(&pool, 8).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_touch_last_sync() {
        let (pool, _temp_dir) = create_test_pool().await;

        let project = Project::upsert(&pool, 7, "alpha").await.unwrap();
        assert!(project.last_sync_at.is_none());

        Project::touch_last_sync(&pool, project.id).await.unwrap();

        let reread = Project::find_by_redmine_id(&pool, 7).await.unwrap().unwrap();
        assert!(reread.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_gitlab_upsert_preserves_id_for_same_path() {
        let (pool, _temp_dir) = create_test_pool().await;

        let project = Project::upsert(&pool, 1, "alpha").await.unwrap();
        GitlabProject::upsert(&pool, project.id, "group/alpha", "https://gitlab.example.com/group/alpha")
            .await
            .unwrap();
        GitlabProject::set_gitlab_id(&pool, project.id, 900).await.unwrap();

        let same = GitlabProject::upsert(
            &pool,
            project.id,
            "group/alpha",
            "https://gitlab.example.com/group/alpha",
        )
        .await
        .unwrap();
        assert_eq!(same.gitlab_id, Some(900));
    }

    #[tokio::test]
    async fn test_gitlab_upsert_clears_id_on_path_change() {
        let (pool, _temp_dir) = create_test_pool().await;

        let project = Project::upsert(&pool, 1, "alpha").await.unwrap();
        GitlabProject::upsert(&pool, project.id, "group/alpha", "https://gitlab.example.com/group/alpha")
            .await
            .unwrap();
        GitlabProject::set_gitlab_id(&pool, project.id, 900).await.unwrap();

        let moved = GitlabProject::upsert(
            &pool,
            project.id,
            "group/beta",
            "https://gitlab.example.com/group/beta",
        )
        .await
        .unwrap();
        assert_eq!(moved.gitlab_id, None);
    }

    #[tokio::test]
    async fn test_find_linked_skips_unresolved() {
        let (pool, _temp_dir) = create_test_pool().await;

        let linked = Project::upsert(&pool, 1, "alpha").await.unwrap();
        GitlabProject::upsert(&pool, linked.id, "group/alpha", "https://gitlab.example.com/group/alpha")
            .await
            .unwrap();
        GitlabProject::set_gitlab_id(&pool, linked.id, 900).await.unwrap();

        let unlinked = Project::upsert(&pool, 2, "beta").await.unwrap();
        GitlabProject::upsert(&pool, unlinked.id, "group/beta", "https://gitlab.example.com/group/beta")
            .await
            .unwrap();

        let rows = Project::find_linked(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].redmine_id, 1);
        assert_eq!(rows[0].gitlab_id, 900);
        assert_eq!(rows[0].path_with_namespace, "group/alpha");
    }
}
