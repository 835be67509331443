//! User correlation between Redmine and GitLab accounts.
//!
//! Rows are append-mostly: the member correlator inserts new pairs and never
//! rewrites existing ones, even when its heuristic would now pick
//! differently. Each platform id is unique when set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UserLinkError {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("platform account already correlated")]
    AlreadyCorrelated,
}

impl From<sqlx::Error> for UserLinkError {
    fn from(e: sqlx::Error) -> Self {
        let unique = e
            .as_database_error()
            .map(|d| d.is_unique_violation())
            .unwrap_or(false);
        if unique {
            UserLinkError::AlreadyCorrelated
        } else {
            UserLinkError::Database(e)
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserLink {
    pub id: Uuid,
    pub redmine_user_id: Option<i64>,
    pub gitlab_user_id: Option<i64>,
    /// The handle the correlation heuristic matched on.
    pub display_key: String,
    pub created_at: DateTime<Utc>,
}

impl UserLink {
    /// Insert a correlated pair. Both platform ids are set; a row never has
    /// both ids null.
    pub async fn create_pair(
        pool: &SqlitePool,
        redmine_user_id: i64,
        gitlab_user_id: i64,
        display_key: &str,
    ) -> Result<Self, UserLinkError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = sqlx::query_as::<_, UserLink>(
            r#"
            INSERT INTO user_links (id, redmine_user_id, gitlab_user_id, display_key, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, redmine_user_id, gitlab_user_id, display_key, created_at
            "#,
        )
        .bind(id)
        .bind(redmine_user_id)
        .bind(gitlab_user_id)
        .bind(display_key)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(row)
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserLink>(
            r#"
            SELECT id, redmine_user_id, gitlab_user_id, display_key, created_at
            FROM user_links
            ORDER BY created_at ASC, display_key ASC
            "#,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_redmine_user_id(
        pool: &SqlitePool,
        redmine_user_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserLink>(
            r#"
            SELECT id, redmine_user_id, gitlab_user_id, display_key, created_at
            FROM user_links
            WHERE redmine_user_id = $1
            "#,
        )
        .bind(redmine_user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_gitlab_user_id(
        pool: &SqlitePool,
        gitlab_user_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserLink>(
            r#"
            SELECT id, redmine_user_id, gitlab_user_id, display_key, created_at
            FROM user_links
            WHERE gitlab_user_id = $1
            "#,
        )
        .bind(gitlab_user_id)
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_pool;

    #[tokio::test]
    async fn test_create_pair_and_lookups() {
        let (pool, _temp_dir) = create_test_pool().await;

        let link = UserLink::create_pair(&pool, 5, 42, "alice.smith").await.unwrap();
        assert_eq!(link.redmine_user_id, Some(5));
        assert_eq!(link.gitlab_user_id, Some(42));
        assert_eq!(link.display_key, "alice.smith");

        let by_redmine = UserLink::find_by_redmine_user_id(&pool, 5).await.unwrap();
        assert_eq!(by_redmine.unwrap().id, link.id);

        let by_gitlab = UserLink::find_by_gitlab_user_id(&pool, 42).await.unwrap();
        assert_eq!(by_gitlab.unwrap().id, link.id);
    }

    #[tokio::test]
    async fn test_platform_ids_unique() {
        let (pool, _temp_dir) = create_test_pool().await;

        UserLink::create_pair(&pool, 5, 42, "alice").await.unwrap();

        let same_redmine = UserLink::create_pair(&pool, 5, 43, "alice2").await;
        assert!(matches!(same_redmine, Err(UserLinkError::AlreadyCorrelated)));

        let same_gitlab = UserLink::create_pair(&pool, 6, 42, "alice3").await;
        assert!(matches!(same_gitlab, Err(UserLinkError::AlreadyCorrelated)));

        assert_eq!(UserLink::find_all(&pool).await.unwrap().len(), 1);
    }
}
