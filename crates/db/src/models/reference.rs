//! Durable mirror of Redmine's tracker and status vocabularies.
//!
//! These tables are cache: truth lives in Redmine, and each pass refreshes
//! them before any patch is built. A refresh overwrites the name on id
//! collision.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RedmineTracker {
    pub redmine_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RedmineStatus {
    pub redmine_id: i64,
    pub name: String,
}

impl RedmineTracker {
    pub async fn upsert(pool: &SqlitePool, redmine_id: i64, name: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO redmine_trackers (redmine_id, name)
            VALUES ($1, $2)
            ON CONFLICT (redmine_id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(redmine_id)
        .bind(name)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, RedmineTracker>(
            "SELECT redmine_id, name FROM redmine_trackers ORDER BY redmine_id ASC",
        )
        .fetch_all(pool)
        .await
    }
}

impl RedmineStatus {
    pub async fn upsert(pool: &SqlitePool, redmine_id: i64, name: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO redmine_statuses (redmine_id, name)
            VALUES ($1, $2)
            ON CONFLICT (redmine_id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(redmine_id)
        .bind(name)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, RedmineStatus>(
            "SELECT redmine_id, name FROM redmine_statuses ORDER BY redmine_id ASC",
        )
        .fetch_all(pool)
        .await
    }
}
