//! Issue link model: a durable pair of remote issues plus the canonical
//! snapshot the reconciler merges against.
//!
//! Both remote ids are globally unique so an issue belongs to exactly one
//! pair at any time. A link is created by pair discovery (or create-missing),
//! deleted when either counterpart is confirmed gone, and never otherwise
//! mutated except for its snapshot.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use trackers::IssueState;
use uuid::Uuid;

use crate::retry::{RetryPolicy, with_retry};

/// Current encoding version of [`CanonicalSnapshot`].
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IssueLinkError {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("issue already belongs to another pair")]
    AlreadyPaired,
}

impl From<sqlx::Error> for IssueLinkError {
    fn from(e: sqlx::Error) -> Self {
        let unique = e
            .as_database_error()
            .map(|d| d.is_unique_violation())
            .unwrap_or(false);
        if unique {
            IssueLinkError::AlreadyPaired
        } else {
            IssueLinkError::Database(e)
        }
    }
}

/// The last state both sides agreed on, used as the three-way merge base.
///
/// Serialized with a stable field order and a version tag; a stored blob
/// from an unknown version decodes to "no snapshot", which re-enters the
/// first-observe path on the next pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSnapshot {
    pub version: u32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignee: Option<Uuid>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub state: IssueState,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CanonicalSnapshot {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("snapshot serialization is infallible")
    }

    /// Decode a stored snapshot blob. Returns `None` (and logs) when the
    /// blob is unreadable or from a different encoding version.
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str::<CanonicalSnapshot>(raw) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Some(snapshot),
            Ok(snapshot) => {
                tracing::warn!(
                    version = snapshot.version,
                    "Discarding canonical snapshot with unsupported version"
                );
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable canonical snapshot");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueLink {
    pub id: Uuid,
    pub project_id: Uuid,
    pub redmine_issue_id: i64,
    pub gitlab_issue_iid: i64,
    pub canonical_snapshot: Option<CanonicalSnapshot>,
    pub last_event_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct IssueLinkRow {
    id: Uuid,
    project_id: Uuid,
    redmine_issue_id: i64,
    gitlab_issue_iid: i64,
    canonical_snapshot: Option<String>,
    last_event_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<IssueLinkRow> for IssueLink {
    fn from(row: IssueLinkRow) -> Self {
        IssueLink {
            id: row.id,
            project_id: row.project_id,
            redmine_issue_id: row.redmine_issue_id,
            gitlab_issue_iid: row.gitlab_issue_iid,
            canonical_snapshot: row
                .canonical_snapshot
                .as_deref()
                .and_then(CanonicalSnapshot::decode),
            last_event_id: row.last_event_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl IssueLink {
    /// Pair two issues. Fails with [`IssueLinkError::AlreadyPaired`] when
    /// either remote id already belongs to a link.
    pub async fn create(
        pool: &SqlitePool,
        project_id: Uuid,
        redmine_issue_id: i64,
        gitlab_issue_iid: i64,
    ) -> Result<Self, IssueLinkError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = sqlx::query_as::<_, IssueLinkRow>(
            r#"
            INSERT INTO issue_links (id, project_id, redmine_issue_id, gitlab_issue_iid, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, project_id, redmine_issue_id, gitlab_issue_iid,
                      canonical_snapshot, last_event_id, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(redmine_issue_id)
        .bind(gitlab_issue_iid)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(row.into())
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let rows = sqlx::query_as::<_, IssueLinkRow>(
            r#"
            SELECT id, project_id, redmine_issue_id, gitlab_issue_iid,
                   canonical_snapshot, last_event_id, created_at, updated_at
            FROM issue_links
            WHERE project_id = $1
            ORDER BY redmine_issue_id ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(IssueLink::from).collect())
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        let rows = sqlx::query_as::<_, IssueLinkRow>(
            r#"
            SELECT id, project_id, redmine_issue_id, gitlab_issue_iid,
                   canonical_snapshot, last_event_id, created_at, updated_at
            FROM issue_links
            ORDER BY redmine_issue_id ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(IssueLink::from).collect())
    }

    pub async fn find_by_redmine_issue_id(
        pool: &SqlitePool,
        redmine_issue_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        let row = sqlx::query_as::<_, IssueLinkRow>(
            r#"
            SELECT id, project_id, redmine_issue_id, gitlab_issue_iid,
                   canonical_snapshot, last_event_id, created_at, updated_at
            FROM issue_links
            WHERE redmine_issue_id = $1
            "#,
        )
        .bind(redmine_issue_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(IssueLink::from))
    }

    /// Advance the canonical snapshot after a successful reconciliation.
    /// Retries transient SQLite contention; this is the hot write path of
    /// every pass.
    pub async fn advance_canonical(
        pool: &SqlitePool,
        id: Uuid,
        snapshot: &CanonicalSnapshot,
    ) -> Result<(), sqlx::Error> {
        let encoded = snapshot.encode();
        with_retry(&RetryPolicy::default(), "advance_canonical", || {
            let encoded = encoded.clone();
            async move {
                let now = Utc::now();
                sqlx::query(
                    r#"
                    UPDATE issue_links SET canonical_snapshot = $2, updated_at = $3 WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(encoded)
                .bind(now)
                .execute(pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    /// Remove a link whose counterpart is confirmed gone. The remote issues
    /// themselves are never touched.
    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        with_retry(&RetryPolicy::default(), "delete_issue_link", || async move {
            let result = sqlx::query("DELETE FROM issue_links WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM issue_links")
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }
}
