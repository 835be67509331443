//! Neutral DTOs shared by both adapters and the reconciliation engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors an adapter operation can report.
///
/// The engine branches on this sum: `NotFound` drives the stale-mapping
/// deletion path and is never retried; `Transient` leaves the canonical
/// snapshot untouched so the next pass retries the same delta; `Permanent`
/// carries the remote's response body for the log.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    #[error("resource not found")]
    NotFound,
    #[error("transient remote error: {0}")]
    Transient(String),
    #[error("remote rejected request: HTTP {status} - {body}")]
    Permanent { status: u16, body: String },
}

impl TrackerError {
    /// Returns true if the error could succeed on a later pass without
    /// anyone changing remote state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Open/closed vocabulary shared by both platforms.
///
/// Redmine's status named "Closed" maps to `Closed`, anything else to
/// `Open`; GitLab's `closed`/`opened` map directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// Neutral snapshot of a remote issue.
///
/// `id` is the platform-local issue handle (Redmine issue id, GitLab iid);
/// `assignee_id` is the platform-local user id and is translated to a
/// correlation row by the engine; `labels` carries at most the single
/// category label both platforms agree on.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueView {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub labels: Vec<String>,
    pub assignee_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
    pub state: IssueState,
    pub updated_at: Option<DateTime<Utc>>,
    pub web_url: Option<String>,
}

/// A member of a remote project.
#[derive(Debug, Clone)]
pub struct MemberView {
    pub id: i64,
    /// Login/username where the platform has one, display name otherwise.
    pub handle: String,
    pub name: String,
}
