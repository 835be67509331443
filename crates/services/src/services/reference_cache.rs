//! Per-pass refresh of Redmine's tracker and status vocabularies.
//!
//! Runs before any patch is built so name→id lookups are consistent with
//! what the pass just observed. The durable tables are a mirror; the cache
//! handed to the reconciler is built from the freshly fetched lists.

use std::collections::HashMap;

use db::models::reference::{RedmineStatus, RedmineTracker};
use sqlx::SqlitePool;
use thiserror::Error;
use trackers::{IssueState, RedmineApi, TrackerError};

/// The Redmine status names the neutral open/closed vocabulary maps to.
const STATUS_OPEN_NAME: &str = "New";
const STATUS_CLOSED_NAME: &str = "Closed";

#[derive(Debug, Error)]
pub enum ReferenceCacheError {
    #[error("failed to read Redmine vocabulary: {0}")]
    Remote(#[from] TrackerError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Case-insensitive name→id view of Redmine's vocabulary for one pass.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    trackers_by_name: HashMap<String, i64>,
    status_open_id: Option<i64>,
    status_closed_id: Option<i64>,
}

impl ReferenceCache {
    pub fn new(trackers: &[(i64, String)], statuses: &[(i64, String)]) -> Self {
        let trackers_by_name = trackers
            .iter()
            .map(|(id, name)| (name.to_lowercase(), *id))
            .collect();
        let find_status = |wanted: &str| {
            statuses
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(wanted))
                .map(|(id, _)| *id)
        };
        Self {
            trackers_by_name,
            status_open_id: find_status(STATUS_OPEN_NAME),
            status_closed_id: find_status(STATUS_CLOSED_NAME),
        }
    }

    pub fn tracker_id(&self, name: &str) -> Option<i64> {
        self.trackers_by_name.get(&name.to_lowercase()).copied()
    }

    /// Redmine status id for a neutral state, when the installation has the
    /// expected "New"/"Closed" names.
    pub fn status_id(&self, state: IssueState) -> Option<i64> {
        match state {
            IssueState::Open => self.status_open_id,
            IssueState::Closed => self.status_closed_id,
        }
    }
}

/// Re-read both vocabularies from Redmine and upsert them into the mirror
/// tables, overwriting names on id collision.
pub async fn refresh(
    pool: &SqlitePool,
    redmine: &dyn RedmineApi,
) -> Result<ReferenceCache, ReferenceCacheError> {
    let trackers = redmine.list_trackers().await?;
    let statuses = redmine.list_statuses().await?;

    for (id, name) in &trackers {
        if let Err(e) = RedmineTracker::upsert(pool, *id, name).await {
            if is_unique_violation(&e) {
                tracing::warn!(tracker_id = id, name = %name, "Tracker name collides with another id; keeping existing row");
            } else {
                return Err(e.into());
            }
        }
    }
    for (id, name) in &statuses {
        if let Err(e) = RedmineStatus::upsert(pool, *id, name).await {
            if is_unique_violation(&e) {
                tracing::warn!(status_id = id, name = %name, "Status name collides with another id; keeping existing row");
            } else {
                return Err(e.into());
            }
        }
    }

    let cache = ReferenceCache::new(&trackers, &statuses);
    if cache.status_open_id.is_none() {
        tracing::warn!(
            "Redmine has no status named \"{STATUS_OPEN_NAME}\"; reopen patches will omit status"
        );
    }
    if cache.status_closed_id.is_none() {
        tracing::warn!(
            "Redmine has no status named \"{STATUS_CLOSED_NAME}\"; close patches will omit status"
        );
    }
    Ok(cache)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}
