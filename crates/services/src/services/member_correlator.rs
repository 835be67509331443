//! Member correlation between the two platforms.
//!
//! For every GitLab member a *search key* is derived from the handle; any
//! Redmine member whose display name contains the key (case-insensitively)
//! is paired with it. The heuristic is intentionally crude but deterministic
//! under a fixed member corpus. Correlation is first-write-wins: existing
//! rows are never re-evaluated, and uniqueness collisions are skipped.

use std::collections::HashMap;
use std::sync::LazyLock;

use db::models::user_link::{UserLink, UserLinkError};
use regex::Regex;
use sqlx::SqlitePool;
use trackers::MemberView;
use uuid::Uuid;

// Platform-synthetic accounts (project/group access tokens) are excluded.
static SERVICE_ACCOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(project|group)_\d+_bot(_|$)").expect("service account regex compiles")
});

pub fn is_service_account(handle: &str) -> bool {
    SERVICE_ACCOUNT.is_match(handle)
}

/// Derive the search key for a GitLab handle:
/// 1. split on `.`, `_`, `-`; with two or more parts the key is the last;
/// 2. otherwise drop the first character when the handle has at least four;
/// 3. otherwise the handle itself.
pub fn search_key(handle: &str) -> String {
    let parts: Vec<&str> = handle
        .split(['.', '_', '-'])
        .filter(|part| !part.is_empty())
        .collect();
    if parts.len() >= 2 {
        return parts[parts.len() - 1].to_string();
    }
    if handle.chars().count() >= 4 {
        return handle.chars().skip(1).collect();
    }
    handle.to_string()
}

#[derive(Debug, Default)]
pub struct CorrelationOutcome {
    pub inserted: usize,
    pub skipped_conflicts: usize,
}

/// Pair members of one project. Inserts only; rows that exist are left
/// alone even when the heuristic would now pick differently.
pub async fn correlate_members(
    pool: &SqlitePool,
    redmine_members: &[MemberView],
    gitlab_members: &[MemberView],
) -> Result<CorrelationOutcome, sqlx::Error> {
    let mut outcome = CorrelationOutcome::default();

    for gitlab_member in gitlab_members {
        if is_service_account(&gitlab_member.handle) {
            continue;
        }
        let key = search_key(&gitlab_member.handle).to_lowercase();
        if key.is_empty() {
            continue;
        }

        for redmine_member in redmine_members {
            if !redmine_member.name.to_lowercase().contains(&key) {
                continue;
            }
            if UserLink::find_by_redmine_user_id(pool, redmine_member.id)
                .await?
                .is_some()
            {
                continue;
            }
            match UserLink::create_pair(
                pool,
                redmine_member.id,
                gitlab_member.id,
                &gitlab_member.handle,
            )
            .await
            {
                Ok(_) => {
                    tracing::debug!(
                        redmine_user_id = redmine_member.id,
                        gitlab_user_id = gitlab_member.id,
                        key = %key,
                        "Correlated members"
                    );
                    outcome.inserted += 1;
                    break;
                }
                Err(UserLinkError::AlreadyCorrelated) => {
                    outcome.skipped_conflicts += 1;
                    continue;
                }
                Err(UserLinkError::Database(e)) => return Err(e),
            }
        }
    }

    Ok(outcome)
}

/// In-memory projection of the `user_links` table for one pass, translating
/// between platform ids and the neutral correlation-row id in both
/// directions.
#[derive(Debug, Default)]
pub struct UserLinkMaps {
    by_redmine: HashMap<i64, Uuid>,
    by_gitlab: HashMap<i64, Uuid>,
    redmine_by_link: HashMap<Uuid, i64>,
    gitlab_by_link: HashMap<Uuid, i64>,
}

impl UserLinkMaps {
    pub async fn load(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let mut maps = UserLinkMaps::default();
        for link in UserLink::find_all(pool).await? {
            if let Some(redmine_id) = link.redmine_user_id {
                maps.by_redmine.insert(redmine_id, link.id);
                maps.redmine_by_link.insert(link.id, redmine_id);
            }
            if let Some(gitlab_id) = link.gitlab_user_id {
                maps.by_gitlab.insert(gitlab_id, link.id);
                maps.gitlab_by_link.insert(link.id, gitlab_id);
            }
        }
        Ok(maps)
    }

    pub fn link_for_redmine(&self, redmine_user_id: i64) -> Option<Uuid> {
        self.by_redmine.get(&redmine_user_id).copied()
    }

    pub fn link_for_gitlab(&self, gitlab_user_id: i64) -> Option<Uuid> {
        self.by_gitlab.get(&gitlab_user_id).copied()
    }

    pub fn redmine_for_link(&self, link_id: Uuid) -> Option<i64> {
        self.redmine_by_link.get(&link_id).copied()
    }

    pub fn gitlab_for_link(&self, link_id: Uuid) -> Option<i64> {
        self.gitlab_by_link.get(&link_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_key_takes_last_separator_part() {
        assert_eq!(search_key("alice.smith"), "smith");
        assert_eq!(search_key("alice_smith"), "smith");
        assert_eq!(search_key("alice-van-smith"), "smith");
        assert_eq!(search_key("a.b_c-d"), "d");
    }

    #[test]
    fn test_search_key_drops_first_char_of_plain_handles() {
        assert_eq!(search_key("jdoe"), "doe");
        assert_eq!(search_key("asmith"), "smith");
    }

    #[test]
    fn test_search_key_keeps_short_handles() {
        assert_eq!(search_key("bob"), "bob");
        assert_eq!(search_key("al"), "al");
    }

    #[test]
    fn test_search_key_ignores_empty_segments() {
        // A trailing separator must not produce an empty key that would
        // match every member
        assert_eq!(search_key("alice."), "lice");
        assert_eq!(search_key("smith_"), "mith");
    }

    #[test]
    fn test_service_accounts_detected() {
        assert!(is_service_account("project_42_bot"));
        assert!(is_service_account("group_7_bot_1"));
        assert!(is_service_account("PROJECT_1_BOT"));
        assert!(!is_service_account("robot"));
        assert!(!is_service_account("project_bot"));
        assert!(!is_service_account("xproject_1_bot"));
    }
}
