//! Platform adapters for the two issue trackers being synchronized.
//!
//! Each adapter hides its platform's REST shape, auth, and pagination behind
//! a uniform trait, translating remote payloads into the neutral
//! [`IssueView`] the reconciliation engine works with. The engine never sees
//! a raw remote payload.

pub mod gitlab;
pub mod http;
pub mod redmine;
pub mod types;

pub use gitlab::{GitlabApi, GitlabClient, GitlabIssueDraft, GitlabIssuePatch};
pub use redmine::{
    RedmineApi, RedmineClient, RedmineIssueDraft, RedmineIssuePatch, RedmineProjectView,
};
pub use types::{IssueState, IssueView, MemberView, TrackerError, TrackerResult};
