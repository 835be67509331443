//! Service modules for trackbridge.

pub mod backlink;
pub mod config;
pub mod member_correlator;
pub mod pair_discovery;
pub mod pass;
pub mod poll;
pub mod project_discovery;
pub mod reconciler;
pub mod reference_cache;
