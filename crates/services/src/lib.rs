//! The trackbridge reconciliation engine.
//!
//! Everything between the platform adapters and the process host lives
//! here: configuration, the per-pass pipeline (reference cache refresh,
//! project discovery, member correlation, pair discovery, reconciliation)
//! and the poll driver that runs it.

pub mod services;
