//! Poll driver: one cooperative loop that runs the full pipeline per tick.
//!
//! Each tick sleeps `interval + uniform jitter`, skips when a previous pass
//! is still in flight, and records process-visible status for the `/poll`
//! endpoints. Shutdown is cooperative: cancellation stops the pass at the
//! next project boundary without recording a success.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::PollingConfig;
use super::pass::{PassError, SyncEngine};

/// Snapshot of the driver's externally visible state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Shared handle for reading (status endpoint) and writing (driver) the
/// poll status. Single-writer: only the driver mutates it.
#[derive(Clone, Default)]
pub struct PollStatusHandle {
    inner: Arc<RwLock<PollStatus>>,
}

impl PollStatusHandle {
    pub async fn snapshot(&self) -> PollStatus {
        self.inner.read().await.clone()
    }

    async fn record_run_started(&self) {
        self.inner.write().await.last_run_at = Some(Utc::now());
    }

    async fn record_success(&self) {
        let mut status = self.inner.write().await;
        status.last_success_at = Some(Utc::now());
        status.consecutive_failures = 0;
    }

    async fn record_failure(&self) {
        self.inner.write().await.consecutive_failures += 1;
    }
}

pub struct PollDriver {
    engine: Arc<SyncEngine>,
    interval: Duration,
    jitter: Duration,
    status: PollStatusHandle,
    cancel: CancellationToken,
    pass_guard: Arc<Mutex<()>>,
}

impl PollDriver {
    pub fn new(engine: Arc<SyncEngine>, polling: &PollingConfig) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(polling.interval_seconds),
            jitter: Duration::from_secs(polling.jitter_seconds),
            status: PollStatusHandle::default(),
            cancel: CancellationToken::new(),
            pass_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn status_handle(&self) -> PollStatusHandle {
        self.status.clone()
    }

    /// Token the process host cancels on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            interval = ?self.interval,
            jitter = ?self.jitter,
            "Starting poll driver"
        );

        loop {
            let delay = self.interval + uniform_jitter(self.jitter);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let Ok(_guard) = self.pass_guard.try_lock() else {
                warn!("Previous pass still in flight; skipping tick");
                continue;
            };

            self.status.record_run_started().await;
            match self.engine.run_pass(&self.cancel).await {
                Ok(summary) => {
                    info!(
                        projects = summary.projects,
                        failed_projects = summary.failed_projects,
                        seeded = summary.pairs_seeded,
                        created = summary.pairs_created,
                        patched = summary.links_patched,
                        deleted = summary.links_deleted,
                        "Pass complete"
                    );
                    self.status.record_success().await;
                }
                Err(PassError::Cancelled) => {
                    info!("Pass cancelled during shutdown");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Pass failed");
                    self.status.record_failure().await;
                }
            }
        }

        info!("Poll driver stopped");
    }
}

/// Uniform random duration in `[0, max]`, derived from the clock so the
/// engine carries no RNG dependency.
fn uniform_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(now % (max_ms + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_jitter_bounds() {
        for _ in 0..100 {
            let jitter = uniform_jitter(Duration::from_secs(5));
            assert!(jitter <= Duration::from_secs(5));
        }
        assert_eq!(uniform_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_status_handle_lifecycle() {
        let handle = PollStatusHandle::default();
        let initial = handle.snapshot().await;
        assert!(initial.last_run_at.is_none());
        assert!(initial.last_success_at.is_none());
        assert_eq!(initial.consecutive_failures, 0);

        handle.record_run_started().await;
        handle.record_failure().await;
        handle.record_failure().await;
        let failing = handle.snapshot().await;
        assert!(failing.last_run_at.is_some());
        assert!(failing.last_success_at.is_none());
        assert_eq!(failing.consecutive_failures, 2);

        handle.record_success().await;
        let recovered = handle.snapshot().await;
        assert!(recovered.last_success_at.is_some());
        assert_eq!(recovered.consecutive_failures, 0);
    }
}
