//! Retry handling for contended SQLite writes.
//!
//! WAL mode allows a single writer at a time; concurrent write attempts
//! surface as SQLITE_BUSY or SQLITE_LOCKED, and heavy write load with mmap
//! can additionally produce transient SQLITE_IOERR variants. Writes on the
//! pass's hot path go through [`with_retry`], which backs off with jitter
//! before giving up.

use std::future::Future;
use std::time::Duration;

use sqlx::Error as SqlxError;

// SQLite primary result codes that indicate transient contention.
const SQLITE_BUSY: u32 = 5;
const SQLITE_LOCKED: u32 = 6;
const SQLITE_IOERR: u32 = 10;

/// How often and how long to back off before giving up on a write.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    /// Backoff before the second attempt; doubles from here.
    pub min_delay: Duration,
    /// Ceiling for any single backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 6,
            min_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    /// Backoff schedule: one delay per retry, so `attempts - 1` entries.
    fn backoff(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts.saturating_sub(1)).map(|retry| self.delay_for(retry))
    }

    /// Doubling backoff with equal jitter: half the nominal delay is fixed,
    /// the other half randomized, so lockstep writers spread out without
    /// retrying at a fraction of the intended pace.
    fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self
            .min_delay
            .saturating_mul(1u32 << retry.min(16))
            .min(self.max_delay);
        let half = nominal / 2;
        half + jitter(half)
    }
}

fn jitter(range: Duration) -> Duration {
    let range_ms = range.as_millis() as u64;
    if range_ms == 0 {
        return Duration::ZERO;
    }
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(seed % (range_ms + 1))
}

/// SQLite primary result code of a database-level error, when it carries a
/// numeric code. Extended codes fold onto their primary code (low byte), so
/// e.g. SQLITE_IOERR_SHORT_READ (522) reads as SQLITE_IOERR (10).
fn primary_code(error: &SqlxError) -> Option<u32> {
    let code = error.as_database_error()?.code()?;
    code.as_ref().parse::<u32>().ok().map(|code| code & 0xFF)
}

/// Whether a write failed on transient contention rather than on the
/// statement itself. BUSY and LOCKED resolve once the competing writer
/// commits; IOERR variants can clear after a pause under WAL with mmap.
pub fn is_retryable_error(error: &SqlxError) -> bool {
    matches!(
        primary_code(error),
        Some(SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR)
    )
}

/// Run a write, retrying on contention per the policy.
///
/// Non-retryable errors (constraint violations included) surface
/// immediately; a write still contended after the last attempt returns the
/// final error.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, SqlxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SqlxError>>,
{
    let mut delays = policy.backoff();
    let mut tries = 0u32;
    loop {
        tries += 1;
        let error = match op().await {
            Ok(value) => {
                if tries > 1 {
                    tracing::debug!(operation, tries, "Write succeeded after contention");
                }
                return Ok(value);
            }
            Err(e) => e,
        };
        if !is_retryable_error(&error) {
            return Err(error);
        }
        let Some(delay) = delays.next() else {
            tracing::error!(
                operation,
                tries,
                error = ?error,
                "Giving up on contended write"
            );
            return Err(error);
        };
        tracing::warn!(
            operation,
            tries,
            delay_ms = delay.as_millis() as u64,
            "Database contended, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicU32, Ordering};

    use sqlx::error::{DatabaseError, ErrorKind};

    use super::*;

    /// Minimal stand-in for a SQLite driver error carrying a result code.
    #[derive(Debug)]
    struct FakeSqliteError {
        code: Option<&'static str>,
    }

    impl std::fmt::Display for FakeSqliteError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "database is locked")
        }
    }

    impl std::error::Error for FakeSqliteError {}

    impl DatabaseError for FakeSqliteError {
        fn message(&self) -> &str {
            "database is locked"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> SqlxError {
        SqlxError::Database(Box::new(FakeSqliteError { code: Some(code) }))
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_contention_codes_are_retryable() {
        assert!(is_retryable_error(&db_error("5"))); // SQLITE_BUSY
        assert!(is_retryable_error(&db_error("6"))); // SQLITE_LOCKED
        assert!(is_retryable_error(&db_error("10"))); // SQLITE_IOERR
    }

    #[test]
    fn test_extended_codes_fold_onto_their_primary() {
        assert!(is_retryable_error(&db_error("522"))); // SQLITE_IOERR_SHORT_READ
        assert!(is_retryable_error(&db_error("517"))); // SQLITE_BUSY_SNAPSHOT
        assert!(is_retryable_error(&db_error("262"))); // SQLITE_LOCKED_SHAREDCACHE
    }

    #[test]
    fn test_statement_errors_are_not_retryable() {
        assert!(!is_retryable_error(&db_error("1"))); // SQLITE_ERROR
        assert!(!is_retryable_error(&db_error("19"))); // SQLITE_CONSTRAINT
        assert!(!is_retryable_error(&db_error("2067"))); // SQLITE_CONSTRAINT_UNIQUE
    }

    #[test]
    fn test_codeless_and_non_database_errors_are_not_retryable() {
        let codeless = SqlxError::Database(Box::new(FakeSqliteError { code: None }));
        assert!(!is_retryable_error(&codeless));
        assert!(!is_retryable_error(&SqlxError::RowNotFound));
        assert!(!is_retryable_error(&SqlxError::PoolClosed));
    }

    #[test]
    fn test_delay_stays_within_nominal_bounds() {
        let policy = RetryPolicy::default();
        for retry in 0..10 {
            let delay = policy.delay_for(retry);
            assert!(delay <= policy.max_delay);
        }
        // The first retry backs off by at least half the configured minimum
        assert!(policy.delay_for(0) >= policy.min_delay / 2);
        assert!(policy.delay_for(0) <= policy.min_delay);
    }

    #[test]
    fn test_backoff_yields_one_delay_per_retry() {
        assert_eq!(fast_policy(6).backoff().count(), 5);
        assert_eq!(fast_policy(1).backoff().count(), 0);
        assert_eq!(fast_policy(0).backoff().count(), 0);
    }

    #[tokio::test]
    async fn test_with_retry_passes_through_success() {
        let result: Result<u32, SqlxError> =
            with_retry(&fast_policy(3), "noop", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_contention() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "flaky", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(db_error("5"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_the_last_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, SqlxError> = with_retry(&fast_policy(3), "contended", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(db_error("6")) }
        })
        .await;
        assert!(matches!(result, Err(SqlxError::Database(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_propagates_statement_errors_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, SqlxError> = with_retry(&fast_policy(5), "broken", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(db_error("2067")) }
        })
        .await;
        assert!(matches!(result, Err(SqlxError::Database(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
