use std::{str::FromStr, time::Duration};

use sqlx::{
    Error, Executor, Pool, Sqlite,
    sqlite::{
        SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
};
use tracing::info;

pub mod models;
pub mod retry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use retry::{RetryPolicy, is_retryable_error, with_retry};

/// SQLite benefits from limited connections due to single-writer model.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const DEFAULT_MIN_CONNECTIONS: u32 = 1;

/// Connection acquisition timeout in seconds.
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Apply performance and reliability pragmas to a SQLite connection.
/// These pragmas are applied on every new connection via `after_connect`.
///
/// `synchronous` must be set AFTER `mmap_size`: enabling mmap can affect how
/// SQLite handles fsync, and without an explicit synchronous setting disk
/// I/O errors can occur under heavy write load.
async fn apply_performance_pragmas(conn: &mut SqliteConnection) -> Result<(), Error> {
    // temp_store = MEMORY (2)
    conn.execute("PRAGMA temp_store = 2").await?;

    conn.execute("PRAGMA mmap_size = 67108864").await?; // 64MB

    conn.execute("PRAGMA synchronous = NORMAL").await?;

    // cache_size = -64000 (64MB, negative means KB)
    conn.execute("PRAGMA cache_size = -64000").await?;

    conn.execute("PRAGMA foreign_keys = ON").await?;

    Ok(())
}

/// Handle on the mapping store: a pooled SQLite connection with migrations
/// applied.
#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    /// Open (creating if missing) the database at `connection_string`
    /// (e.g. `sqlite://trackbridge.db`) and run any pending migrations.
    ///
    /// Migrations are forward-only; this fails the process start when the
    /// schema on disk is ahead of or diverged from the compiled set.
    pub async fn new(connection_string: &str) -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str(connection_string)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .min_connections(DEFAULT_MIN_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
            .after_connect(|conn, _meta| {
                Box::pin(async move { apply_performance_pragmas(conn).await })
            })
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Mapping store ready");

        Ok(DBService { pool })
    }
}
