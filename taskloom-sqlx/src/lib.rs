//! A SQLite [`JobStore`](taskloom::store::JobStore) for taskloom.
//!
//! ```no_run
//! # use taskloom::queue::QueueService;
//! # use taskloom_sqlx::SqliteJobStore;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteJobStore::connect("sqlite://jobs.db?mode=rwc").await?;
//! store.run_migrations().await?;
//! let queue = QueueService::new(store);
//! # Ok(())
//! # }
//! ```
use std::{ops::Deref, str::FromStr, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use taskloom::store::StoreError;

mod backend;
mod query;
mod types;

/// A [`JobStore`](taskloom::store::JobStore) persisting jobs in the `taskloom_jobs` table.
///
/// Foreign keys must be enabled on the pool's connections, which is the default for pools
/// created by sqlx.
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl Deref for SqliteJobStore {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<SqlitePool> for SqliteJobStore {
    fn from(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl From<&SqlitePool> for SqliteJobStore {
    fn from(pool: &SqlitePool) -> Self {
        Self {
            pool: pool.to_owned(),
        }
    }
}

impl SqliteJobStore {
    const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Connect to the database at `url`.
    ///
    /// File databases are opened in WAL mode and writers wait on each other for up to
    /// [`Self::BUSY_TIMEOUT`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(
            SqliteConnectOptions::from_str(url).map_err(map_err)?,
            SqlitePoolOptions::new(),
        )
        .await
    }

    /// Connect with explicit connection and pool options.
    pub async fn connect_with(
        options: SqliteConnectOptions,
        pool: SqlitePoolOptions,
    ) -> Result<Self, StoreError> {
        let options = options
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Self::BUSY_TIMEOUT);
        let pool = pool.connect_with(options).await.map_err(map_err)?;
        Ok(pool.into())
    }

    /// A private in memory database, mostly useful for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(map_err)?
            .foreign_keys(true);
        // Every connection to `:memory:` opens a distinct database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_err)?;
        let store = Self::from(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create or update the `taskloom_jobs` and `taskloom_job_logs` tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        tracing::info!("Running taskloom migrations");
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Database(Box::new(error)))
    }
}

fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Decode(error) => StoreError::Corrupt(error.to_string()),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Corrupt(format!("column {index}: {source}"))
        }
        error => StoreError::Database(Box::new(error)),
    }
}
