mod meters;
mod sessions;
mod stats;

use std::path::Path;

use futures::future::BoxFuture;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};
use time::OffsetDateTime;

use crate::config::DatabaseConfig;
use crate::error::StoreError;

pub(crate) use sessions::recalculate_deltas;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    unit TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reading_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    price REAL NOT NULL,
    notes TEXT,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES reading_sessions(id) ON DELETE CASCADE,
    meter_id INTEGER NOT NULL REFERENCES meters(id) ON DELETE CASCADE,
    value REAL NOT NULL,
    delta REAL,
    UNIQUE (session_id, meter_id)
);

CREATE INDEX IF NOT EXISTS idx_readings_meter ON readings(meter_id);
CREATE INDEX IF NOT EXISTS idx_readings_session ON readings(session_id);
CREATE INDEX IF NOT EXISTS idx_sessions_position ON reading_sessions(timestamp, id);
"#;

/// Handle over the meter/session datastore.
///
/// Constructed explicitly and passed to whatever needs it; there is no
/// process-wide instance. Multi-step mutations run through [`Store::with_tx`]
/// so a failure anywhere in a recalculation cascade rolls back the whole
/// operation.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file named by the config.
    pub async fn open(cfg: &DatabaseConfig) -> Result<Self, StoreError> {
        if let Some(dir) = Path::new(&cfg.path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(sqlx::Error::Io)?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_with(opts)
            .await?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Fresh in-memory database, one per call. Used for isolated tests.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // A single long-lived connection: each sqlite :memory: connection is
        // its own database, and the pool must never recycle it away.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Unit of work: hands `op` a transactional connection, commits on `Ok`,
    /// rolls back on error (or on drop if commit is never reached).
    pub(crate) async fn with_tx<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, StoreError>>,
    {
        let mut tx = self.pool.begin().await?;
        let out = op(&mut tx).await?;
        tx.commit().await?;
        Ok(out)
    }
}

/// Timestamps persist as unix microseconds so session ordering is exact
/// integer comparison, never string collation.
pub(crate) fn to_micros(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000) as i64
}

pub(crate) fn from_micros(us: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

/// Map constraint failures onto the typed kinds; everything else stays a
/// datastore error.
pub(crate) fn map_constraint(e: sqlx::Error, conflict: &str, reference: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Conflict(conflict.to_string());
        }
        if db.is_foreign_key_violation() {
            return StoreError::InvalidReference(reference.to_string());
        }
    }
    StoreError::Database(e)
}
