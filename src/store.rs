//! Event store: one SQLite file, WAL mode, typed entity operations.
//!
//! All cross-entity mutations (merge execution, compute result application,
//! sync cursor commits) run inside a single sqlx transaction obtained from
//! [`Store::begin`]. Module files under `store/` each hold one entity family's
//! operations as `impl Store` blocks plus in-transaction free functions.

pub mod analysis;
pub mod conversations;
pub mod embeddings;
pub mod events;
pub mod facts;
pub mod jobs;
pub mod persons;
pub mod proposals;
pub mod schema;
pub mod sync_jobs;

use crate::error::{Result, StorageError};
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

/// Shared handle on the event store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `path` and migrate the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;

        let store = Self { pool };
        schema::migrate(&store.pool).await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the database
    /// alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory sqlite URL")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("in-memory sqlite should connect")?;

        let store = Self { pool };
        schema::migrate(&store.pool).await?;
        Ok(store)
    }

    /// Underlying pool, for read paths that do not need a transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a write transaction.
    pub async fn begin(&self) -> Result<Transaction<'_, sqlx::Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|error| translate(error).into())
    }

    /// Run a read-only SQL statement, the escape hatch for ad-hoc queries.
    /// Mutation requires `allow_write`.
    pub async fn raw_query(
        &self,
        sql: &str,
        allow_write: bool,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let head = sql.trim_start().to_ascii_lowercase();
        let is_read = head.starts_with("select") || head.starts_with("with");
        if !is_read && !allow_write {
            return Err(StorageError::Constraint(
                "raw_query is read-only; pass allow_write to mutate".to_string(),
            )
            .into());
        }

        use sqlx::{Column as _, Row as _, TypeInfo as _};
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(translate)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = serde_json::Map::new();
            for column in row.columns() {
                let name = column.name();
                let value = match column.type_info().name() {
                    "INTEGER" => row
                        .try_get::<Option<i64>, _>(name)
                        .ok()
                        .flatten()
                        .map(serde_json::Value::from),
                    "REAL" => row
                        .try_get::<Option<f64>, _>(name)
                        .ok()
                        .flatten()
                        .map(serde_json::Value::from),
                    _ => row
                        .try_get::<Option<String>, _>(name)
                        .ok()
                        .flatten()
                        .map(serde_json::Value::from),
                };
                object.insert(name.to_string(), value.unwrap_or(serde_json::Value::Null));
            }
            out.push(object);
        }
        Ok(out)
    }
}

/// Map a sqlx error onto the store's failure vocabulary.
pub fn translate(error: sqlx::Error) -> StorageError {
    match &error {
        sqlx::Error::Database(db) => {
            let code = db.code();
            match code.as_deref() {
                // SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
                Some("2067") | Some("1555") => StorageError::Constraint(db.message().to_string()),
                // SQLITE_BUSY / SQLITE_LOCKED
                Some("5") | Some("6") => StorageError::Busy(db.message().to_string()),
                // SQLITE_CORRUPT / SQLITE_NOTADB
                Some("11") | Some("26") => StorageError::Corrupt(db.message().to_string()),
                _ => StorageError::Other(anyhow::anyhow!("database error: {error}")),
            }
        }
        _ => StorageError::Other(anyhow::anyhow!("database error: {error}")),
    }
}

/// Whether an insert failure is a natural-key collision (idempotent success
/// for our upsert paths).
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("2067") | Some("1555"))
    )
}
