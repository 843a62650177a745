//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "SQLite experiment store with numbered schema migrations."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{
    Experiment, ExperimentSpec, ExperimentState, LastError, ListFilter, NewExperiment,
};
use crate::{ExperimentStore, Result, StoreError, StoreLocation};

pub(crate) const BACKEND: &str = "sqlite";

/// Highest migration shipped with this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_experiments",
        sql: r#"
            CREATE TABLE IF NOT EXISTS experiments (
              id TEXT PRIMARY KEY,
              spec TEXT NOT NULL,
              state TEXT NOT NULL,
              version INTEGER NOT NULL,
              last_error TEXT NULL,
              idempotency_key TEXT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS idempotency_keys (
              key TEXT PRIMARY KEY,
              experiment_id TEXT NOT NULL,
              recorded_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS retired_ids (
              id TEXT PRIMARY KEY,
              retired_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "index_experiments_state_created",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_experiments_state ON experiments(state);
            CREATE INDEX IF NOT EXISTS idx_experiments_created_at ON experiments(created_at);
        "#,
    },
];

const SELECT_COLUMNS: &str =
    "id, spec, state, version, last_error, idempotency_key, created_at, updated_at";

/// Store persisting experiments to a single SQLite database.
///
/// One connection is shared behind a mutex; every call runs on the blocking
/// pool so the async runtime never waits on disk.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Transient(format!("sqlite: {}", err))
            }
            _ => StoreError::Fatal(format!("sqlite: {}", err)),
        }
    }
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Fatal(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::configure(conn, busy_timeout, true)
    }

    /// Private in-memory database; lost when the store is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, Duration::from_secs(5), false)
    }

    pub fn open_location(location: &StoreLocation, busy_timeout: Duration) -> Result<Self> {
        match location {
            StoreLocation::SqliteFile(path) => Self::open(path, busy_timeout),
            StoreLocation::SqliteMemory => Self::open_in_memory(),
            StoreLocation::Memory => Err(StoreError::Fatal(
                "memory:// is served by MemoryStore, not SqliteStore".to_owned(),
            )),
        }
    }

    fn configure(conn: Connection, busy_timeout: Duration, wal: bool) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        if wal {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(journal_mode = %mode, "sqlite journal mode configured");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            work(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Fatal(format!("sqlite worker task failed: {}", err)))?
    }

    /// Apply every pending migration. Returns the resulting schema version.
    pub async fn migrate(&self) -> Result<u32> {
        self.blocking(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_migration_table(&tx)?;
            let current = current_schema_version(&tx)?;
            for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
                tx.execute_batch(migration.sql)?;
                tx.execute(
                    "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
                     VALUES (?1, ?2, ?3)",
                    params![migration.version, migration.name, timestamp(Utc::now())],
                )?;
                info!(
                    version = migration.version,
                    name = migration.name,
                    "applied schema migration"
                );
            }
            let version = current_schema_version(&tx)?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    /// Schema version recorded in the database; 0 for a fresh file.
    pub async fn schema_version(&self) -> Result<u32> {
        self.blocking(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
                [],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(0);
            }
            current_schema_version(conn)
        })
        .await
    }

    /// Fail unless the database is at [`CURRENT_SCHEMA_VERSION`].
    pub async fn ensure_schema_current(&self) -> Result<()> {
        let version = self.schema_version().await?;
        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        Err(StoreError::Fatal(format!(
            "database schema is at version {}, this build expects {}; run `chaoscraftd migrate`",
            version, CURRENT_SCHEMA_VERSION
        )))
    }
}

#[async_trait]
impl ExperimentStore for SqliteStore {
    async fn get(&self, id: Uuid) -> Result<Experiment> {
        self.blocking(move |conn| fetch(conn, id)?.ok_or(StoreError::NotFound(id)))
            .await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Experiment>> {
        let state = filter.state.map(|s| s.as_str());
        let limit = filter
            .limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {} FROM experiments
                 WHERE (?1 IS NULL OR state = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![state, limit], RawExperiment::from_row)?;
            let mut experiments = Vec::new();
            for row in rows {
                experiments.push(row?.decode()?);
            }
            Ok(experiments)
        })
        .await
    }

    async fn count(&self, state: Option<ExperimentState>) -> Result<usize> {
        let state = state.map(|s| s.as_str());
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM experiments WHERE (?1 IS NULL OR state = ?1)",
                params![state],
                |row| row.get(0),
            )?;
            usize::try_from(count)
                .map_err(|_| StoreError::Fatal(format!("negative experiment count {}", count)))
        })
        .await
    }

    async fn create(&self, new: NewExperiment) -> Result<Experiment> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(key) = new.idempotency_key.as_deref() {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT experiment_id FROM idempotency_keys WHERE key = ?1",
                        [key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing) = existing {
                    return Err(StoreError::DuplicateIdempotencyKey {
                        key: key.to_owned(),
                        existing: parse_id(&existing)?,
                    });
                }
            }

            let id = allocate_id(&tx)?;
            let now = timestamp(Utc::now());
            let spec = encode_json(&new.spec)?;
            tx.execute(
                "INSERT INTO experiments(id, spec, state, version, last_error, idempotency_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, NULL, ?4, ?5, ?5)",
                params![
                    id.to_string(),
                    spec,
                    ExperimentState::Pending.as_str(),
                    new.idempotency_key,
                    now
                ],
            )?;
            if let Some(key) = new.idempotency_key.as_deref() {
                tx.execute(
                    "INSERT INTO idempotency_keys(key, experiment_id, recorded_at) VALUES (?1, ?2, ?3)",
                    params![key, id.to_string(), now],
                )?;
            }
            let record = fetch(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        state: ExperimentState,
        last_error: Option<LastError>,
    ) -> Result<Experiment> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let last_error = last_error.as_ref().map(encode_json).transpose()?;
            let changed = tx.execute(
                "UPDATE experiments
                 SET state = ?1, last_error = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND version = ?5",
                params![
                    state.as_str(),
                    last_error,
                    timestamp(Utc::now()),
                    id.to_string(),
                    to_sql_version(expected_version)?
                ],
            )?;
            if changed == 0 {
                let actual: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM experiments WHERE id = ?1",
                        [id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match actual {
                    None => StoreError::NotFound(id),
                    Some(actual) => StoreError::VersionConflict {
                        id,
                        expected: expected_version,
                        actual: from_sql_version(actual)?,
                    },
                });
            }
            let record = fetch(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state: Option<String> = tx
                .query_row(
                    "SELECT state FROM experiments WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let state = parse_state(&state.ok_or(StoreError::NotFound(id))?)?;
            if !state.is_deletable() {
                return Err(StoreError::NotDeletable { id, state });
            }
            tx.execute("DELETE FROM experiments WHERE id = ?1", [id.to_string()])?;
            tx.execute(
                "INSERT OR IGNORE INTO retired_ids(id, retired_at) VALUES (?1, ?2)",
                params![id.to_string(), timestamp(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}

struct RawExperiment {
    id: String,
    spec: String,
    state: String,
    version: i64,
    last_error: Option<String>,
    idempotency_key: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawExperiment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            spec: row.get(1)?,
            state: row.get(2)?,
            version: row.get(3)?,
            last_error: row.get(4)?,
            idempotency_key: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Experiment> {
        let spec: ExperimentSpec = serde_json::from_str(&self.spec).map_err(|err| {
            StoreError::Fatal(format!("experiment {} has a corrupt spec: {}", self.id, err))
        })?;
        let last_error = self
            .last_error
            .as_deref()
            .map(serde_json::from_str::<LastError>)
            .transpose()
            .map_err(|err| {
                StoreError::Fatal(format!(
                    "experiment {} has a corrupt last_error: {}",
                    self.id, err
                ))
            })?;
        Ok(Experiment {
            id: parse_id(&self.id)?,
            spec,
            state: parse_state(&self.state)?,
            version: from_sql_version(self.version)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            last_error,
            idempotency_key: self.idempotency_key,
        })
    }
}

fn fetch(conn: &Connection, id: Uuid) -> Result<Option<Experiment>> {
    let sql = format!("SELECT {} FROM experiments WHERE id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, [id.to_string()], RawExperiment::from_row)
        .optional()?
        .map(RawExperiment::decode)
        .transpose()
}

fn allocate_id(tx: &Transaction<'_>) -> Result<Uuid> {
    loop {
        let id = Uuid::new_v4();
        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM experiments WHERE id = ?1)
                 OR EXISTS(SELECT 1 FROM retired_ids WHERE id = ?1)",
            [id.to_string()],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(id);
        }
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    u32::try_from(version)
        .map_err(|_| StoreError::Fatal(format!("invalid schema version {}", version)))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::Fatal(format!("invalid timestamp {:?}: {}", raw, err)))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|err| StoreError::Fatal(format!("invalid experiment id {:?}: {}", raw, err)))
}

fn parse_state(raw: &str) -> Result<ExperimentState> {
    raw.parse().map_err(StoreError::Fatal)
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::Fatal(format!("failed to encode record: {}", err)))
}

fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version)
        .map_err(|_| StoreError::Fatal(format!("version {} exceeds storage range", version)))
}

fn from_sql_version(version: i64) -> Result<u64> {
    u64::try_from(version)
        .map_err(|_| StoreError::Fatal(format!("stored version {} is negative", version)))
}
