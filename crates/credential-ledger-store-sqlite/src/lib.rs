use std::path::Path;

use anyhow::{anyhow, Context, Result};
use credential_ledger_core::{HistoryEntry, Selector, StateStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_state (
  key TEXT PRIMARY KEY,
  value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  key TEXT NOT NULL,
  tx_id TEXT NOT NULL UNIQUE,
  value BLOB NOT NULL,
  written_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_history_key ON ledger_history(key, seq);
";

/// SQLite-backed versioned key-value store. The current value of every key
/// lives in `ledger_state`; each write also appends a `ledger_history` row
/// carrying a transaction id and a write timestamp, so the adapter can serve
/// the history surface without any in-process version log.
pub struct SqliteStateStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStateStore {
    /// Open a SQLite-backed state store and configure required runtime
    /// pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema
    /// version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            apply_migration_1(&self.conn)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM ledger_state WHERE key = ?1")
            .map_err(|err| StoreError::new(format!("failed to prepare state lookup: {err}")))?;
        stmt.query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()
            .map_err(|err| StoreError::new(format!("failed to read state for key {key}: {err}")))
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let written_at = now_rfc3339()
            .map_err(|err| StoreError::new(format!("failed to stamp write timestamp: {err}")))?;

        let tx = self
            .conn
            .transaction()
            .map_err(|err| StoreError::new(format!("failed to start write transaction: {err}")))?;

        let next_seq: i64 = tx
            .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM ledger_history", [], |row| {
                row.get(0)
            })
            .map_err(|err| StoreError::new(format!("failed to allocate write sequence: {err}")))?;
        let tx_id = transaction_id(next_seq, key, value);

        tx.execute(
            "INSERT INTO ledger_state(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|err| StoreError::new(format!("failed to write state for key {key}: {err}")))?;

        tx.execute(
            "INSERT INTO ledger_history(seq, key, tx_id, value, written_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![next_seq, key, tx_id, value, written_at],
        )
        .map_err(|err| StoreError::new(format!("failed to append history for key {key}: {err}")))?;

        tx.commit()
            .map_err(|err| StoreError::new(format!("failed to commit write for key {key}: {err}")))
    }

    fn query_by_filter(&self, filter: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let selector = Selector::parse(filter)?;

        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM ledger_state ORDER BY key ASC")
            .map_err(|err| StoreError::new(format!("failed to prepare filter query: {err}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|err| StoreError::new(format!("failed to execute filter query: {err}")))?;

        let mut hits = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| StoreError::new(format!("failed to read filter query row: {err}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|err| StoreError::new(format!("failed to decode row key: {err}")))?;
            let value: Vec<u8> = row
                .get(1)
                .map_err(|err| StoreError::new(format!("failed to decode row value: {err}")))?;
            // Non-JSON values cannot match a selector.
            let Ok(decoded) = serde_json::from_slice::<serde_json::Value>(&value) else {
                continue;
            };
            if selector.matches(&decoded) {
                hits.push((key, value));
            }
        }
        Ok(hits)
    }

    fn history_of(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tx_id, value, written_at FROM ledger_history
                 WHERE key = ?1 ORDER BY seq DESC",
            )
            .map_err(|err| StoreError::new(format!("failed to prepare history query: {err}")))?;
        let mut rows = stmt
            .query(params![key])
            .map_err(|err| StoreError::new(format!("failed to execute history query: {err}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| StoreError::new(format!("failed to read history row: {err}")))?
        {
            let tx_id: String = row
                .get(0)
                .map_err(|err| StoreError::new(format!("failed to decode tx_id: {err}")))?;
            let value: Vec<u8> = row
                .get(1)
                .map_err(|err| StoreError::new(format!("failed to decode history value: {err}")))?;
            let written_at_raw: String = row
                .get(2)
                .map_err(|err| StoreError::new(format!("failed to decode written_at: {err}")))?;
            let written_at = OffsetDateTime::parse(&written_at_raw, &Rfc3339).map_err(|err| {
                StoreError::new(format!("invalid history timestamp {written_at_raw}: {err}"))
            })?;
            entries.push(HistoryEntry { tx_id, value, written_at });
        }
        Ok(entries)
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
    record_schema_version(conn, 1)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read current schema version")
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn transaction_id(seq: i64, key: &str, value: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(key.as_bytes());
    hasher.update(value);
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("txn_{}", &digest_hex[..16])
}
