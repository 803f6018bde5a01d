//! SQLite persistence for the NWC service
//!
//! Provides persistent storage for:
//! - Apps and their permissions (the delegated-access registry)
//! - Request events (inbound dedup + handler state)
//! - Response events (what was published back, and when)
//! - Payments (one row per attempted payment, preimage set on success)

pub mod apps;
pub mod payments;
pub mod requests;

use rusqlite::Connection;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use apps::{App, AppPermission, BudgetRenewal, PermissionSpec};
pub use payments::Payment;
pub use requests::{RecordOutcome, RequestEvent, RequestState, ResponseState};

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Storage layer errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: RequestState, to: RequestState },

    #[error("not found: {0}")]
    NotFound(String),
}

/// Database wrapper shared across the service.
///
/// The connection mutex is the single serialization point for writes; it is
/// held only for the duration of a query, never across a Lightning call.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        // WAL for better concurrency; foreign keys for permission cascade
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run all migrations
    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                applied_at INTEGER NOT NULL DEFAULT (unixepoch())
            )",
            [],
        )?;

        run_migration(&conn, "001_initial_schema", MIGRATION_001)?;
        Ok(())
    }
}

/// Run a single migration if not already applied
fn run_migration(conn: &Connection, name: &str, sql: &str) -> anyhow::Result<()> {
    let applied: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
            [name],
            |row| row.get(0),
        )
        .unwrap_or(false);

    if applied {
        return Ok(());
    }

    conn.execute_batch(sql)?;
    conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;

    tracing::info!("Applied migration: {}", name);
    Ok(())
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Initial schema migration
const MIGRATION_001: &str = r#"
-- Apps: the unit of delegated access, keyed by the per-app nostr pubkey
CREATE TABLE IF NOT EXISTS apps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    nostr_pubkey TEXT NOT NULL UNIQUE,
    retired INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_used_at INTEGER
);

-- One row per granted method scope
CREATE TABLE IF NOT EXISTS app_permissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
    scope TEXT NOT NULL,
    max_amount_msats INTEGER NOT NULL DEFAULT 0,
    budget_renewal TEXT NOT NULL DEFAULT 'none'
        CHECK(budget_renewal IN ('none', 'daily', 'weekly', 'monthly', 'yearly')),
    expires_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_app_permissions_app ON app_permissions(app_id);

-- Inbound request events; the UNIQUE nostr_id is the idempotency barrier
CREATE TABLE IF NOT EXISTS request_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nostr_id TEXT NOT NULL UNIQUE,
    app_id INTEGER NOT NULL REFERENCES apps(id),
    content TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'received'
        CHECK(state IN ('received', 'handler-executing', 'handler-executed', 'error')),
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_request_events_app ON request_events(app_id);

-- Published (or failed) replies, one per response event
CREATE TABLE IF NOT EXISTS response_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_event_id INTEGER NOT NULL REFERENCES request_events(id),
    nostr_id TEXT,
    d_tag TEXT,
    content TEXT NOT NULL,
    state TEXT NOT NULL CHECK(state IN ('published', 'failed')),
    replied_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_events_request ON response_events(request_event_id);

-- Payments: created before the backend call, preimage set only on success
CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    app_id INTEGER NOT NULL REFERENCES apps(id),
    request_event_id INTEGER NOT NULL REFERENCES request_events(id),
    payment_request TEXT NOT NULL,
    amount_msats INTEGER NOT NULL,
    preimage TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payments_app_created ON payments(app_id, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Db::open_in_memory().unwrap();
        // Re-running against the same connection is a no-op
        db.migrate().unwrap();

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nwcd.db");
        let db = Db::open(&path).unwrap();
        drop(db);

        // Re-opening applies no new migrations and keeps the schema
        let db = Db::open(&path).unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM apps", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
