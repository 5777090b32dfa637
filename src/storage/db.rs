//! Relational store for orders, leases, users and sessions.
//!
//! Backed by SQLite through `sqlx`. Timestamps are Unix milliseconds and
//! UUIDs are stored as their hyphenated text form. Callers get explicit
//! transactions from [`Database::begin`]; dropping a transaction without
//! committing rolls it back, and dropping any query future cancels it.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Applied in order at startup. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id       INTEGER PRIMARY KEY AUTOINCREMENT,
        oauth_subject TEXT    NOT NULL UNIQUE,
        email         TEXT    NOT NULL DEFAULT '',
        permissions   INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        order_id   TEXT    PRIMARY KEY,
        batch_id   TEXT,
        owner_id   INTEGER NOT NULL REFERENCES users(user_id),
        definition BLOB    NOT NULL,
        created_at INTEGER NOT NULL,
        poisoned   INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS orders_batch_id ON orders(batch_id)",
    "CREATE INDEX IF NOT EXISTS orders_fifo ON orders(created_at, order_id)",
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        lease_id      TEXT    PRIMARY KEY,
        order_id      TEXT    NOT NULL REFERENCES orders(order_id),
        user_id       INTEGER NOT NULL REFERENCES users(user_id),
        address       TEXT    NOT NULL DEFAULT '',
        hostname      TEXT    NOT NULL DEFAULT '',
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL,
        expires_at    INTEGER NOT NULL,
        done          INTEGER NOT NULL DEFAULT 0,
        failed        INTEGER NOT NULL DEFAULT 0,
        failed_reason TEXT,
        metadata      BLOB
    )
    "#,
    "CREATE INDEX IF NOT EXISTS leases_active ON leases(order_id, done, failed, expires_at)",
    "CREATE INDEX IF NOT EXISTS leases_updated ON leases(updated_at)",
    "CREATE INDEX IF NOT EXISTS leases_expiry ON leases(done, failed, expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        cookie     TEXT    PRIMARY KEY,
        user_id    INTEGER NOT NULL REFERENCES users(user_id),
        expires_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS sessions_expires ON sessions(expires_at)",
];

/// Handle to the scheduler database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// # Errors
    ///
    /// Fails if the URL is malformed, the file can't be opened, or the schema
    /// can't be applied.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("connect {}: {}", url, e)))?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::info!(url, max_connections, "Database ready");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| SchedulerError::Internal(format!("corrupt {} {:?}: {}", column, value, e)))
}

pub(crate) fn parse_opt_uuid(column: &str, value: Option<String>) -> Result<Option<Uuid>> {
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(v) => parse_uuid(column, v).map(Some),
    }
}
