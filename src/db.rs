use std::{str::FromStr, time::Duration};

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{SqlitePool, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions}};
use uuid::Uuid;

use crate::error::EngineError;

pub async fn connect_and_bootstrap(database_url: &str) -> Result<SqlitePool, EngineError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    bootstrap_schema(&pool).await?;

    Ok(pool)
}

// No foreign key from transactions to connections: a transaction may arrive
// before its connection and is held as unroutable until the connection exists.
const SCHEMA_BOOTSTRAP_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS connections (
      connection_id TEXT PRIMARY KEY,
      their_label TEXT,
      state TEXT NOT NULL,
      role TEXT NOT NULL DEFAULT 'endorser',
      auto_accepted INTEGER NOT NULL DEFAULT 0,
      author_status TEXT NOT NULL DEFAULT 'pending',
      endorse_status TEXT NOT NULL DEFAULT 'manual_endorse',
      last_error TEXT,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL
    );",

    "CREATE TABLE IF NOT EXISTS endorse_transactions (
      transaction_id TEXT PRIMARY KEY,
      connection_id TEXT NOT NULL,
      transaction_type TEXT NOT NULL,
      signature_request_json TEXT NOT NULL,
      author_did TEXT,
      subject_did TEXT,
      schema_name TEXT,
      schema_version TEXT,
      author_goal_code TEXT,
      state TEXT NOT NULL,
      unroutable INTEGER NOT NULL DEFAULT 1,
      decision_source TEXT NOT NULL DEFAULT 'none',
      decision TEXT,
      refusal_reason TEXT,
      failure_reason TEXT,
      last_error TEXT,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL,
      decided_at DATETIME
    );",

    // Agent-reported states for transactions whose request has not arrived
    // yet. Taken and replayed when the request lands.
    "CREATE TABLE IF NOT EXISTS early_transaction_reports (
      transaction_id TEXT PRIMARY KEY,
      state TEXT NOT NULL,
      decision TEXT,
      failure_reason TEXT,
      reported_at DATETIME NOT NULL
    );",

    "CREATE TABLE IF NOT EXISTS witness_requests (
      record_id TEXT PRIMARY KEY,
      record_type TEXT NOT NULL,
      state TEXT NOT NULL,
      scid TEXT NOT NULL,
      domain TEXT NOT NULL,
      namespace TEXT NOT NULL,
      identifier TEXT NOT NULL,
      record_json TEXT NOT NULL,
      decision_source TEXT NOT NULL DEFAULT 'none',
      decision TEXT,
      last_error TEXT,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL,
      decided_at DATETIME
    );",

    // Allow-list columns hold either a literal value or the `*` wildcard.
    "CREATE TABLE IF NOT EXISTS allowed_public_dids (
      registered_did TEXT PRIMARY KEY,
      details TEXT,
      created_at DATETIME NOT NULL
    );",

    "CREATE TABLE IF NOT EXISTS allowed_schemas (
      allowed_schema_id TEXT PRIMARY KEY,
      author_did TEXT NOT NULL,
      schema_name TEXT NOT NULL,
      version TEXT NOT NULL,
      details TEXT,
      created_at DATETIME NOT NULL,
      UNIQUE (author_did, schema_name, version)
    );",

    "CREATE TABLE IF NOT EXISTS allowed_log_entries (
      allowed_log_entry_id TEXT PRIMARY KEY,
      scid TEXT NOT NULL,
      domain TEXT NOT NULL,
      namespace TEXT NOT NULL,
      identifier TEXT NOT NULL,
      details TEXT,
      created_at DATETIME NOT NULL,
      UNIQUE (scid, domain, namespace, identifier)
    );",

    "CREATE INDEX IF NOT EXISTS idx_connections_state ON connections(state);",
    "CREATE INDEX IF NOT EXISTS idx_witness_requests_state
      ON witness_requests(state, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_endorse_transactions_state
      ON endorse_transactions(state, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_endorse_transactions_connection
      ON endorse_transactions(connection_id, state, unroutable);",
];

async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), EngineError> {
    for statement in SCHEMA_BOOTSTRAP_SQL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn utc_now() -> chrono::DateTime<Utc> {
    Utc::now()
}

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// `(limit, offset)` for 1-indexed page numbers.
pub fn page_window(page_size: Option<i64>, page_num: Option<i64>) -> (i64, i64) {
    let size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let num = page_num.unwrap_or(1).max(1);
    (size, num.saturating_sub(1).saturating_mul(size))
}
