//! Table definitions and migrations.
//!
//! All statements are idempotent (CREATE IF NOT EXISTS), so migrations can
//! run on every open. New columns go below as ALTER TABLE with the error
//! swallowed when the column already exists.

use crate::error::StoreError;
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS providers (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    base_url        TEXT NOT NULL,
    api_key         TEXT NOT NULL,
    models          TEXT NOT NULL DEFAULT '[]',
    blacklist       TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL DEFAULT 'pending',
    created_at      TEXT NOT NULL,
    last_synced_at  TEXT,
    last_used_at    TEXT
);

CREATE TABLE IF NOT EXISTS sync_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_id     TEXT NOT NULL,
    provider_name   TEXT NOT NULL,
    model           TEXT NOT NULL,
    result          TEXT NOT NULL,
    message         TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_logs_provider ON sync_logs(provider_id);
CREATE INDEX IF NOT EXISTS idx_sync_logs_created ON sync_logs(created_at);

CREATE TABLE IF NOT EXISTS request_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    method          TEXT NOT NULL,
    path            TEXT NOT NULL,
    model           TEXT,
    status          INTEGER NOT NULL,
    duration_ms     INTEGER NOT NULL,
    client_ip       TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_logs_created ON request_logs(created_at);

CREATE TABLE IF NOT EXISTS hermes_keys (
    id              TEXT PRIMARY KEY,
    key_hash        TEXT NOT NULL UNIQUE,
    description     TEXT NOT NULL DEFAULT '',
    scope           TEXT NOT NULL DEFAULT 'standard',
    created_at      TEXT NOT NULL,
    last_used_at    TEXT
);

CREATE TABLE IF NOT EXISTS settings (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS counters (
    key             TEXT PRIMARY KEY,
    value           INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS model_counts (
    model           TEXT PRIMARY KEY,
    count           INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS provider_counts (
    provider_id     TEXT PRIMARY KEY,
    count           INTEGER NOT NULL DEFAULT 0,
    errors          INTEGER NOT NULL DEFAULT 0
);
";

pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
