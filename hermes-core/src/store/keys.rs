//! Gateway keys and the settings KV face.

use super::providers::{text_to_wall, wall_to_text};
use super::Store;
use crate::error::StoreError;
use crate::models::{GatewayKey, KeyScope};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::collections::HashMap;

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<GatewayKey> {
    let scope: String = row.get(3)?;
    let created: String = row.get(4)?;
    let used: Option<String> = row.get(5)?;
    Ok(GatewayKey {
        id: row.get(0)?,
        key_hash: row.get(1)?,
        description: row.get(2)?,
        scope: KeyScope::parse(&scope).unwrap_or(KeyScope::Standard),
        created_at: text_to_wall(&created),
        last_used_at: used.as_deref().map(text_to_wall),
    })
}

impl Store {
    pub async fn insert_key(&self, key: GatewayKey) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO hermes_keys
                 (id, key_hash, description, scope, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.id,
                    key.key_hash,
                    key.description,
                    key.scope.as_str(),
                    wall_to_text(key.created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict {
                    message: format!("key {} already exists", key.id),
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn list_keys(&self) -> Result<Vec<GatewayKey>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, key_hash, description, scope, created_at, last_used_at
                 FROM hermes_keys ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([], row_to_key)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn delete_key(&self, id: String) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            let changed = conn.execute("DELETE FROM hermes_keys WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "key",
                    id,
                });
            }
            Ok(())
        })
        .await
    }

    /// Batch update of key `last_used_at`, flushed by the log sink.
    pub async fn touch_keys_used(
        &self,
        touches: Vec<(String, DateTime<Utc>)>,
    ) -> Result<(), StoreError> {
        if touches.is_empty() {
            return Ok(());
        }
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx
                    .prepare_cached("UPDATE hermes_keys SET last_used_at = ?2 WHERE id = ?1")?;
                for (id, at) in &touches {
                    stmt.execute(params![id, wall_to_text(*at)])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_setting(&self, key: String) -> Result<Option<String>, StoreError> {
        self.with_reader(move |conn| {
            use rusqlite::OptionalExtension;
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn set_setting(&self, key: String, value: String) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn all_settings(&self) -> Result<HashMap<String, String>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached("SELECT key, value FROM settings")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(rows)
        })
        .await
    }
}
