//! Provider table accessors.
//!
//! Provider mutations ride the durable write path; the registry owns the
//! in-memory snapshot and calls down here before swapping it.

use super::Store;
use crate::error::StoreError;
use crate::models::{Provider, ProviderStatus, SyncRecord, SyncResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

pub(crate) fn wall_to_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn text_to_wall(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn models_to_json(models: &BTreeSet<String>) -> Result<String, StoreError> {
    Ok(serde_json::to_string(models)?)
}

fn json_to_models(text: &str) -> BTreeSet<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn row_to_provider(row: &Row<'_>) -> rusqlite::Result<Provider> {
    let models: String = row.get(4)?;
    let blacklist: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created: String = row.get(7)?;
    let synced: Option<String> = row.get(8)?;
    let used: Option<String> = row.get(9)?;
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        api_key: row.get(3)?,
        models: json_to_models(&models),
        blacklist: json_to_models(&blacklist),
        status: ProviderStatus::parse(&status).unwrap_or(ProviderStatus::Pending),
        created_at: text_to_wall(&created),
        last_synced_at: synced.as_deref().map(text_to_wall),
        last_used_at: used.as_deref().map(text_to_wall),
    })
}

const PROVIDER_COLUMNS: &str =
    "id, name, base_url, api_key, models, blacklist, status, created_at, last_synced_at, last_used_at";

fn insert_sync_rows(conn: &Connection, records: &[SyncRecord]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO sync_logs (provider_id, provider_name, model, result, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for r in records {
        stmt.execute(params![
            r.provider_id,
            r.provider_name,
            r.model,
            r.result.as_str(),
            r.message,
            wall_to_text(r.created_at),
        ])?;
    }
    Ok(())
}

impl Store {
    /// Insert a new provider together with its registration sync row, in
    /// one transaction.
    pub async fn create_provider(&self, provider: Provider) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO providers
                 (id, name, base_url, api_key, models, blacklist, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    provider.id,
                    provider.name,
                    provider.base_url,
                    provider.api_key,
                    models_to_json(&provider.models)?,
                    models_to_json(&provider.blacklist)?,
                    provider.status.as_str(),
                    wall_to_text(provider.created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict {
                    message: format!("provider {} already exists", provider.id),
                });
            }
            insert_sync_rows(
                &tx,
                &[SyncRecord {
                    provider_id: provider.id.clone(),
                    provider_name: provider.name.clone(),
                    model: String::new(),
                    result: SyncResult::Ok,
                    message: "provider registered".into(),
                    created_at: provider.created_at,
                }],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_provider(&self, id: String) -> Result<Option<Provider>, StoreError> {
        self.with_reader(move |conn| {
            let provider = conn
                .query_row(
                    &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1"),
                    params![id],
                    row_to_provider,
                )
                .optional()?;
            Ok(provider)
        })
        .await
    }

    pub async fn list_providers(&self) -> Result<Vec<Provider>, StoreError> {
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map([], row_to_provider)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Overwrite the mutable fields of a provider.
    pub async fn update_provider(&self, provider: Provider) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            let changed = conn.execute(
                "UPDATE providers SET
                   name = ?2, base_url = ?3, api_key = ?4, models = ?5,
                   blacklist = ?6, status = ?7, last_synced_at = ?8
                 WHERE id = ?1",
                params![
                    provider.id,
                    provider.name,
                    provider.base_url,
                    provider.api_key,
                    models_to_json(&provider.models)?,
                    models_to_json(&provider.blacklist)?,
                    provider.status.as_str(),
                    provider.last_synced_at.map(wall_to_text),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "provider",
                    id: provider.id,
                });
            }
            Ok(())
        })
        .await
    }

    /// Apply a sync result: new model list, status, `last_synced_at`, plus
    /// the per-model sync rows, in one transaction.
    pub async fn apply_sync(
        &self,
        id: String,
        models: BTreeSet<String>,
        blacklist: BTreeSet<String>,
        status: ProviderStatus,
        synced_at: DateTime<Utc>,
        records: Vec<SyncRecord>,
    ) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE providers SET models = ?2, blacklist = ?3, status = ?4, last_synced_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    models_to_json(&models)?,
                    models_to_json(&blacklist)?,
                    status.as_str(),
                    wall_to_text(synced_at),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "provider",
                    id,
                });
            }
            insert_sync_rows(&tx, &records)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Record a failed sync: append the error row and optionally demote the
    /// provider's status, leaving its model list untouched.
    pub async fn record_sync_failure(
        &self,
        id: String,
        status: Option<ProviderStatus>,
        record: SyncRecord,
    ) -> Result<(), StoreError> {
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            if let Some(status) = status {
                tx.execute(
                    "UPDATE providers SET status = ?2 WHERE id = ?1",
                    params![id, status.as_str()],
                )?;
            }
            insert_sync_rows(&tx, &[record])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn delete_provider(&self, id: String) -> Result<(), StoreError> {
        self.with_writer_durable(move |conn| {
            let changed = conn.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "provider",
                    id,
                });
            }
            Ok(())
        })
        .await
    }

    /// Batch update of `last_used_at`, flushed by the log sink.
    pub async fn touch_providers_used(
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
                    .prepare_cached("UPDATE providers SET last_used_at = ?2 WHERE id = ?1")?;
                for (id, at) in &touches {
                    stmt.execute(params![id, wall_to_text(*at)])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
