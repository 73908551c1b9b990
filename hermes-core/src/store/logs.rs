//! Append-only log tables and aggregate counters.
//!
//! These are written exclusively in batches by the log sink, one
//! transaction per batch with relaxed durability.

use super::providers::{text_to_wall, wall_to_text};
use super::Store;
use crate::error::StoreError;
use crate::models::{
    CounterDelta, CounterSnapshot, ModelCount, ProviderCount, RequestRecord, SyncRecord,
    SyncResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let created: String = row.get(6)?;
    Ok(RequestRecord {
        method: row.get(0)?,
        path: row.get(1)?,
        model: row.get(2)?,
        status: row.get::<_, i64>(3)? as u16,
        duration_ms: row.get::<_, i64>(4)? as u64,
        client_ip: row.get(5)?,
        created_at: text_to_wall(&created),
    })
}

fn row_to_sync(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    let result: String = row.get(3)?;
    let created: String = row.get(5)?;
    Ok(SyncRecord {
        provider_id: row.get(0)?,
        provider_name: row.get(1)?,
        model: row.get(2)?,
        result: if result == "ok" {
            SyncResult::Ok
        } else {
            SyncResult::Error
        },
        message: row.get(4)?,
        created_at: text_to_wall(&created),
    })
}

impl Store {
    pub async fn append_request_logs(
        &self,
        records: Vec<RequestRecord>,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO request_logs
                     (method, path, model, status, duration_ms, client_ip, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for r in &records {
                    stmt.execute(params![
                        r.method,
                        r.path,
                        r.model,
                        r.status as i64,
                        r.duration_ms as i64,
                        r.client_ip,
                        wall_to_text(r.created_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn append_sync_logs(&self, records: Vec<SyncRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO sync_logs
                     (provider_id, provider_name, model, result, message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for r in &records {
                    stmt.execute(params![
                        r.provider_id,
                        r.provider_name,
                        r.model,
                        r.result.as_str(),
                        r.message,
                        wall_to_text(r.created_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Fold a batch of counter deltas into the three counter tables in one
    /// transaction.
    pub async fn apply_counter_deltas(
        &self,
        deltas: Vec<CounterDelta>,
    ) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut global = tx.prepare_cached(
                    "INSERT INTO counters (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
                )?;
                let mut per_model = tx.prepare_cached(
                    "INSERT INTO model_counts (model, count) VALUES (?1, ?2)
                     ON CONFLICT(model) DO UPDATE SET count = count + excluded.count",
                )?;
                let mut per_provider = tx.prepare_cached(
                    "INSERT INTO provider_counts (provider_id, count, errors) VALUES (?1, ?2, ?3)
                     ON CONFLICT(provider_id) DO UPDATE SET
                       count = count + excluded.count,
                       errors = errors + excluded.errors",
                )?;
                for d in &deltas {
                    if d.requests > 0 {
                        global.execute(params!["requests_total", d.requests as i64])?;
                    }
                    if d.errors > 0 {
                        global.execute(params!["errors_total", d.errors as i64])?;
                    }
                    if let Some(model) = &d.model {
                        per_model.execute(params![model, d.requests as i64])?;
                    }
                    if let Some(provider_id) = &d.provider_id {
                        per_provider.execute(params![
                            provider_id,
                            d.provider_requests as i64,
                            d.provider_errors as i64
                        ])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn query_request_logs(
        &self,
        limit: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        self.with_reader(move |conn| {
            let rows = match since {
                Some(since) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT method, path, model, status, duration_ms, client_ip, created_at
                         FROM request_logs WHERE created_at >= ?1
                         ORDER BY id DESC LIMIT ?2",
                    )?;
                    let result = stmt
                        .query_map(params![wall_to_text(since), limit], row_to_request)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
                None => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT method, path, model, status, duration_ms, client_ip, created_at
                         FROM request_logs ORDER BY id DESC LIMIT ?1",
                    )?;
                    let result = stmt
                        .query_map(params![limit], row_to_request)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
            };
            Ok(rows)
        })
        .await
    }

    pub async fn query_sync_logs(
        &self,
        provider_id: Option<String>,
        limit: u32,
    ) -> Result<Vec<SyncRecord>, StoreError> {
        self.with_reader(move |conn| {
            let rows = match provider_id {
                Some(id) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT provider_id, provider_name, model, result, message, created_at
                         FROM sync_logs WHERE provider_id = ?1
                         ORDER BY id DESC LIMIT ?2",
                    )?;
                    let result = stmt
                        .query_map(params![id, limit], row_to_sync)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
                None => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT provider_id, provider_name, model, result, message, created_at
                         FROM sync_logs ORDER BY id DESC LIMIT ?1",
                    )?;
                    let result = stmt
                        .query_map(params![limit], row_to_sync)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
            };
            Ok(rows)
        })
        .await
    }

    pub async fn count_request_logs(&self) -> Result<u64, StoreError> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM request_logs", [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    pub async fn counter_snapshot(&self) -> Result<CounterSnapshot, StoreError> {
        self.with_reader(|conn| {
            let get_counter = |key: &str| -> rusqlite::Result<u64> {
                conn.query_row(
                    "SELECT value FROM counters WHERE key = ?1",
                    params![key],
                    |r| r.get::<_, i64>(0),
                )
                .map(|v| v as u64)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(0),
                    e => Err(e),
                })
            };
            let requests_total = get_counter("requests_total")?;
            let errors_total = get_counter("errors_total")?;

            let mut stmt = conn
                .prepare_cached("SELECT model, count FROM model_counts ORDER BY count DESC")?;
            let per_model = stmt
                .query_map([], |r| {
                    Ok(ModelCount {
                        model: r.get(0)?,
                        count: r.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare_cached(
                "SELECT provider_id, count, errors FROM provider_counts ORDER BY count DESC",
            )?;
            let per_provider = stmt
                .query_map([], |r| {
                    Ok(ProviderCount {
                        provider_id: r.get(0)?,
                        count: r.get::<_, i64>(1)? as u64,
                        errors: r.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(CounterSnapshot {
                requests_total,
                errors_total,
                per_model,
                per_provider,
            })
        })
        .await
    }
}
