//! # Async Log Sink
//!
//! The hot path must never block on the database, so every request log,
//! sync log, counter delta, and last-used touch goes through this sink: a
//! bounded in-memory queue drained by one background worker in batches
//! (at most `batch_max` records, at least every `flush_interval`), written
//! to the store in a single transaction per batch.
//!
//! Overflow policy: when the queue is at capacity the oldest non-request
//! record is evicted first; request logs survive until a hard cap, after
//! which they too are dropped. Every drop increments a counter that is
//! itself reported, so silent loss is observable.

use crate::error::StoreError;
use crate::models::{CounterDelta, RequestRecord, SyncRecord};
use crate::store::Store;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::params;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One record accepted by the sink.
#[derive(Debug, Clone)]
pub enum SinkRecord {
    Request(RequestRecord),
    Sync(SyncRecord),
    Counter(CounterDelta),
    ProviderUsed {
        provider_id: String,
        at: DateTime<Utc>,
    },
    KeyUsed {
        key_id: String,
        at: DateTime<Utc>,
    },
}

impl SinkRecord {
    fn is_request(&self) -> bool {
        matches!(self, SinkRecord::Request(_))
    }
}

#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    /// Soft queue bound; non-request records are evicted beyond it.
    pub queue_capacity: usize,
    /// Hard bound after which request logs are dropped too.
    pub request_hard_cap: usize,
    pub batch_max: usize,
    pub flush_interval: Duration,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            request_hard_cap: 8192,
            batch_max: 100,
            flush_interval: Duration::from_millis(1000),
        }
    }
}

struct SinkShared {
    queue: Mutex<VecDeque<SinkRecord>>,
    notify: Notify,
    dropped: AtomicU64,
    shutdown: AtomicBool,
    config: LogSinkConfig,
}

/// Cheap-to-clone handle for producers.
#[derive(Clone)]
pub struct LogSink {
    shared: Arc<SinkShared>,
}

impl LogSink {
    /// Create the sink and spawn its drain worker.
    pub fn spawn(store: Store, config: LogSinkConfig) -> (Self, tokio::task::JoinHandle<()>) {
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            config,
        });
        let sink = Self {
            shared: shared.clone(),
        };
        let worker = tokio::spawn(drain_loop(store, shared));
        (sink, worker)
    }

    /// Enqueue a record. Never blocks; applies the overflow policy inline.
    pub fn enqueue(&self, record: SinkRecord) {
        let config = &self.shared.config;
        let mut queue = self.shared.queue.lock();

        if queue.len() >= config.queue_capacity {
            // Make room by evicting the oldest non-request record.
            if let Some(pos) = queue.iter().position(|r| !r.is_request()) {
                queue.remove(pos);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            } else if !record.is_request() || queue.len() >= config.request_hard_cap {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        queue.push_back(record);
        let len = queue.len();
        drop(queue);

        if len >= config.batch_max {
            self.shared.notify.notify_one();
        }
    }

    /// Records dropped by the overflow policy since startup.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Ask the worker to drain what remains and exit. Await the handle
    /// returned by [`LogSink::spawn`] afterwards.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

async fn drain_loop(store: Store, shared: Arc<SinkShared>) {
    loop {
        let shutting_down = shared.shutdown.load(Ordering::SeqCst);
        if !shutting_down {
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(shared.config.flush_interval) => {}
            }
        }

        loop {
            let batch: Vec<SinkRecord> = {
                let mut queue = shared.queue.lock();
                let take = queue.len().min(shared.config.batch_max);
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                break;
            }
            if let Err(e) = store.apply_sink_batch(batch).await {
                // Infra errors are logged and never fatal to request
                // handling; the batch is gone but the gateway keeps serving.
                tracing::error!(error = %e, "log sink batch write failed");
            }
            if shared.queue.lock().len() < shared.config.batch_max {
                break;
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) && shared.queue.lock().is_empty() {
            tracing::debug!("log sink worker exiting");
            return;
        }
    }
}

impl Store {
    /// Write one sink batch in a single transaction, in arrival order
    /// within each kind.
    pub async fn apply_sink_batch(&self, batch: Vec<SinkRecord>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_writer(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut requests = tx.prepare_cached(
                    "INSERT INTO request_logs
                     (method, path, model, status, duration_ms, client_ip, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                let mut syncs = tx.prepare_cached(
                    "INSERT INTO sync_logs
                     (provider_id, provider_name, model, result, message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
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
                let mut provider_touch = tx
                    .prepare_cached("UPDATE providers SET last_used_at = ?2 WHERE id = ?1")?;
                let mut key_touch = tx
                    .prepare_cached("UPDATE hermes_keys SET last_used_at = ?2 WHERE id = ?1")?;

                for record in &batch {
                    match record {
                        SinkRecord::Request(r) => {
                            requests.execute(params![
                                r.method,
                                r.path,
                                r.model,
                                r.status as i64,
                                r.duration_ms as i64,
                                r.client_ip,
                                r.created_at.to_rfc3339(),
                            ])?;
                        }
                        SinkRecord::Sync(r) => {
                            syncs.execute(params![
                                r.provider_id,
                                r.provider_name,
                                r.model,
                                r.result.as_str(),
                                r.message,
                                r.created_at.to_rfc3339(),
                            ])?;
                        }
                        SinkRecord::Counter(d) => {
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
                        SinkRecord::ProviderUsed { provider_id, at } => {
                            provider_touch.execute(params![provider_id, at.to_rfc3339()])?;
                        }
                        SinkRecord::KeyUsed { key_id, at } => {
                            key_touch.execute(params![key_id, at.to_rfc3339()])?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
