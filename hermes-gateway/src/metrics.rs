//! # Rolling Request Metrics
//!
//! A bounded in-memory window of recent request samples. `/health`
//! derives per-provider latency percentiles from it; `/admin/metrics`
//! merges it with the persisted counters. Samples age out by count, not
//! by time — the window answers "recently", not "since boot".

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

const DEFAULT_WINDOW: usize = 4096;

#[derive(Debug, Clone)]
struct Sample {
    provider_id: Option<String>,
    latency_ms: u64,
    status: u16,
    first_byte_ms: Option<u64>,
}

/// Latency percentiles over one sample population.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

/// Aggregated view of the rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSummary {
    pub samples: usize,
    pub error_rate: f64,
    pub latency: LatencyPercentiles,
    pub avg_first_byte_ms: Option<f64>,
}

pub struct MetricsRecorder {
    window: RwLock<VecDeque<Sample>>,
    capacity: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub async fn record(
        &self,
        provider_id: Option<String>,
        latency_ms: u64,
        status: u16,
        first_byte_ms: Option<u64>,
    ) {
        let mut window = self.window.write().await;
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(Sample {
            provider_id,
            latency_ms,
            status,
            first_byte_ms,
        });
    }

    pub async fn summary(&self) -> WindowSummary {
        let window = self.window.read().await;
        let samples = window.len();
        let errors = window.iter().filter(|s| s.status >= 400).count();
        let latencies: Vec<u64> = window.iter().map(|s| s.latency_ms).collect();
        let first_bytes: Vec<u64> = window.iter().filter_map(|s| s.first_byte_ms).collect();
        WindowSummary {
            samples,
            error_rate: if samples == 0 {
                0.0
            } else {
                errors as f64 / samples as f64
            },
            latency: percentiles(latencies),
            avg_first_byte_ms: if first_bytes.is_empty() {
                None
            } else {
                Some(first_bytes.iter().sum::<u64>() as f64 / first_bytes.len() as f64)
            },
        }
    }

    /// Percentiles per provider, for `/health`.
    pub async fn provider_latencies(&self) -> HashMap<String, LatencyPercentiles> {
        let window = self.window.read().await;
        let mut by_provider: HashMap<String, Vec<u64>> = HashMap::new();
        for sample in window.iter() {
            if let Some(id) = &sample.provider_id {
                by_provider.entry(id.clone()).or_default().push(sample.latency_ms);
            }
        }
        by_provider
            .into_iter()
            .map(|(id, latencies)| (id, percentiles(latencies)))
            .collect()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn percentiles(mut latencies: Vec<u64>) -> LatencyPercentiles {
    if latencies.is_empty() {
        return LatencyPercentiles::default();
    }
    latencies.sort_unstable();
    let p50_idx = (latencies.len() as f64 * 0.5) as usize;
    let p90_idx = (latencies.len() as f64 * 0.9) as usize;
    let p99_idx = (latencies.len() as f64 * 0.99) as usize;
    let last = latencies.len() - 1;
    LatencyPercentiles {
        p50: latencies[p50_idx.min(last)],
        p90: latencies[p90_idx.min(last)],
        p99: latencies[p99_idx.min(last)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn percentiles_over_known_population() {
        let recorder = MetricsRecorder::new();
        for latency in 1..=100u64 {
            recorder
                .record(Some("p1".into()), latency, 200, None)
                .await;
        }
        let per_provider = recorder.provider_latencies().await;
        let p = per_provider.get("p1").unwrap();
        assert_eq!(p.p50, 51);
        assert_eq!(p.p90, 91);
        assert_eq!(p.p99, 100);
    }

    #[tokio::test]
    async fn error_rate_counts_4xx_and_5xx() {
        let recorder = MetricsRecorder::new();
        recorder.record(None, 10, 200, None).await;
        recorder.record(None, 10, 502, None).await;
        recorder.record(None, 10, 429, None).await;
        recorder.record(None, 10, 200, None).await;
        let summary = recorder.summary().await;
        assert_eq!(summary.samples, 4);
        assert!((summary.error_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn window_is_bounded() {
        let recorder = MetricsRecorder::with_capacity(10);
        for i in 0..25u64 {
            recorder.record(None, i, 200, None).await;
        }
        let summary = recorder.summary().await;
        assert_eq!(summary.samples, 10);
        // Only the last ten samples (15..=24) remain.
        assert_eq!(summary.latency.p50, 20);
    }

    #[tokio::test]
    async fn empty_window_is_all_zero() {
        let recorder = MetricsRecorder::new();
        let summary = recorder.summary().await;
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.latency.p50, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert!(recorder.provider_latencies().await.is_empty());
    }
}
