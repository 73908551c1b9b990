//! # Routing Scorer
//!
//! Per-provider health tracking composed into a single comparable score in
//! `[0, 1]`. Three signals, weighted:
//!
//! - **success** (0.5) — EWMA of attempt outcomes, 1.0 for success, 0.0 for
//!   a provider fault. Initialized to 1.0 so new providers start trusted.
//! - **latency** (0.3) — EWMA of successful-attempt durations normalized
//!   against a 10 s reference. Failures leave latency untouched; a provider
//!   that errors fast must not look fast.
//! - **freshness** (0.2) — exponential decay of the last observation's age
//!   with a 24 h half-life, so stale knowledge loses weight and an unused
//!   provider is eventually re-tried.
//!
//! State is volatile; after a restart it is rebuilt from observation. All
//! entries are sharded per provider, and each update runs under that
//! entry's lock only.

use crate::clock::Clock;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// EWMA smoothing factor.
const ALPHA: f64 = 0.2;
/// Latency normalization reference: anything at or beyond this scores 0.
const LATENCY_REF_MS: f64 = 10_000.0;
/// Freshness half-life.
const FRESHNESS_HALF_LIFE_SECS: f64 = 86_400.0;

const WEIGHT_SUCCESS: f64 = 0.5;
const WEIGHT_LATENCY: f64 = 0.3;
const WEIGHT_FRESHNESS: f64 = 0.2;

#[derive(Debug, Clone)]
struct ScoreEntry {
    ewma_success: f64,
    /// None until the first successful sample.
    ewma_latency_ms: Option<f64>,
    last_sample_at: Duration,
}

impl ScoreEntry {
    fn new(now: Duration) -> Self {
        Self {
            ewma_success: 1.0,
            ewma_latency_ms: None,
            last_sample_at: now,
        }
    }
}

/// Point-in-time view of a provider's scorer state, for `/health` and admin
/// introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ScorerSnapshot {
    pub ewma_success: f64,
    pub ewma_latency_ms: Option<f64>,
    pub age_seconds: Option<f64>,
    pub score: f64,
}

/// Sharded per-provider scoring state.
pub struct Scorer {
    clock: Arc<dyn Clock>,
    entries: DashMap<String, ScoreEntry>,
}

impl Scorer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    /// Record a successful attempt of `duration_ms`.
    pub fn record_success(&self, provider_id: &str, duration_ms: u64) {
        let now = self.clock.now_mono();
        let mut entry = self
            .entries
            .entry(provider_id.to_string())
            .or_insert_with(|| ScoreEntry::new(now));
        let d = duration_ms as f64;
        entry.ewma_latency_ms = Some(match entry.ewma_latency_ms {
            Some(prev) => ALPHA * d + (1.0 - ALPHA) * prev,
            None => d,
        });
        entry.ewma_success = ALPHA + (1.0 - ALPHA) * entry.ewma_success;
        entry.last_sample_at = now;
    }

    /// Record an attempt classed as a provider fault. Latency is left
    /// untouched; only successes carry a meaningful duration.
    pub fn record_failure(&self, provider_id: &str) {
        let now = self.clock.now_mono();
        let mut entry = self
            .entries
            .entry(provider_id.to_string())
            .or_insert_with(|| ScoreEntry::new(now));
        entry.ewma_success = (1.0 - ALPHA) * entry.ewma_success;
        entry.last_sample_at = now;
    }

    /// Composite score in `[0, 1]`. A provider with no samples scores 0.65
    /// (trusted success, neutral latency, zero freshness) so it gets tried.
    pub fn score(&self, provider_id: &str) -> f64 {
        let now = self.clock.now_mono();
        match self.entries.get(provider_id) {
            Some(entry) => Self::compose(&entry, now),
            None => WEIGHT_SUCCESS + WEIGHT_LATENCY * 0.5,
        }
    }

    pub fn snapshot(&self, provider_id: &str) -> ScorerSnapshot {
        let now = self.clock.now_mono();
        match self.entries.get(provider_id) {
            Some(entry) => ScorerSnapshot {
                ewma_success: entry.ewma_success,
                ewma_latency_ms: entry.ewma_latency_ms,
                age_seconds: Some((now.saturating_sub(entry.last_sample_at)).as_secs_f64()),
                score: Self::compose(&entry, now),
            },
            None => ScorerSnapshot {
                ewma_success: 1.0,
                ewma_latency_ms: None,
                age_seconds: None,
                score: WEIGHT_SUCCESS + WEIGHT_LATENCY * 0.5,
            },
        }
    }

    /// Drop volatile state for a deleted provider.
    pub fn forget(&self, provider_id: &str) {
        self.entries.remove(provider_id);
    }

    fn compose(entry: &ScoreEntry, now: Duration) -> f64 {
        let success = entry.ewma_success;
        let lat_norm = match entry.ewma_latency_ms {
            Some(lat) => (1.0 - lat / LATENCY_REF_MS).clamp(0.0, 1.0),
            None => 0.5,
        };
        let age_seconds = now.saturating_sub(entry.last_sample_at).as_secs_f64();
        let freshness = 0.5_f64.powf(age_seconds / FRESHNESS_HALF_LIFE_SECS);
        WEIGHT_SUCCESS * success + WEIGHT_LATENCY * lat_norm + WEIGHT_FRESHNESS * freshness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn scorer() -> (Arc<ManualClock>, Scorer) {
        let clock = Arc::new(ManualClock::new());
        (clock.clone(), Scorer::new(clock))
    }

    #[test]
    fn unseen_provider_scores_baseline() {
        let (_, scorer) = scorer();
        assert!((scorer.score("p1") - 0.65).abs() < 1e-9);
    }

    #[test]
    fn first_success_seeds_latency() {
        let (_, scorer) = scorer();
        scorer.record_success("p1", 180);
        let snap = scorer.snapshot("p1");
        assert_eq!(snap.ewma_latency_ms, Some(180.0));
        assert!((snap.ewma_success - 1.0).abs() < 1e-9);
    }

    #[test]
    fn success_ewma_stays_in_unit_interval() {
        let (_, scorer) = scorer();
        for _ in 0..200 {
            scorer.record_failure("p1");
        }
        let snap = scorer.snapshot("p1");
        assert!(snap.ewma_success >= 0.0 && snap.ewma_success <= 1.0);
        for _ in 0..200 {
            scorer.record_success("p1", 100);
        }
        let snap = scorer.snapshot("p1");
        assert!(snap.ewma_success >= 0.0 && snap.ewma_success <= 1.0);
        assert!(snap.ewma_success > 0.99);
    }

    #[test]
    fn failure_leaves_latency_untouched() {
        let (_, scorer) = scorer();
        scorer.record_success("p1", 200);
        scorer.record_failure("p1");
        assert_eq!(scorer.snapshot("p1").ewma_latency_ms, Some(200.0));
    }

    #[test]
    fn ewma_latency_smooths() {
        let (_, scorer) = scorer();
        scorer.record_success("p1", 100);
        scorer.record_success("p1", 200);
        // 0.2 * 200 + 0.8 * 100 = 120
        assert!((scorer.snapshot("p1").ewma_latency_ms.unwrap() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn score_decays_with_age() {
        let (clock, scorer) = scorer();
        scorer.record_success("p1", 100);
        let fresh = scorer.score("p1");
        clock.advance(Duration::from_secs(86_400));
        let day_old = scorer.score("p1");
        clock.advance(Duration::from_secs(86_400));
        let two_days = scorer.score("p1");
        assert!(fresh > day_old);
        assert!(day_old > two_days);
        // One half-life costs half the freshness weight.
        assert!((fresh - day_old - 0.1).abs() < 1e-6);
    }

    #[test]
    fn faster_provider_scores_higher() {
        let (_, scorer) = scorer();
        scorer.record_success("fast", 100);
        scorer.record_success("slow", 5_000);
        assert!(scorer.score("fast") > scorer.score("slow"));
    }

    #[test]
    fn latency_beyond_reference_clamps_to_zero() {
        let (_, scorer) = scorer();
        scorer.record_success("p1", 60_000);
        let snap = scorer.snapshot("p1");
        // success 1.0 and full freshness, but no latency contribution
        assert!((snap.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn forget_resets_to_baseline() {
        let (_, scorer) = scorer();
        for _ in 0..10 {
            scorer.record_failure("p1");
        }
        assert!(scorer.score("p1") < 0.65);
        scorer.forget("p1");
        assert!((scorer.score("p1") - 0.65).abs() < 1e-9);
    }
}
