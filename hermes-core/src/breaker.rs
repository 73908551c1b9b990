//! # Circuit Breaker
//!
//! Per-provider penalty state with exponential cooldown and a self-healing
//! probe. The breaker keeps traffic away from an upstream that is failing,
//! without ever writing it off permanently:
//!
//! - **Closed** — traffic allowed. A qualifying failure opens the circuit
//!   with a penalty that starts at 30 minutes and doubles per consecutive
//!   failure up to a 4 hour cap.
//! - **Open** — the dispatcher must skip the provider until the penalty
//!   expires.
//! - **HalfOpen** — penalty expired; one probe request at a time may test
//!   the upstream. Probe success resets everything; probe failure re-opens
//!   with a doubled penalty.
//!
//! A success while closed resets the consecutive-failure count and halves
//! the pending penalty back toward its initial value, so a provider that
//! recovered organically is not punished at full strength for its next
//! hiccup. Crossing the consecutive-failure threshold additionally flags
//! the provider for a model re-sync: repeated failures often mean its
//! advertised model set is stale.
//!
//! State is sharded per provider and updated under the entry lock only.

use crate::clock::Clock;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Breaker tuning, runtime-adjustable through the settings surface.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub initial_penalty: Duration,
    pub max_penalty: Duration,
    /// Consecutive failures at which a model re-sync is requested.
    pub resync_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            initial_penalty: Duration::from_secs(30 * 60),
            max_penalty: Duration::from_secs(4 * 60 * 60),
            resync_threshold: 3,
        }
    }
}

/// Observable state of one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    consecutive_failures: u32,
    current_penalty: Duration,
    /// Monotonic instant the penalty expires; `None` when closed.
    penalty_until: Option<Duration>,
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new(initial_penalty: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_penalty: initial_penalty,
            penalty_until: None,
            probe_in_flight: false,
        }
    }

    fn state(&self, now: Duration) -> BreakerState {
        match self.penalty_until {
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }
}

/// What a failure transition decided, for the dispatcher to act on.
#[derive(Debug, Clone)]
pub struct FailureDecision {
    pub consecutive_failures: u32,
    pub penalty: Duration,
    /// The failure count crossed the re-sync threshold.
    pub resync_due: bool,
}

/// Point-in-time view for `/health` and the admin breaker endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub current_penalty_ms: u64,
    /// Milliseconds until the penalty expires; zero when not open.
    pub open_remaining_ms: u64,
}

/// Sharded per-provider circuit breakers.
pub struct BreakerBank {
    clock: Arc<dyn Clock>,
    config: RwLock<BreakerConfig>,
    entries: DashMap<String, BreakerEntry>,
}

impl BreakerBank {
    pub fn new(clock: Arc<dyn Clock>, config: BreakerConfig) -> Self {
        Self {
            clock,
            config: RwLock::new(config),
            entries: DashMap::new(),
        }
    }

    /// Swap in new tuning. Existing penalties keep running; the new values
    /// apply from the next transition.
    pub async fn update_config(&self, config: BreakerConfig) {
        *self.config.write().await = config;
    }

    pub async fn config(&self) -> BreakerConfig {
        self.config.read().await.clone()
    }

    pub fn state(&self, provider_id: &str) -> BreakerState {
        let now = self.clock.now_mono();
        self.entries
            .get(provider_id)
            .map(|e| e.state(now))
            .unwrap_or(BreakerState::Closed)
    }

    /// Record a success. In half-open this is a successful probe-through
    /// and fully resets the circuit; while closed it decays the penalty.
    pub async fn on_success(&self, provider_id: &str) {
        let config = self.config.read().await.clone();
        let now = self.clock.now_mono();
        let mut entry = self
            .entries
            .entry(provider_id.to_string())
            .or_insert_with(|| BreakerEntry::new(config.initial_penalty));
        match entry.state(now) {
            BreakerState::HalfOpen => {
                entry.consecutive_failures = 0;
                entry.current_penalty = config.initial_penalty;
                entry.penalty_until = None;
                entry.probe_in_flight = false;
                tracing::info!(provider = provider_id, "circuit breaker closed");
            }
            BreakerState::Closed => {
                entry.consecutive_failures = 0;
                entry.current_penalty =
                    std::cmp::max(config.initial_penalty, entry.current_penalty / 2);
                entry.probe_in_flight = false;
            }
            BreakerState::Open => {
                // A straggler from before the trip finished well. Not enough
                // evidence to close early; the probe will decide.
                tracing::debug!(provider = provider_id, "success while circuit open, ignored");
            }
        }
    }

    /// Record a qualifying failure and open the circuit. The first failure
    /// of a run applies the current penalty; each subsequent one doubles it
    /// up to the cap.
    pub async fn on_failure(&self, provider_id: &str) -> FailureDecision {
        let config = self.config.read().await.clone();
        let now = self.clock.now_mono();
        let mut entry = self
            .entries
            .entry(provider_id.to_string())
            .or_insert_with(|| BreakerEntry::new(config.initial_penalty));

        if entry.consecutive_failures > 0 {
            entry.current_penalty = std::cmp::min(config.max_penalty, entry.current_penalty * 2);
        } else {
            entry.current_penalty = entry
                .current_penalty
                .clamp(config.initial_penalty, config.max_penalty);
        }
        entry.consecutive_failures += 1;
        entry.penalty_until = Some(now + entry.current_penalty);
        entry.probe_in_flight = false;

        let decision = FailureDecision {
            consecutive_failures: entry.consecutive_failures,
            penalty: entry.current_penalty,
            resync_due: entry.consecutive_failures >= config.resync_threshold,
        };
        tracing::warn!(
            provider = provider_id,
            failures = decision.consecutive_failures,
            penalty_ms = decision.penalty.as_millis() as u64,
            "circuit breaker opened"
        );
        decision
    }

    /// Claim the single probe slot for a half-open provider. Returns false
    /// when the provider is not half-open or a probe is already in flight.
    /// The slot is released by the following `on_success` / `on_failure`.
    pub fn try_begin_probe(&self, provider_id: &str) -> bool {
        let now = self.clock.now_mono();
        let Some(mut entry) = self.entries.get_mut(provider_id) else {
            return false;
        };
        if entry.state(now) != BreakerState::HalfOpen || entry.probe_in_flight {
            return false;
        }
        entry.probe_in_flight = true;
        true
    }

    /// Admin reset: back to closed with pristine counters.
    pub async fn reset(&self, provider_id: &str) {
        let config = self.config.read().await.clone();
        if let Some(mut entry) = self.entries.get_mut(provider_id) {
            *entry = BreakerEntry::new(config.initial_penalty);
        }
        tracing::info!(provider = provider_id, "circuit breaker reset");
    }

    /// Drop volatile state for a deleted provider.
    pub fn forget(&self, provider_id: &str) {
        self.entries.remove(provider_id);
    }

    pub fn snapshot(&self, provider_id: &str) -> BreakerSnapshot {
        let now = self.clock.now_mono();
        match self.entries.get(provider_id) {
            Some(entry) => BreakerSnapshot {
                provider_id: provider_id.to_string(),
                state: entry.state(now),
                consecutive_failures: entry.consecutive_failures,
                current_penalty_ms: entry.current_penalty.as_millis() as u64,
                open_remaining_ms: entry
                    .penalty_until
                    .map(|until| until.saturating_sub(now).as_millis() as u64)
                    .unwrap_or(0),
            },
            None => BreakerSnapshot {
                provider_id: provider_id.to_string(),
                state: BreakerState::Closed,
                consecutive_failures: 0,
                current_penalty_ms: 0,
                open_remaining_ms: 0,
            },
        }
    }

    /// Snapshots for every provider with breaker state.
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }

    /// Number of circuits currently open.
    pub fn open_count(&self) -> usize {
        let now = self.clock.now_mono();
        self.entries
            .iter()
            .filter(|e| e.state(now) == BreakerState::Open)
            .count()
    }
}
