//! # Authentication and Admission Control
//!
//! Two concerns live here, matching the order a request passes them:
//!
//! **Key validation.** Bearer tokens are hashed with SHA-256 and compared
//! against the stored digests in constant time. Plaintext secrets exist
//! only in the creation response; the store keeps digests. The admin
//! surface additionally accepts the configured backdoor secret, or any
//! key with the `admin` scope.
//!
//! **Sliding-window rate limiting.** Per client key (the validated
//! gateway-key hash when present, the client IP otherwise) a ring of 5 s
//! slots covers the configured window. A request is admitted when the sum
//! of fresh slot counts stays at or under the limit; the decision carries
//! the header values (`limit`, `remaining`, seconds until the oldest
//! fresh slot expires). Idle keys are garbage-collected once no slot is
//! fresh.

use crate::gateway_error::GatewayError;
use dashmap::DashMap;
use hermes_core::clock::Clock;
use hermes_core::log_sink::{LogSink, SinkRecord};
use hermes_core::models::{GatewayKey, KeyScope};
use hermes_core::settings::RuntimeSettings;
use hermes_core::store::Store;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Seconds covered by one ring slot.
const SLOT_SECS: u64 = 5;

pub fn sha256_hex(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Pull the token out of an `Authorization: Bearer ...` header value.
pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
    header?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Validated caller identity.
#[derive(Debug, Clone)]
pub enum Identity {
    Key(GatewayKey),
    /// The configured backdoor secret; admin-only surface.
    Backdoor,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        match self {
            Identity::Backdoor => true,
            Identity::Key(key) => key.scope == KeyScope::Admin,
        }
    }

    /// Stable identifier used as the rate-limit key.
    pub fn rate_key(&self) -> Option<&str> {
        match self {
            Identity::Key(key) => Some(&key.key_hash),
            Identity::Backdoor => None,
        }
    }
}

/// Key management and validation over the store, with an in-memory cache
/// so the hot path never queries the database.
pub struct AuthService {
    store: Store,
    sink: LogSink,
    clock: Arc<dyn Clock>,
    backdoor: Option<String>,
    keys: DashMap<String, GatewayKey>,
}

impl AuthService {
    pub async fn load(
        store: Store,
        sink: LogSink,
        clock: Arc<dyn Clock>,
        backdoor: Option<String>,
    ) -> Result<Self, GatewayError> {
        let service = Self {
            store,
            sink,
            clock,
            backdoor,
            keys: DashMap::new(),
        };
        for key in service.store.list_keys().await? {
            service.keys.insert(key.id.clone(), key);
        }
        tracing::info!(keys = service.keys.len(), "gateway keys loaded");
        Ok(service)
    }

    /// Validate a presented bearer token. The digest of the token is
    /// compared against every cached key digest in constant time.
    pub fn validate_token(&self, token: &str) -> Option<Identity> {
        if let Some(secret) = &self.backdoor {
            if constant_time_eq(token, secret) {
                return Some(Identity::Backdoor);
            }
        }
        let digest = sha256_hex(token);
        let mut matched: Option<GatewayKey> = None;
        for entry in self.keys.iter() {
            if constant_time_eq(&digest, &entry.key_hash) {
                matched = Some(entry.value().clone());
            }
        }
        let key = matched?;
        self.sink.enqueue(SinkRecord::KeyUsed {
            key_id: key.id.clone(),
            at: self.clock.now_wall(),
        });
        Some(Identity::Key(key))
    }

    /// Create a key; the plaintext is returned exactly once.
    pub async fn create_key(
        &self,
        description: String,
        scope: KeyScope,
    ) -> Result<(GatewayKey, String), GatewayError> {
        let plaintext = format!("hm-{}", Uuid::new_v4().simple());
        let key = GatewayKey {
            id: Uuid::new_v4().to_string(),
            key_hash: sha256_hex(&plaintext),
            description,
            scope,
            created_at: self.clock.now_wall(),
            last_used_at: None,
        };
        self.store.insert_key(key.clone()).await?;
        self.keys.insert(key.id.clone(), key.clone());
        tracing::info!(key = %key.id, scope = ?scope, "gateway key created");
        Ok((key, plaintext))
    }

    pub async fn delete_key(&self, id: &str) -> Result<(), GatewayError> {
        self.store.delete_key(id.to_string()).await?;
        self.keys.remove(id);
        tracing::info!(key = id, "gateway key deleted");
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<GatewayKey>, GatewayError> {
        Ok(self.store.list_keys().await?)
    }
}

/// Outcome of an admission check, carrying the response header values.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest fresh slot leaves the window.
    pub reset_secs: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    epoch: u64,
    count: u32,
}

struct WindowRing {
    slots: Vec<Slot>,
}

/// Per-key sliding-window admission control.
pub struct SlidingWindowLimiter {
    clock: Arc<dyn Clock>,
    settings: Arc<RuntimeSettings>,
    entries: DashMap<String, WindowRing>,
}

impl SlidingWindowLimiter {
    pub fn new(clock: Arc<dyn Clock>, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            clock,
            settings,
            entries: DashMap::new(),
        }
    }

    /// Check and count one request for `key`.
    pub fn allow(&self, key: &str) -> RateDecision {
        let settings = self.settings.current();
        let limit = settings.rate_limit_max;
        let slot_count = ((settings.rate_limit_window.as_secs() / SLOT_SECS).max(1)) as usize;

        let now_secs = self.clock.now_mono().as_secs();
        let current_epoch = now_secs / SLOT_SECS;

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowRing {
                slots: vec![Slot::default(); slot_count],
            });

        // Window size changed at runtime: start the ring over.
        if entry.slots.len() != slot_count {
            entry.slots = vec![Slot::default(); slot_count];
        }

        let len = slot_count as u64;
        let idx = (current_epoch % len) as usize;
        if entry.slots[idx].epoch != current_epoch {
            entry.slots[idx] = Slot {
                epoch: current_epoch,
                count: 0,
            };
        }

        let fresh =
            |slot: &Slot| slot.count > 0 && current_epoch.saturating_sub(slot.epoch) < len;
        let sum: u64 = entry
            .slots
            .iter()
            .filter(|s| fresh(s) || s.epoch == current_epoch)
            .map(|s| s.count as u64)
            .sum();

        // Seconds until the oldest fresh slot falls out of the window.
        let reset_secs = entry
            .slots
            .iter()
            .filter(|s| fresh(s))
            .map(|s| ((s.epoch + len) * SLOT_SECS).saturating_sub(now_secs))
            .min()
            .unwrap_or(SLOT_SECS);

        if sum + 1 > limit as u64 {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_secs,
            };
        }

        entry.slots[idx].count += 1;
        RateDecision {
            allowed: true,
            limit,
            remaining: (limit as u64 - (sum + 1)) as u32,
            reset_secs,
        }
    }

    /// Drop keys with no fresh slot. Driven by a periodic task.
    pub fn collect_idle(&self) {
        let settings = self.settings.current();
        let slot_count = (settings.rate_limit_window.as_secs() / SLOT_SECS).max(1);
        let current_epoch = self.clock.now_mono().as_secs() / SLOT_SECS;
        let before = self.entries.len();
        self.entries.retain(|_, ring| {
            ring.slots
                .iter()
                .any(|s| s.count > 0 && current_epoch.saturating_sub(s.epoch) < slot_count)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "rate limiter keys collected");
        }
    }

    /// Spawn the idle-key collector.
    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                limiter.collect_idle();
            }
        })
    }
}
