//! Core entity types shared between the store, registry, and gateway.
//!
//! These mirror the persisted tables one-to-one. Volatile routing state
//! (scorer entries, breaker entries) lives with its owning component and is
//! deliberately absent here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle status of an upstream provider.
///
/// Providers are created `Pending`, become `Active` on their first
/// successful model sync, and drop to `Error` on a catastrophic sync
/// failure while still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Active,
    Pending,
    Error,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Pending => "pending",
            ProviderStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProviderStatus::Active),
            "pending" => Some(ProviderStatus::Pending),
            "error" => Some(ProviderStatus::Error),
            _ => None,
        }
    }
}

/// An upstream provider as persisted in the `providers` table.
///
/// `models` holds the advertised set after normalization; `blacklist` is the
/// subset never offered downstream. The effective set is `models - blacklist`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Opaque bearer credential injected on upstream calls. Never logged.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Advertised model set, normalized. Ordered for stable serialization.
    pub models: BTreeSet<String>,
    /// Models never offered downstream, normalized.
    pub blacklist: BTreeSet<String>,
    pub status: ProviderStatus,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Provider {
    /// Advertised minus blacklisted models.
    pub fn effective_models(&self) -> impl Iterator<Item = &String> {
        self.models.iter().filter(|m| !self.blacklist.contains(*m))
    }

    pub fn serves(&self, normalized_model: &str) -> bool {
        self.models.contains(normalized_model) && !self.blacklist.contains(normalized_model)
    }
}

/// Outcome of a single model-sync observation, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub provider_id: String,
    /// Name snapshot at sync time; survives provider renames and deletes.
    pub provider_name: String,
    pub model: String,
    pub result: SyncResult,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncResult {
    Ok,
    Error,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Ok => "ok",
            SyncResult::Error => "error",
        }
    }
}

/// One gateway request, append-only. `duration_ms` feeds the latency EWMA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub client_ip: String,
    pub created_at: DateTime<Utc>,
}

/// Access scope of a gateway key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    Standard,
    Admin,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Standard => "standard",
            KeyScope::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(KeyScope::Standard),
            "admin" => Some(KeyScope::Admin),
            _ => None,
        }
    }
}

/// A gateway API key. Only the SHA-256 hex digest of the secret is stored;
/// the plaintext is shown once at creation and never again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayKey {
    pub id: String,
    pub key_hash: String,
    pub description: String,
    pub scope: KeyScope,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Aggregate counter deltas flushed by the log sink in batches.
///
/// `requests`/`errors` feed the global counters (and the per-model count
/// when `model` is set); the `provider_*` fields feed the per-provider
/// table independently, so attempt-level and request-level accounting can
/// come from different call sites.
#[derive(Debug, Clone, Default)]
pub struct CounterDelta {
    pub requests: u64,
    pub errors: u64,
    pub model: Option<String>,
    pub provider_id: Option<String>,
    pub provider_requests: u64,
    pub provider_errors: u64,
}

/// Persisted counter snapshot, as served by the admin metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CounterSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub per_model: Vec<ModelCount>,
    pub per_provider: Vec<ProviderCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCount {
    pub model: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCount {
    pub provider_id: String,
    pub count: u64,
    pub errors: u64,
}

/// The two fields Hermes reads out of a chat-completion body. Everything
/// else is forwarded verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequestMeta {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
}
