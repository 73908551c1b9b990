//! # Provider Registry
//!
//! Owns the in-memory view of every configured upstream: a copy-on-write
//! snapshot keyed by provider id plus an inverted index from normalized
//! model name to the providers advertising it. Reads are lock-free; every
//! mutation goes through the store first and then swaps a freshly built
//! snapshot in.
//!
//! ## Model synchronization
//!
//! Each provider's advertised model set is refreshed by fetching
//! `GET {base_url}/v1/models` with the provider's credential:
//!
//! - success normalizes the ids, persists the new list, appends one sync
//!   record per added/removed model, stamps `last_synced_at`, and promotes
//!   the provider to `active`;
//! - failure appends an error record, leaves the existing models in place,
//!   and demotes to `error` only if the provider was still `pending`;
//! - at most one outgoing sync per provider per 5 s — concurrent callers
//!   for the same provider coalesce on a per-provider gate;
//! - a periodic ticker re-syncs every provider with bounded concurrency.
//!
//! On-demand re-syncs arrive from the circuit breaker's threshold rule,
//! from model-missing classifications in the proxy, and from the admin API.

use crate::clock::Clock;
use crate::error::{StoreError, UpstreamError};
use crate::models::{Provider, ProviderStatus, SyncRecord, SyncResult};
use crate::normalizer::ModelNormalizer;
use crate::settings::RuntimeSettings;
use crate::store::Store;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

/// Outgoing sync timeout.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
/// RPM protection: minimum spacing between syncs of one provider.
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);
/// Bounded fan-out for the periodic sweep.
const SYNC_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Sync failed: {0}")]
    Sync(#[from] UpstreamError),

    #[error("Invalid provider: {message}")]
    Invalid { message: String },
}

/// Immutable view handed to readers. Swapped wholesale on every mutation.
pub struct RegistrySnapshot {
    pub generation: u64,
    providers: HashMap<String, Arc<Provider>>,
    by_model: HashMap<String, Vec<String>>,
}

impl RegistrySnapshot {
    fn build(generation: u64, providers: Vec<Provider>) -> Self {
        let providers: HashMap<String, Arc<Provider>> = providers
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(p)))
            .collect();
        let mut by_model: HashMap<String, Vec<String>> = HashMap::new();
        for p in providers.values() {
            for model in p.effective_models() {
                by_model.entry(model.clone()).or_default().push(p.id.clone());
            }
        }
        for ids in by_model.values_mut() {
            ids.sort();
        }
        Self {
            generation,
            providers,
            by_model,
        }
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<Provider>> {
        self.providers.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Providers whose effective set contains `normalized_model`,
    /// regardless of status; the dispatcher filters on lifecycle.
    pub fn providers_for(&self, normalized_model: &str) -> Vec<Arc<Provider>> {
        self.by_model
            .get(normalized_model)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.providers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Union of effective model sets over active providers, deduplicated.
    pub fn effective_model_union(&self) -> BTreeSet<String> {
        let mut union = BTreeSet::new();
        for p in self.providers.values() {
            if p.status == ProviderStatus::Active {
                union.extend(p.effective_models().cloned());
            }
        }
        union
    }
}

/// Fields accepted when registering a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProvider {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub models: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
    pub status: Option<ProviderStatus>,
}

/// Result of one sync attempt.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// True when the RPM gate short-circuited the fetch.
    pub coalesced: bool,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Default)]
struct SyncGate {
    last_attempt: Option<Duration>,
}

pub struct ProviderRegistry {
    store: Store,
    normalizer: Arc<ModelNormalizer>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    snapshot: ArcSwap<RegistrySnapshot>,
    /// Serializes store-mutation + snapshot rebuild; readers never take it.
    mutate: Mutex<u64>,
    sync_gates: DashMap<String, Arc<Mutex<SyncGate>>>,
    sync_permits: Arc<Semaphore>,
    settings: Arc<RuntimeSettings>,
}

impl ProviderRegistry {
    /// Load all providers from the store and build the first snapshot.
    pub async fn load(
        store: Store,
        normalizer: Arc<ModelNormalizer>,
        clock: Arc<dyn Clock>,
        settings: Arc<RuntimeSettings>,
    ) -> Result<Self, RegistryError> {
        let providers = store.list_providers().await?;
        let snapshot = RegistrySnapshot::build(0, providers);
        let http = reqwest::Client::builder()
            .timeout(SYNC_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(UpstreamError::Http)?;
        tracing::info!(providers = snapshot.len(), "provider registry loaded");
        Ok(Self {
            store,
            normalizer,
            clock,
            http,
            snapshot: ArcSwap::from_pointee(snapshot),
            mutate: Mutex::new(0),
            sync_gates: DashMap::new(),
            sync_permits: Arc::new(Semaphore::new(SYNC_CONCURRENCY)),
            settings,
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn normalizer(&self) -> &ModelNormalizer {
        &self.normalizer
    }

    /// Rebuild the snapshot from the store under the mutate lock.
    async fn refresh(&self, generation_guard: &mut u64) -> Result<(), RegistryError> {
        let providers = self.store.list_providers().await?;
        *generation_guard += 1;
        self.snapshot
            .store(Arc::new(RegistrySnapshot::build(*generation_guard, providers)));
        Ok(())
    }

    /// Register a provider in `pending` state. The caller usually follows
    /// up with [`sync_provider`](Self::sync_provider).
    pub async fn create(&self, new: NewProvider) -> Result<Arc<Provider>, RegistryError> {
        if new.name.trim().is_empty() {
            return Err(RegistryError::Invalid {
                message: "name must not be empty".into(),
            });
        }
        let base_url = new.base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RegistryError::Invalid {
                message: format!("base_url '{base_url}' is not an http(s) URL"),
            });
        }

        let provider = Provider {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            base_url,
            api_key: new.api_key,
            models: self.normalize_set(&new.models),
            blacklist: self.normalize_set(&new.blacklist),
            status: ProviderStatus::Pending,
            created_at: self.clock.now_wall(),
            last_synced_at: None,
            last_used_at: None,
        };

        let mut generation = self.mutate.lock().await;
        self.store.create_provider(provider.clone()).await?;
        self.refresh(&mut generation).await?;
        drop(generation);

        tracing::info!(provider = %provider.id, name = %provider.name, "provider registered");
        Ok(Arc::new(provider))
    }

    pub async fn patch(&self, id: &str, patch: ProviderPatch) -> Result<Arc<Provider>, RegistryError> {
        let mut generation = self.mutate.lock().await;
        let mut current = self
            .store
            .get_provider(id.to_string())
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "provider",
                id: id.to_string(),
            })?;

        if let Some(name) = patch.name {
            current.name = name;
        }
        if let Some(base_url) = patch.base_url {
            current.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(api_key) = patch.api_key {
            current.api_key = api_key;
        }
        if let Some(models) = patch.models {
            current.models = self.normalize_set(&models);
        }
        if let Some(blacklist) = patch.blacklist {
            current.blacklist = self.normalize_set(&blacklist);
        }
        if let Some(status) = patch.status {
            current.status = status;
        }

        self.store.update_provider(current.clone()).await?;
        self.refresh(&mut generation).await?;
        Ok(Arc::new(current))
    }

    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let mut generation = self.mutate.lock().await;
        self.store.delete_provider(id.to_string()).await?;
        self.refresh(&mut generation).await?;
        self.sync_gates.remove(id);
        tracing::info!(provider = id, "provider deleted");
        Ok(())
    }

    /// Local filter applied when an upstream 404s a model it advertised:
    /// the model joins the provider's blacklist so it drops out of the
    /// inverted index immediately.
    pub async fn blacklist_model(&self, id: &str, model: &str) -> Result<(), RegistryError> {
        let normalized = self.normalizer.normalize(model);
        let mut generation = self.mutate.lock().await;
        let mut current = match self.store.get_provider(id.to_string()).await? {
            Some(p) => p,
            // Deleted concurrently; nothing to filter.
            None => return Ok(()),
        };
        if !current.blacklist.insert(normalized.clone()) {
            return Ok(());
        }
        self.store.update_provider(current).await?;
        self.refresh(&mut generation).await?;
        tracing::warn!(provider = id, model = %normalized, "model blacklisted after upstream 404");
        Ok(())
    }

    /// Fetch the provider's model list and reconcile. Coalesces with any
    /// sync of the same provider in the last 5 s.
    pub async fn sync_provider(&self, id: &str) -> Result<SyncOutcome, RegistryError> {
        let gate = self
            .sync_gates
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SyncGate::default())))
            .clone();
        let mut gate = gate.lock().await;

        let now = self.clock.now_mono();
        if let Some(last) = gate.last_attempt {
            if now.saturating_sub(last) < MIN_SYNC_INTERVAL {
                return Ok(SyncOutcome {
                    coalesced: true,
                    ..Default::default()
                });
            }
        }
        gate.last_attempt = Some(now);

        let provider = self
            .snapshot()
            .provider(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "provider",
                id: id.to_string(),
            })?;

        match self.fetch_models(&provider).await {
            Ok(fetched) => {
                let added: Vec<String> =
                    fetched.difference(&provider.models).cloned().collect();
                let removed: Vec<String> =
                    provider.models.difference(&fetched).cloned().collect();

                let synced_at = self.clock.now_wall();
                let mut records = Vec::with_capacity(added.len() + removed.len());
                for model in &added {
                    records.push(SyncRecord {
                        provider_id: provider.id.clone(),
                        provider_name: provider.name.clone(),
                        model: model.clone(),
                        result: SyncResult::Ok,
                        message: "model added".into(),
                        created_at: synced_at,
                    });
                }
                for model in &removed {
                    records.push(SyncRecord {
                        provider_id: provider.id.clone(),
                        provider_name: provider.name.clone(),
                        model: model.clone(),
                        result: SyncResult::Ok,
                        message: "model removed".into(),
                        created_at: synced_at,
                    });
                }

                let mut generation = self.mutate.lock().await;
                self.store
                    .apply_sync(
                        provider.id.clone(),
                        fetched,
                        provider.blacklist.clone(),
                        ProviderStatus::Active,
                        synced_at,
                        records,
                    )
                    .await?;
                self.refresh(&mut generation).await?;
                drop(generation);

                tracing::info!(
                    provider = %provider.id,
                    added = added.len(),
                    removed = removed.len(),
                    "model sync complete"
                );
                Ok(SyncOutcome {
                    added,
                    removed,
                    coalesced: false,
                })
            }
            Err(e) => {
                // Keep whatever models we had; only a still-pending
                // provider is demoted.
                let demote = (provider.status == ProviderStatus::Pending)
                    .then_some(ProviderStatus::Error);
                let record = SyncRecord {
                    provider_id: provider.id.clone(),
                    provider_name: provider.name.clone(),
                    model: String::new(),
                    result: SyncResult::Error,
                    message: e.to_string(),
                    created_at: self.clock.now_wall(),
                };
                let mut generation = self.mutate.lock().await;
                self.store
                    .record_sync_failure(provider.id.clone(), demote, record)
                    .await?;
                self.refresh(&mut generation).await?;
                drop(generation);

                tracing::warn!(provider = %provider.id, error = %e, "model sync failed");
                Err(RegistryError::Sync(e))
            }
        }
    }

    async fn fetch_models(&self, provider: &Provider) -> Result<BTreeSet<String>, UpstreamError> {
        let url = format!("{}/v1/models", provider.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&provider.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Api {
                code: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let models: ModelsResponse = response.json().await?;
        Ok(models
            .data
            .iter()
            .map(|m| self.normalizer.normalize(&m.id))
            .collect())
    }

    /// Fire-and-forget re-sync, used by the breaker threshold rule and the
    /// proxy's model-missing handling.
    pub fn request_resync(self: &Arc<Self>, id: &str) {
        let registry = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let _permit = registry.sync_permits.clone().acquire_owned().await;
            if let Err(e) = registry.sync_provider(&id).await {
                tracing::debug!(provider = %id, error = %e, "requested re-sync failed");
            }
        });
    }

    /// Periodic full sweep. Runs until the returned handle is aborted.
    pub fn spawn_periodic_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = registry.settings.current().periodic_sync_interval;
                tokio::time::sleep(interval).await;
                let ids: Vec<String> = registry
                    .snapshot()
                    .all()
                    .map(|p| p.id.clone())
                    .collect();
                tracing::debug!(providers = ids.len(), "periodic model sync sweep");
                let mut tasks = Vec::with_capacity(ids.len());
                for id in ids {
                    let registry = registry.clone();
                    tasks.push(tokio::spawn(async move {
                        let _permit = registry.sync_permits.clone().acquire_owned().await;
                        let _ = registry.sync_provider(&id).await;
                    }));
                }
                for task in tasks {
                    let _ = task.await;
                }
            }
        })
    }

    fn normalize_set(&self, models: &[String]) -> BTreeSet<String> {
        models
            .iter()
            .map(|m| self.normalizer.normalize(m))
            .filter(|m| !m.is_empty())
            .collect()
    }
}
