//! # Hermes Core
//!
//! The dispatch engine behind the Hermes gateway. It multiplexes
//! OpenAI-compatible chat-completion traffic across many upstream
//! providers that speak the same wire protocol, choosing the healthiest
//! candidate for each request and learning from every outcome.
//!
//! ## Architecture
//!
//! - **`store`**: WAL-mode SQLite persistence with a single write lane —
//!   providers, sync and request logs, gateway keys, settings, counters.
//! - **`log_sink`**: batched async writer keeping the database off the
//!   request hot path.
//! - **`normalizer`**: canonical model identifiers for the registry index.
//! - **`registry`**: copy-on-write provider snapshots plus the model-sync
//!   workers (cold sync on registration, periodic sweep, on-demand
//!   re-sync).
//! - **`scorer`**: per-provider EWMA success rate and latency with
//!   time-decayed freshness, composed into a score in `[0, 1]`.
//! - **`breaker`**: per-provider circuit breaker with exponential cooldown
//!   and a single-flight self-heal probe.
//! - **`proxy`**: pooled HTTP client, streaming passthrough with
//!   back-pressure, upstream failure classification.
//! - **`dispatcher`**: candidate selection, ranked attempts, outcome
//!   feedback, bounded retry.
//! - **`clock`**: injectable time source so every component above is
//!   deterministic under test.
//!
//! The dependency graph is acyclic: the dispatcher references registry,
//! scorer, breaker, and proxy; nothing references the dispatcher back.
//! Outcomes of in-flight streams are reported through a narrow callback.

pub mod breaker;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod log_sink;
pub mod models;
pub mod normalizer;
pub mod proxy;
pub mod registry;
pub mod scorer;
pub mod settings;
pub mod store;

pub use breaker::{BreakerBank, BreakerConfig, BreakerState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchContext, DispatchResult, Dispatcher};
pub use error::{AttemptClass, AttemptReport, DispatchError, StoreError, UpstreamError};
pub use log_sink::{LogSink, LogSinkConfig, SinkRecord};
pub use models::{
    ChatRequestMeta, CounterDelta, GatewayKey, KeyScope, Provider, ProviderStatus, RequestRecord,
    SyncRecord, SyncResult,
};
pub use normalizer::{AliasTable, ModelNormalizer};
pub use proxy::{Proxy, ProxyConfig, ProxyReply, StreamOutcome};
pub use registry::{NewProvider, ProviderPatch, ProviderRegistry, RegistryError, RegistrySnapshot};
pub use scorer::{Scorer, ScorerSnapshot};
pub use settings::{RuntimeSettings, SettingsError, SettingsValues};
pub use store::Store;
