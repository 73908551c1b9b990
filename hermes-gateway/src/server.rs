//! # HTTP Server Assembly
//!
//! Builds every component of the gateway in dependency order — store,
//! settings, log sink, registry, scorer, breaker, proxy, dispatcher,
//! auth, rate limiter, metrics — and assembles the axum router:
//!
//! - `/v1/*` behind bearer authentication and the sliding-window rate
//!   limiter;
//! - `/admin/*` behind the backdoor secret or an admin-scope key;
//! - `/health` open.
//!
//! Global layers, outermost first: CORS, request context (trace id),
//! logging, response-header timeout. The timeout bounds time to response
//! headers; streaming bodies run as long as the proxy's idle timeout
//! allows.

use crate::auth::{AuthService, SlidingWindowLimiter};
use crate::config::Config;
use crate::handlers::{self, admin, ModelsCache};
use crate::metrics::MetricsRecorder;
use crate::middleware::{
    admin_auth_middleware, auth_middleware, context_middleware, cors_layer, logging_middleware,
};
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use hermes_core::breaker::{BreakerBank, BreakerConfig};
use hermes_core::clock::{Clock, SystemClock};
use hermes_core::dispatcher::Dispatcher;
use hermes_core::log_sink::LogSink;
use hermes_core::normalizer::ModelNormalizer;
use hermes_core::proxy::Proxy;
use hermes_core::registry::ProviderRegistry;
use hermes_core::scorer::Scorer;
use hermes_core::settings::RuntimeSettings;
use hermes_core::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

const MODELS_CACHE_TTL: Duration = Duration::from_secs(30);

/// Shared state behind every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub sink: LogSink,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<RuntimeSettings>,
    pub registry: Arc<ProviderRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub metrics: Arc<MetricsRecorder>,
    pub models_cache: Arc<ModelsCache>,
    /// Drain worker for the log sink, awaited on shutdown.
    pub sink_worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Build the router and its state from configuration.
///
/// Fails on store open or HTTP client construction — both bootstrap
/// errors (exit code 1 in the binary).
pub async fn create_server(config: Config) -> anyhow::Result<(Router, AppState)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = Store::open(&config.store.db_path)?;

    // Persisted settings overlay the file-provided defaults.
    let persisted = store.all_settings().await?;
    let settings = Arc::new(RuntimeSettings::load(config.settings_defaults(), &persisted));

    let (sink, sink_worker) = LogSink::spawn(store.clone(), config.log_sink_config());

    let normalizer = Arc::new(ModelNormalizer::new(config.models.clone()));
    let registry = Arc::new(
        ProviderRegistry::load(
            store.clone(),
            normalizer,
            clock.clone(),
            settings.clone(),
        )
        .await?,
    );
    let _periodic_sync = registry.spawn_periodic_sync();

    let scorer = Arc::new(Scorer::new(clock.clone()));
    let current = settings.current();
    let breaker = Arc::new(BreakerBank::new(
        clock.clone(),
        BreakerConfig {
            initial_penalty: current.initial_penalty,
            max_penalty: current.max_penalty,
            resync_threshold: current.resync_threshold,
        },
    ));
    let proxy = Arc::new(Proxy::new(config.proxy_config(), clock.clone())?);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        scorer,
        breaker,
        proxy,
        sink.clone(),
        settings.clone(),
        clock.clone(),
    ));

    let auth = Arc::new(
        AuthService::load(
            store.clone(),
            sink.clone(),
            clock.clone(),
            config.auth.secret.clone(),
        )
        .await?,
    );
    if config.auth.secret.is_none() {
        tracing::warn!(
            "no HERMES_SECRET configured; admin access requires an admin-scope key"
        );
    }

    let limiter = Arc::new(SlidingWindowLimiter::new(clock.clone(), settings.clone()));
    let _limiter_gc = limiter.spawn_gc();

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        sink,
        clock,
        settings,
        registry,
        dispatcher,
        auth,
        limiter,
        metrics: Arc::new(MetricsRecorder::new()),
        models_cache: Arc::new(ModelsCache::new(MODELS_CACHE_TTL)),
        sink_worker: Arc::new(Mutex::new(Some(sink_worker))),
    };

    let public = Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes));

    let admin = Router::new()
        .route(
            "/admin/providers",
            get(admin::list_providers).post(admin::create_provider),
        )
        .route(
            "/admin/providers/{id}",
            get(admin::get_provider)
                .patch(admin::patch_provider)
                .delete(admin::delete_provider),
        )
        .route("/admin/providers/{id}/sync", post(admin::sync_provider))
        .route("/admin/request-logs", get(admin::request_logs))
        .route("/admin/sync-logs", get(admin::sync_logs))
        .route("/admin/metrics", get(admin::metrics))
        .route("/admin/keys", get(admin::list_keys).post(admin::create_key))
        .route("/admin/keys/{id}", delete(admin::delete_key))
        .route(
            "/admin/settings",
            get(admin::get_settings).post(admin::post_settings),
        )
        .route("/admin/circuit-breaker", get(admin::list_breakers))
        .route(
            "/admin/circuit-breaker/{id}/reset",
            post(admin::reset_breaker),
        )
        .route("/admin/cache/invalidate", post(admin::invalidate_cache))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(public)
        .merge(admin)
        .layer(
            ServiceBuilder::new()
                .layer(cors_layer())
                .layer(axum::middleware::from_fn(context_middleware))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    logging_middleware,
                ))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    config.server.timeout_secs,
                ))),
        )
        .with_state(state.clone());

    Ok((app, state))
}

impl AppState {
    /// Drain the log sink and checkpoint the WAL. Called once on
    /// shutdown.
    pub async fn shutdown(&self) {
        self.sink.shutdown();
        if let Some(worker) = self.sink_worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "log sink worker did not exit cleanly");
            }
        }
        if let Err(e) = self.store.checkpoint().await {
            tracing::warn!(error = %e, "WAL checkpoint on shutdown failed");
        }
        tracing::info!("gateway shut down");
    }
}
