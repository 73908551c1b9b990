//! # Admin API Handlers
//!
//! JSON-only management surface: provider CRUD and sync, log queries,
//! metrics, gateway keys, runtime settings, breaker control, and cache
//! invalidation. Authentication happens in the admin middleware; every
//! handler here can assume an admin identity.

use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use hermes_core::models::KeyScope;
use hermes_core::registry::{NewProvider, ProviderPatch};
use hermes_core::settings::RESERVED_KEYS;
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LOG_LIMIT: u32 = 100;
const MAX_LOG_LIMIT: u32 = 1000;

pub async fn list_providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    let mut providers: Vec<&hermes_core::models::Provider> =
        snapshot.all().map(|p| p.as_ref()).collect();
    providers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(json!({ "providers": providers }))
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let snapshot = state.registry.snapshot();
    let provider = snapshot.provider(&id).ok_or_else(|| GatewayError::NotFound {
        message: format!("provider {id}"),
    })?;
    Ok(Json(json!({
        "provider": provider.as_ref(),
        "scorer": state.dispatcher.scorer().snapshot(&id),
        "breaker": state.dispatcher.breaker().snapshot(&id),
    })))
}

/// Register a provider and kick off its cold model sync.
pub async fn create_provider(
    State(state): State<AppState>,
    Json(new): Json<NewProvider>,
) -> Result<Response, GatewayError> {
    let provider = state.registry.create(new).await?;
    state.registry.request_resync(&provider.id);
    state.models_cache.invalidate().await;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "provider": provider.as_ref() })),
    )
        .into_response())
}

pub async fn patch_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ProviderPatch>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let provider = state.registry.patch(&id, patch).await?;
    state.models_cache.invalidate().await;
    Ok(Json(json!({ "provider": provider.as_ref() })))
}

pub async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.registry.delete(&id).await?;
    // Volatile routing state follows the provider out.
    state.dispatcher.scorer().forget(&id);
    state.dispatcher.breaker().forget(&id);
    state.models_cache.invalidate().await;
    Ok(StatusCode::NO_CONTENT)
}

/// On-demand model sync for one provider. A failed upstream fetch is a
/// 502 with the upstream's complaint, not a gateway error.
pub async fn sync_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    match state.registry.sync_provider(&id).await {
        Ok(outcome) => {
            state.models_cache.invalidate().await;
            Ok(Json(json!({
                "added": outcome.added,
                "removed": outcome.removed,
                "coalesced": outcome.coalesced,
            }))
            .into_response())
        }
        Err(hermes_core::registry::RegistryError::Sync(e)) => Ok((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": {
                    "message": format!("model sync failed: {e}"),
                    "type": "sync_failed",
                    "code": 502,
                }
            })),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct RequestLogQuery {
    pub limit: Option<u32>,
    /// RFC 3339 lower bound.
    pub since: Option<String>,
}

pub async fn request_logs(
    State(state): State<AppState>,
    Query(query): Query<RequestLogQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let since = match query.since.as_deref() {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| GatewayError::InvalidRequest {
                    message: format!("since '{raw}' is not an RFC 3339 timestamp"),
                })?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let logs = state.store.query_request_logs(limit, since).await?;
    Ok(Json(json!({ "logs": logs })))
}

#[derive(Debug, Deserialize)]
pub struct SyncLogQuery {
    #[serde(rename = "providerId")]
    pub provider_id: Option<String>,
    pub limit: Option<u32>,
}

pub async fn sync_logs(
    State(state): State<AppState>,
    Query(query): Query<SyncLogQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let logs = state.store.query_sync_logs(query.provider_id, limit).await?;
    Ok(Json(json!({ "logs": logs })))
}

/// Persisted counters merged with the live rolling window.
pub async fn metrics(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let counters = state.store.counter_snapshot().await?;
    let window = state.metrics.summary().await;
    Ok(Json(json!({
        "counters": counters,
        "window": window,
        "log_sink_dropped": state.sink.dropped_count(),
    })))
}

pub async fn list_keys(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let keys: Vec<serde_json::Value> = state
        .auth
        .list_keys()
        .await?
        .into_iter()
        .map(|k| {
            json!({
                "id": k.id,
                "description": k.description,
                "scope": k.scope,
                "created_at": k.created_at,
                "last_used_at": k.last_used_at,
            })
        })
        .collect();
    Ok(Json(json!({ "keys": keys })))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    #[serde(default)]
    pub description: String,
    pub scope: Option<String>,
}

/// Create a key. The plaintext appears in this response and nowhere else.
pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Response, GatewayError> {
    let scope = match body.scope.as_deref() {
        None => KeyScope::Standard,
        Some(raw) => KeyScope::parse(raw).ok_or_else(|| GatewayError::Config {
            message: format!("scope '{raw}' must be 'standard' or 'admin'"),
        })?,
    };
    let (key, plaintext) = state.auth.create_key(body.description, scope).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "key": plaintext,
            "description": key.description,
            "scope": key.scope,
            "created_at": key.created_at,
        })),
    )
        .into_response())
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.auth.delete_key(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let current = state.settings.current();
    let persisted = state.store.all_settings().await?;
    Ok(Json(json!({
        "effective": {
            "periodicSyncIntervalHours": current.periodic_sync_interval.as_secs() / 3600,
            "chatMaxRetries": current.chat_max_retries,
            "dispatcher_initial_penalty_ms": current.initial_penalty.as_millis() as u64,
            "dispatcher_max_penalty_ms": current.max_penalty.as_millis() as u64,
            "dispatcher_resync_threshold": current.resync_threshold,
            "rateLimitMax": current.rate_limit_max,
            "rateLimitWindow": current.rate_limit_window.as_secs(),
        },
        "persisted": persisted,
        "reserved_keys": RESERVED_KEYS,
        "alias_table_hash": state.registry.normalizer().table_hash(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SettingUpdate {
    pub key: String,
    pub value: String,
}

/// Validate, apply, persist, and propagate one setting change.
pub async fn post_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingUpdate>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let values = state.settings.update(&update.key, &update.value)?;
    state
        .store
        .set_setting(update.key.clone(), update.value.trim().to_string())
        .await?;

    // Components holding their own copy get the new tuning pushed.
    state
        .dispatcher
        .breaker()
        .update_config(hermes_core::breaker::BreakerConfig {
            initial_penalty: values.initial_penalty,
            max_penalty: values.max_penalty,
            resync_threshold: values.resync_threshold,
        })
        .await;

    tracing::info!(key = %update.key, value = %update.value, "setting updated");
    Ok(Json(json!({ "updated": update.key })))
}

/// Breaker snapshots for every registered provider.
pub async fn list_breakers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    let mut breakers: Vec<_> = snapshot
        .all()
        .map(|p| state.dispatcher.breaker().snapshot(&p.id))
        .collect();
    breakers.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
    Json(json!({
        "breakers": breakers,
        "open": state.dispatcher.breaker().open_count(),
    }))
}

pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if state.registry.snapshot().provider(&id).is_none() {
        return Err(GatewayError::NotFound {
            message: format!("provider {id}"),
        });
    }
    state.dispatcher.breaker().reset(&id).await;
    Ok(Json(json!({ "reset": id })))
}

pub async fn invalidate_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.models_cache.invalidate().await;
    Json(json!({ "invalidated": true }))
}
