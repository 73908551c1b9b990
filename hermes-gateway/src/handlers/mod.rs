//! # Public API Handlers
//!
//! The OpenAI-compatible surface: `/v1/models`, `/v1/chat/completions`,
//! and `/health`. Chat bodies are opaque except for `model` and `stream`;
//! whatever the chosen upstream answers is forwarded verbatim, with the
//! routing decision exposed in `X-Hermes-Provider` and `X-Hermes-Score`.

pub mod admin;

use crate::gateway_error::GatewayError;
use crate::request_context::{DispatchedModel, DispatchedProvider, FirstByteMs, RequestContext};
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use hermes_core::dispatcher::{DispatchContext, DispatchResult};
use hermes_core::error::DispatchError;
use hermes_core::models::ChatRequestMeta;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// `/v1/models` response cache: one slot, keyed on the registry snapshot
/// generation, expiring after 30 s.
pub struct ModelsCache {
    ttl: Duration,
    slot: RwLock<Option<CachedModels>>,
}

struct CachedModels {
    generation: u64,
    expires_at: Instant,
    body: serde_json::Value,
}

impl ModelsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    async fn get(&self, generation: u64) -> Option<serde_json::Value> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|c| c.generation == generation && c.expires_at > Instant::now())
            .map(|c| c.body.clone())
    }

    async fn put(&self, generation: u64, body: serde_json::Value) {
        *self.slot.write().await = Some(CachedModels {
            generation,
            expires_at: Instant::now() + self.ttl,
            body,
        });
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

/// Union of all active providers' effective model sets, deduplicated by
/// normalized id.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    if let Some(cached) = state.models_cache.get(snapshot.generation).await {
        return Json(cached);
    }

    let data: Vec<serde_json::Value> = snapshot
        .effective_model_union()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "hermes",
            })
        })
        .collect();
    let body = json!({ "object": "list", "data": data });
    state.models_cache.put(snapshot.generation, body.clone()).await;
    Json(body)
}

/// Proxy one chat completion through the dispatcher.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    let meta: ChatRequestMeta = match serde_json::from_slice(&body) {
        Ok(meta) => meta,
        Err(e) => {
            return GatewayError::InvalidRequest {
                message: format!("body must be a chat completion with a model: {e}"),
            }
            .into_response()
        }
    };
    let model = state.registry.normalizer().normalize(&meta.model);
    if model.is_empty() {
        return GatewayError::InvalidRequest {
            message: "model must not be empty".into(),
        }
        .into_response();
    }

    let result = state
        .dispatcher
        .dispatch(
            &model,
            body,
            DispatchContext {
                trace_id: ctx.trace_id.clone(),
            },
        )
        .await;

    match result {
        DispatchResult::Completed {
            provider_id,
            score,
            status,
            content_type,
            body,
            duration_ms: _,
        } => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            decorate(
                &mut response,
                &provider_id,
                score,
                content_type.as_deref(),
            );
            response
                .extensions_mut()
                .insert(DispatchedModel(model.clone()));
            response
                .extensions_mut()
                .insert(DispatchedProvider(provider_id));
            response
        }
        DispatchResult::Streaming {
            provider_id,
            score,
            status,
            content_type,
            stream,
            first_byte_ms,
        } => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            decorate(&mut response, &provider_id, score, Some(&content_type));
            response
                .extensions_mut()
                .insert(DispatchedModel(model.clone()));
            response
                .extensions_mut()
                .insert(DispatchedProvider(provider_id));
            response.extensions_mut().insert(FirstByteMs(first_byte_ms));
            response
        }
        DispatchResult::Failed(DispatchError::NoCandidates { model: unknown }) => {
            let mut response = GatewayError::UnknownModel { model: unknown }.into_response();
            response.extensions_mut().insert(DispatchedModel(model));
            response
        }
        DispatchResult::Failed(DispatchError::UpstreamClientError {
            provider_id,
            status,
            body,
            content_type,
        }) => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST))
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::BAD_REQUEST.into_response());
            if let Some(ct) = content_type.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                response.headers_mut().insert(header::CONTENT_TYPE, ct);
            }
            if let Ok(v) = HeaderValue::from_str(&provider_id) {
                response.headers_mut().insert("x-hermes-provider", v);
            }
            response.extensions_mut().insert(DispatchedModel(model));
            response
        }
        DispatchResult::Failed(DispatchError::Exhausted { attempts }) => {
            let attempted: Vec<serde_json::Value> = attempts
                .iter()
                .map(|a| {
                    json!({
                        "provider_id": a.provider_id,
                        "class": a.class,
                        "detail": a.detail,
                    })
                })
                .collect();
            let mut response = (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": {
                        "message": "all candidate providers failed",
                        "type": "bad_gateway",
                        "code": 502,
                        "attempted": attempted,
                    }
                })),
            )
                .into_response();
            response.extensions_mut().insert(DispatchedModel(model));
            response
        }
    }
}

fn decorate(response: &mut Response, provider_id: &str, score: f64, content_type: Option<&str>) {
    if let Some(ct) = content_type.and_then(|v| HeaderValue::from_str(v).ok()) {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    if let Ok(v) = HeaderValue::from_str(provider_id) {
        response.headers_mut().insert("x-hermes-provider", v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("{score:.4}")) {
        response.headers_mut().insert("x-hermes-score", v);
    }
}

/// Per-provider breaker state and latency percentiles from the rolling
/// window.
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    let latencies = state.metrics.provider_latencies().await;

    let mut providers: Vec<serde_json::Value> = Vec::with_capacity(snapshot.len());
    for provider in snapshot.all() {
        let breaker = state.dispatcher.breaker().snapshot(&provider.id);
        let score = state.dispatcher.scorer().score(&provider.id);
        let latency = latencies.get(&provider.id).copied().unwrap_or_default();
        providers.push(json!({
            "id": provider.id,
            "name": provider.name,
            "status": provider.status,
            "state": breaker.state,
            "score": score,
            "p50": latency.p50,
            "p90": latency.p90,
            "p99": latency.p99,
        }));
    }
    providers.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
        "breakers_open": state.dispatcher.breaker().open_count(),
    }))
}
