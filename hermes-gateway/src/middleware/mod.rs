//! # HTTP Middleware
//!
//! Layer order, outermost first: CORS → request context → logging →
//! timeout, then per-route authentication (public bearer + rate limit on
//! `/v1`, admin credentials on `/admin`). The context middleware mints
//! the trace id every other layer and handler logs under; the logging
//! middleware writes both the tracing line and the async request-log
//! record.

use crate::auth::extract_bearer;
use crate::gateway_error::GatewayError;
use crate::request_context::{DispatchedModel, DispatchedProvider, FirstByteMs, RequestContext};
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hermes_core::log_sink::SinkRecord;
use hermes_core::models::{CounterDelta, RequestRecord};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Mint the per-request context and echo the trace id downstream.
pub async fn context_middleware(req: Request<Body>, next: Next) -> Response {
    let context = RequestContext::new(client_ip(&req));
    let trace_id = context.trace_id.clone();
    let mut req = req;
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("x-hermes-trace", value);
    }
    response
}

/// Structured request logging plus the async request-log record and
/// global counters for the public API.
pub async fn logging_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let context = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::new("unknown".into()));
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let latency_ms = context.started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    let model = response
        .extensions()
        .get::<DispatchedModel>()
        .map(|m| m.0.clone());
    let provider = response
        .extensions()
        .get::<DispatchedProvider>()
        .map(|p| p.0.clone());
    let first_byte_ms = response.extensions().get::<FirstByteMs>().map(|f| f.0);

    tracing::info!(
        trace = %context.trace_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        provider = provider.as_deref().unwrap_or("-"),
        "request processed"
    );

    if path.starts_with("/v1/") {
        state.sink.enqueue(SinkRecord::Request(RequestRecord {
            method: method.to_string(),
            path: path.clone(),
            model: model.clone(),
            status,
            duration_ms: latency_ms,
            client_ip: context.client_ip.clone(),
            created_at: state.clock.now_wall(),
        }));
        state.sink.enqueue(SinkRecord::Counter(CounterDelta {
            requests: 1,
            errors: (status >= 400) as u64,
            model,
            ..Default::default()
        }));
        state
            .metrics
            .record(provider, latency_ms, status, first_byte_ms)
            .await;
    }

    response
}

/// Bearer authentication plus sliding-window admission for the public
/// surface. Rate-limit headers ride on every outcome.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    let Some(token) = extract_bearer(header) else {
        return GatewayError::Auth {
            message: "missing bearer token".into(),
        }
        .into_response();
    };
    let Some(identity) = state.auth.validate_token(token) else {
        return GatewayError::Auth {
            message: "invalid API key".into(),
        }
        .into_response();
    };

    let rate_key = identity
        .rate_key()
        .map(str::to_string)
        .unwrap_or_else(|| client_ip(&req));
    let decision = state.limiter.allow(&rate_key);
    if !decision.allowed {
        let mut response = GatewayError::RateLimited {
            retry_after_secs: decision.reset_secs,
        }
        .into_response();
        apply_rate_headers(&mut response, decision);
        return response;
    }

    let mut req = req;
    req.extensions_mut().insert(identity);
    let mut response = next.run(req).await;
    apply_rate_headers(&mut response, decision);
    response
}

/// Admin surface: backdoor secret or an admin-scope key.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    let identity = extract_bearer(header).and_then(|token| state.auth.validate_token(token));
    match identity {
        Some(identity) if identity.is_admin() => {
            let mut req = req;
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        _ => GatewayError::Auth {
            message: "admin credentials required".into(),
        }
        .into_response(),
    }
}

fn apply_rate_headers(response: &mut Response, decision: crate::auth::RateDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_secs.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}
