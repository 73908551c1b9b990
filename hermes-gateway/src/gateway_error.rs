//! # Gateway Error Types
//!
//! HTTP-facing error taxonomy with automatic response mapping. Client
//! errors carry the status the spec of the public surface promises (400
//! malformed, 401 unauthenticated, 404 unknown model, 429 rate limited);
//! admin configuration mistakes come back as 422; infrastructure failures
//! collapse to 500 without leaking internals.
//!
//! Terminal dispatch failures are not represented here — the chat handler
//! builds its 502 envelope directly so it can include the attempted
//! providers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hermes_core::error::StoreError;
use hermes_core::registry::RegistryError;
use hermes_core::settings::SettingsError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing or invalid credentials
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Malformed or invalid request body
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The requested model is served by no provider
    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    /// Admission control rejected the request
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Resource addressed by an admin endpoint does not exist
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Resource already exists
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Invalid configuration value at the admin surface
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Anything the caller cannot fix
    #[error("Internal server error")]
    Internal { message: String },
}

impl GatewayError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Auth { .. } => (StatusCode::UNAUTHORIZED, "authentication_error"),
            GatewayError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            GatewayError::UnknownModel { .. } => (StatusCode::NOT_FOUND, "model_not_found"),
            GatewayError::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error")
            }
            GatewayError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            GatewayError::Config { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error")
            }
            GatewayError::Internal { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal { message } = &self {
            tracing::error!(detail = %message, "internal error surfaced as 500");
        }
        let (status, error_type) = self.status_and_type();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));
        let mut response = (status, body).into_response();
        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => GatewayError::NotFound {
                message: format!("{entity} {id}"),
            },
            StoreError::Conflict { message } => GatewayError::Conflict { message },
            other => GatewayError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Store(inner) => inner.into(),
            RegistryError::Invalid { message } => GatewayError::Config { message },
            RegistryError::Sync(inner) => GatewayError::Internal {
                message: inner.to_string(),
            },
        }
    }
}

impl From<SettingsError> for GatewayError {
    fn from(e: SettingsError) -> Self {
        GatewayError::Config {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_statuses() {
        let cases = [
            (
                GatewayError::Auth {
                    message: "no".into(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (
                GatewayError::UnknownModel {
                    model: "x".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::RateLimited {
                    retry_after_secs: 5,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                GatewayError::Config {
                    message: "bad".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_and_type().0, expected);
        }
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = GatewayError::RateLimited {
            retry_after_secs: 17,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "17");
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let err: GatewayError = StoreError::NotFound {
            entity: "provider",
            id: "p1".into(),
        }
        .into();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }
}
