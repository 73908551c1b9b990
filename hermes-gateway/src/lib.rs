//! # Hermes Gateway
//!
//! The HTTP surface of Hermes: a single OpenAI-compatible endpoint pair
//! (`/v1/models`, `/v1/chat/completions`) multiplexed across many
//! upstream providers by the engine in `hermes-core`, plus the
//! authenticated admin surface that manages providers, keys, settings,
//! and circuit breakers.
//!
//! A chat request passes, in order: CORS → trace-id context → logging →
//! bearer authentication → sliding-window rate limiting → model
//! normalization → the dispatcher. The response carries
//! `X-Hermes-Provider`, `X-Hermes-Score`, and `X-Hermes-Trace` alongside
//! whatever the chosen upstream returned.
//!
//! Modules:
//!
//! - **`config`**: TOML file + environment overrides, validation.
//! - **`auth`**: key digests, constant-time validation, sliding-window
//!   admission control.
//! - **`middleware`**: context, logging, public and admin auth layers.
//! - **`handlers`**: public API; **`handlers::admin`**: management API.
//! - **`metrics`**: rolling latency window for `/health` percentiles.
//! - **`server`**: component assembly and the router.

pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod request_context;
pub mod server;

pub use config::Config;
pub use server::{create_server, AppState};
