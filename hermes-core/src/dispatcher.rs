//! # Dispatcher
//!
//! The decision core: given a normalized model and an opaque request body,
//! pick the healthiest upstream, proxy the request, feed the observed
//! outcome back into the scorer and breaker, and retry on the next
//! candidate when the failure class allows it.
//!
//! Candidate selection:
//! 1. providers advertising the model, filtered to `active` status and a
//!    non-open breaker;
//! 2. half-open providers participate only when no closed candidate
//!    exists (probe-through-traffic, to avoid a total outage) — otherwise
//!    the explicit self-heal probe owns recovery;
//! 3. ranked by score descending, ties broken by the older last-use so
//!    equally healthy providers share load.
//!
//! Retry policy: at most `chatMaxRetries` scored attempts. A model-missing
//! outcome blacklists the model on that provider, flags it for re-sync,
//! and moves on without consuming the budget or tripping the breaker. A
//! client 4xx surfaces immediately. Once the first byte of a streaming
//! reply has been handed downstream the attempt is final; the stream's
//! terminal outcome arrives later through the proxy callback.

use crate::breaker::{BreakerBank, BreakerState};
use crate::clock::Clock;
use crate::error::{AttemptClass, AttemptReport, DispatchError};
use crate::log_sink::{LogSink, SinkRecord};
use crate::models::{CounterDelta, Provider};
use crate::proxy::{Proxy, ProxyReply, StreamOutcome};
use crate::registry::ProviderRegistry;
use crate::scorer::Scorer;
use crate::settings::RuntimeSettings;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

/// Per-request context threaded through for logging.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub trace_id: String,
}

/// A response to hand back downstream, or a terminal failure.
pub enum DispatchResult {
    Completed {
        provider_id: String,
        score: f64,
        status: u16,
        content_type: Option<String>,
        body: Bytes,
        duration_ms: u64,
    },
    Streaming {
        provider_id: String,
        score: f64,
        status: u16,
        content_type: String,
        stream: ReceiverStream<Result<Bytes, std::io::Error>>,
        first_byte_ms: u64,
    },
    Failed(DispatchError),
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    scorer: Arc<Scorer>,
    breaker: Arc<BreakerBank>,
    proxy: Arc<Proxy>,
    sink: LogSink,
    settings: Arc<RuntimeSettings>,
    clock: Arc<dyn Clock>,
    /// Volatile last-use marks for tie-breaking; rebuilt by observation.
    last_used: DashMap<String, Duration>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        scorer: Arc<Scorer>,
        breaker: Arc<BreakerBank>,
        proxy: Arc<Proxy>,
        sink: LogSink,
        settings: Arc<RuntimeSettings>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            scorer,
            breaker,
            proxy,
            sink,
            settings,
            clock,
            last_used: DashMap::new(),
        }
    }

    pub fn scorer(&self) -> &Arc<Scorer> {
        &self.scorer
    }

    pub fn breaker(&self) -> &Arc<BreakerBank> {
        &self.breaker
    }

    /// Dispatch one chat-completion request.
    pub async fn dispatch(
        self: &Arc<Self>,
        normalized_model: &str,
        body: Bytes,
        ctx: DispatchContext,
    ) -> DispatchResult {
        let advertised = self.registry.snapshot().providers_for(normalized_model);
        if advertised.is_empty() {
            return DispatchResult::Failed(DispatchError::NoCandidates {
                model: normalized_model.to_string(),
            });
        }
        let candidates = self.rank(advertised);
        if candidates.is_empty() {
            // The model is known but every provider is inactive or cooling
            // down: a gateway-side outage, not an unknown model.
            return DispatchResult::Failed(DispatchError::Exhausted { attempts: vec![] });
        }

        let max_retries = self.settings.current().chat_max_retries as usize;
        let mut attempts: Vec<AttemptReport> = Vec::new();
        let mut tried = 0usize;

        for (provider, score) in candidates {
            if tried >= max_retries {
                break;
            }
            tracing::debug!(
                trace = %ctx.trace_id,
                provider = %provider.id,
                score,
                attempt = tried + 1,
                "dispatching to provider"
            );

            let on_stream_end = self.stream_feedback(&provider, normalized_model);
            let reply = self
                .proxy
                .forward_chat(&provider, body.clone(), on_stream_end)
                .await;

            match reply {
                ProxyReply::Completed {
                    status,
                    content_type,
                    body,
                    duration_ms,
                } => {
                    self.on_attempt_success(&provider, duration_ms).await;
                    return DispatchResult::Completed {
                        provider_id: provider.id.clone(),
                        score,
                        status,
                        content_type,
                        body,
                        duration_ms,
                    };
                }
                ProxyReply::Streaming {
                    status,
                    content_type,
                    stream,
                    first_byte_ms,
                } => {
                    // The attempt is final once bytes flow downstream; the
                    // callback settles scorer and breaker at stream end.
                    return DispatchResult::Streaming {
                        provider_id: provider.id.clone(),
                        score,
                        status,
                        content_type,
                        stream,
                        first_byte_ms,
                    };
                }
                ProxyReply::Failed {
                    class: AttemptClass::ModelMissing,
                    detail,
                    ..
                } => {
                    // Local filter, not a breaker trip, not a spent retry.
                    if let Err(e) = self
                        .registry
                        .blacklist_model(&provider.id, normalized_model)
                        .await
                    {
                        tracing::warn!(provider = %provider.id, error = %e, "blacklist update failed");
                    }
                    self.registry.request_resync(&provider.id);
                    attempts.push(AttemptReport {
                        provider_id: provider.id.clone(),
                        class: AttemptClass::ModelMissing,
                        detail,
                    });
                }
                ProxyReply::Failed {
                    class: AttemptClass::ClientError,
                    status,
                    body: error_body,
                    content_type,
                    ..
                } => {
                    // The upstream judged the request itself; no other
                    // provider will think differently.
                    self.count_provider_attempt(&provider.id, true);
                    return DispatchResult::Failed(DispatchError::UpstreamClientError {
                        provider_id: provider.id.clone(),
                        status: status.unwrap_or(400),
                        body: error_body.unwrap_or_default(),
                        content_type,
                    });
                }
                ProxyReply::Failed { class, detail, .. } => {
                    self.on_attempt_failure(&provider, class, &detail).await;
                    attempts.push(AttemptReport {
                        provider_id: provider.id.clone(),
                        class,
                        detail,
                    });
                    tried += 1;
                }
            }
        }

        DispatchResult::Failed(DispatchError::Exhausted { attempts })
    }

    /// Filter to active, non-open candidates and rank them best-first.
    fn rank(self: &Arc<Self>, advertised: Vec<Arc<Provider>>) -> Vec<(Arc<Provider>, f64)> {
        let mut closed = Vec::new();
        let mut half_open = Vec::new();

        for provider in advertised {
            if provider.status != crate::models::ProviderStatus::Active {
                continue;
            }
            match self.breaker.state(&provider.id) {
                BreakerState::Open => {}
                BreakerState::HalfOpen => half_open.push(provider),
                BreakerState::Closed => closed.push(provider),
            }
        }

        let pool = if closed.is_empty() {
            // Probe-through-traffic: better a recovering upstream than a
            // guaranteed 502.
            half_open
        } else {
            // Healthy candidates exist; let the explicit probe handle the
            // half-open ones.
            for provider in &half_open {
                self.spawn_probe(provider.clone());
            }
            closed
        };

        let mut ranked: Vec<(Arc<Provider>, f64)> = pool
            .into_iter()
            .map(|p| {
                let score = self.scorer.score(&p.id);
                (p, score)
            })
            .collect();
        ranked.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ua = self.last_used.get(&a.id).map(|v| *v);
                    let ub = self.last_used.get(&b.id).map(|v| *v);
                    // Never-used sorts before any used mark.
                    match (ua, ub) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(ua), Some(ub)) => ua.cmp(&ub),
                    }
                })
        });
        ranked
    }

    async fn on_attempt_success(&self, provider: &Provider, duration_ms: u64) {
        self.scorer.record_success(&provider.id, duration_ms);
        self.breaker.on_success(&provider.id).await;
        self.mark_used(&provider.id);
        self.count_provider_attempt(&provider.id, false);
    }

    async fn on_attempt_failure(&self, provider: &Provider, class: AttemptClass, detail: &str) {
        debug_assert!(class.trips_breaker());
        self.scorer.record_failure(&provider.id);
        let decision = self.breaker.on_failure(&provider.id).await;
        self.count_provider_attempt(&provider.id, true);
        tracing::warn!(
            provider = %provider.id,
            class = ?class,
            detail,
            failures = decision.consecutive_failures,
            "provider attempt failed"
        );
        if decision.resync_due {
            self.registry.request_resync(&provider.id);
        }
    }

    fn mark_used(&self, provider_id: &str) {
        self.last_used
            .insert(provider_id.to_string(), self.clock.now_mono());
        self.sink.enqueue(SinkRecord::ProviderUsed {
            provider_id: provider_id.to_string(),
            at: self.clock.now_wall(),
        });
    }

    fn count_provider_attempt(&self, provider_id: &str, error: bool) {
        self.sink.enqueue(SinkRecord::Counter(CounterDelta {
            provider_id: Some(provider_id.to_string()),
            provider_requests: 1,
            provider_errors: error as u64,
            ..Default::default()
        }));
    }

    /// Build the end-of-stream callback for a streaming attempt.
    fn stream_feedback(
        self: &Arc<Self>,
        provider: &Arc<Provider>,
        model: &str,
    ) -> crate::proxy::StreamOutcomeCallback {
        let dispatcher = self.clone();
        let provider = provider.clone();
        let model = model.to_string();
        Box::new(move |outcome| {
            tokio::spawn(async move {
                match outcome {
                    StreamOutcome::Success { duration_ms, .. } => {
                        dispatcher.on_attempt_success(&provider, duration_ms).await;
                    }
                    StreamOutcome::Fault { detail } => {
                        dispatcher
                            .on_attempt_failure(&provider, AttemptClass::ProviderFault, &detail)
                            .await;
                    }
                    StreamOutcome::Canceled => {
                        // Downstream disconnect says nothing about the
                        // upstream; leave scorer and breaker alone.
                        tracing::debug!(provider = %provider.id, model, "stream canceled downstream");
                    }
                }
            });
        })
    }

    /// Issue the single-flight self-heal probe for a half-open provider:
    /// a minimal one-token completion against its first effective model.
    fn spawn_probe(self: &Arc<Self>, provider: Arc<Provider>) {
        if !self.breaker.try_begin_probe(&provider.id) {
            return;
        }
        let Some(model) = provider.effective_models().next().cloned() else {
            return;
        };
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let body = Bytes::from(
                serde_json::json!({
                    "model": model,
                    "messages": [{"role": "user", "content": "ping"}],
                    "max_tokens": 1,
                    "stream": false,
                })
                .to_string(),
            );
            tracing::info!(provider = %provider.id, "issuing self-heal probe");
            let reply = dispatcher
                .proxy
                .forward_chat(&provider, body, Box::new(|_| {}))
                .await;
            match reply {
                ProxyReply::Completed { duration_ms, .. } => {
                    dispatcher.on_attempt_success(&provider, duration_ms).await;
                }
                ProxyReply::Streaming { .. } => {
                    // A probe never asks for a stream; treat arrival of a
                    // well-formed reply as recovery.
                    dispatcher.on_attempt_success(&provider, 0).await;
                }
                ProxyReply::Failed { class, detail, .. } => {
                    if class.trips_breaker() {
                        dispatcher
                            .on_attempt_failure(&provider, class, &detail)
                            .await;
                    } else {
                        // Model-missing or a client error still proves the
                        // upstream is answering.
                        dispatcher.breaker.on_success(&provider.id).await;
                    }
                }
            }
        });
    }
}
