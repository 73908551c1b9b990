//! # Upstream Proxy
//!
//! Forwards chat-completion bodies verbatim to one provider over a shared
//! pooled HTTP/2-capable client and classifies the outcome for the
//! dispatcher. The proxy never errors toward its caller; everything comes
//! back as a [`ProxyReply`].
//!
//! Streaming responses are bridged chunk by chunk through a bounded
//! channel: the bridge task does not read the next upstream chunk until
//! the downstream side has drained the previous one, so downstream
//! slowness propagates to the upstream instead of buffering without bound.
//! Because the reply returns as soon as upstream headers arrive, the
//! final outcome of a stream (clean end, mid-stream fault, downstream
//! disconnect) is reported through the caller's callback when the bridge
//! finishes.
//!
//! Classification:
//! - 2xx with a clean body/stream end → success with the end-to-end
//!   duration (time-to-last-byte for streams);
//! - 404 whose body matches the model-missing markers → the provider does
//!   not actually serve the model it advertised;
//! - 429, or any 4xx matching the quota markers → quota exhaustion;
//! - transport errors, timeouts, 5xx → provider fault;
//! - any other 4xx → a client error to surface unchanged.

use crate::clock::Clock;
use crate::error::AttemptClass;
use crate::models::Provider;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub connect_timeout: Duration,
    /// Budget for a non-streaming attempt, headers included.
    pub request_timeout: Duration,
    /// Maximum gap between stream chunks before the attempt is abandoned.
    pub stream_idle_timeout: Duration,
    pub max_idle_per_host: usize,
    /// Cap for buffering a non-streaming upstream body.
    pub max_response_bytes: usize,
    /// Lowercase substrings that mark a 4xx body as quota exhaustion.
    pub quota_markers: Vec<String>,
    /// Lowercase substrings that mark a 404 body as a missing model.
    pub model_missing_markers: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            max_idle_per_host: 32,
            max_response_bytes: 8 * 1024 * 1024,
            quota_markers: vec!["insufficient_quota".into(), "quota".into(), "billing".into()],
            model_missing_markers: vec!["model_not_found".into(), "model does not exist".into()],
        }
    }
}

/// Terminal report for a streaming attempt, delivered via callback when
/// the bridge task finishes.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    /// Stream ended cleanly. Duration is time-to-last-byte.
    Success {
        duration_ms: u64,
        first_byte_ms: u64,
    },
    /// Upstream died or stalled mid-stream.
    Fault { detail: String },
    /// Downstream went away; not enough information to judge the upstream.
    Canceled,
}

pub type StreamOutcomeCallback = Box<dyn FnOnce(StreamOutcome) + Send + 'static>;

/// Classified result of one forwarded attempt.
pub enum ProxyReply {
    /// Buffered 2xx body to forward verbatim.
    Completed {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
        duration_ms: u64,
    },
    /// 2xx stream; bytes flow through `stream`, the outcome arrives later
    /// through the callback handed to [`Proxy::forward_chat`].
    Streaming {
        status: u16,
        content_type: String,
        stream: ReceiverStream<Result<Bytes, std::io::Error>>,
        first_byte_ms: u64,
    },
    /// No forwardable response. `body` carries the upstream payload for
    /// client-error passthrough.
    Failed {
        class: AttemptClass,
        status: Option<u16>,
        detail: String,
        body: Option<Bytes>,
        content_type: Option<String>,
    },
}

/// Shared upstream HTTP client plus classification rules.
pub struct Proxy {
    http: reqwest::Client,
    config: ProxyConfig,
    clock: Arc<dyn Clock>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, clock: Arc<dyn Clock>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()?;
        Ok(Self {
            http,
            config,
            clock,
        })
    }

    /// Forward `body` to the provider's chat-completions endpoint.
    ///
    /// `on_stream_end` fires exactly once for streaming replies and never
    /// for the other variants.
    pub async fn forward_chat(
        &self,
        provider: &Provider,
        body: Bytes,
        on_stream_end: StreamOutcomeCallback,
    ) -> ProxyReply {
        let url = format!("{}/v1/chat/completions", provider.base_url);
        let started = self.clock.now_mono();

        let send = self
            .http
            .post(&url)
            .bearer_auth(&provider.api_key)
            .header("content-type", "application/json")
            .body(body)
            .send();

        let response = match tokio::time::timeout(self.config.request_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return ProxyReply::Failed {
                    class: AttemptClass::ProviderFault,
                    status: None,
                    detail: format!("transport: {e}"),
                    body: None,
                    content_type: None,
                }
            }
            Err(_) => {
                return ProxyReply::Failed {
                    class: AttemptClass::ProviderFault,
                    status: None,
                    detail: "upstream request timed out".into(),
                    body: None,
                    content_type: None,
                }
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            let is_event_stream = content_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with("text/event-stream"));
            let is_unsized = response.content_length().is_none();
            if is_event_stream || is_unsized {
                return self
                    .bridge_stream(response, status.as_u16(), content_type, started, on_stream_end)
                    .await;
            }
            return match self.buffer_body(response, started).await {
                Ok((body, duration_ms)) => ProxyReply::Completed {
                    status: status.as_u16(),
                    content_type,
                    body,
                    duration_ms,
                },
                Err(detail) => ProxyReply::Failed {
                    class: AttemptClass::ProviderFault,
                    status: Some(status.as_u16()),
                    detail,
                    body: None,
                    content_type: None,
                },
            };
        }

        // Error statuses: the body decides between the classified cases.
        let payload = response.bytes().await.unwrap_or_default();
        let lowered = String::from_utf8_lossy(&payload).to_ascii_lowercase();
        let code = status.as_u16();

        let class = if code == 404 && contains_any(&lowered, &self.config.model_missing_markers) {
            AttemptClass::ModelMissing
        } else if code == 429 || (code < 500 && contains_any(&lowered, &self.config.quota_markers))
        {
            AttemptClass::QuotaExhausted
        } else if code >= 500 {
            AttemptClass::ProviderFault
        } else {
            AttemptClass::ClientError
        };

        ProxyReply::Failed {
            class,
            status: Some(code),
            detail: truncate_detail(&lowered),
            body: Some(payload),
            content_type,
        }
    }

    async fn buffer_body(
        &self,
        response: reqwest::Response,
        started: Duration,
    ) -> Result<(Bytes, u64), String> {
        let cap = self.config.max_response_bytes;
        let read = async {
            let mut buf = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| format!("body read: {e}"))?;
                if buf.len() + chunk.len() > cap {
                    return Err(format!("response body over {cap} bytes"));
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(Bytes::from(buf))
        };
        let body = tokio::time::timeout(self.config.request_timeout, read)
            .await
            .map_err(|_| "upstream body read timed out".to_string())??;
        let duration_ms = (self.clock.now_mono().saturating_sub(started)).as_millis() as u64;
        Ok((body, duration_ms))
    }

    async fn bridge_stream(
        &self,
        response: reqwest::Response,
        status: u16,
        content_type: Option<String>,
        started: Duration,
        on_stream_end: StreamOutcomeCallback,
    ) -> ProxyReply {
        let idle = self.config.stream_idle_timeout;
        let clock = self.clock.clone();
        let mut upstream = response.bytes_stream();

        // Wait for the first chunk before committing to a streaming reply:
        // an upstream that dies before producing a byte is still retryable.
        let first = match tokio::time::timeout(idle, upstream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                return ProxyReply::Failed {
                    class: AttemptClass::ProviderFault,
                    status: Some(status),
                    detail: format!("stream start: {e}"),
                    body: None,
                    content_type: None,
                }
            }
            Ok(None) => Bytes::new(),
            Err(_) => {
                return ProxyReply::Failed {
                    class: AttemptClass::ProviderFault,
                    status: Some(status),
                    detail: "stream produced no data".into(),
                    body: None,
                    content_type: None,
                }
            }
        };
        let first_byte_ms = (clock.now_mono().saturating_sub(started)).as_millis() as u64;

        // Small channel: the bridge stops reading upstream until downstream
        // drains, which is the back-pressure path.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);

        tokio::spawn(async move {
            if tx.send(Ok(first)).await.is_err() {
                on_stream_end(StreamOutcome::Canceled);
                return;
            }
            loop {
                match tokio::time::timeout(idle, upstream.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            on_stream_end(StreamOutcome::Canceled);
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(format!("upstream: {e}"))))
                            .await;
                        on_stream_end(StreamOutcome::Fault {
                            detail: format!("mid-stream: {e}"),
                        });
                        return;
                    }
                    Ok(None) => {
                        let duration_ms =
                            (clock.now_mono().saturating_sub(started)).as_millis() as u64;
                        on_stream_end(StreamOutcome::Success {
                            duration_ms,
                            first_byte_ms,
                        });
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(Err(std::io::Error::other("upstream stream idle timeout")))
                            .await;
                        on_stream_end(StreamOutcome::Fault {
                            detail: "stream idle timeout".into(),
                        });
                        return;
                    }
                }
            }
        });

        ProxyReply::Streaming {
            status,
            content_type: content_type.unwrap_or_else(|| "text/event-stream".into()),
            stream: ReceiverStream::new(rx),
            first_byte_ms,
        }
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

fn truncate_detail(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::ProviderStatus;
    use serde_json::json;
    use std::collections::BTreeSet;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str) -> Provider {
        Provider {
            id: "p1".into(),
            name: "one".into(),
            base_url: base_url.trim_end_matches('/').into(),
            api_key: "sk-upstream".into(),
            models: BTreeSet::from(["gpt-4o-mini".to_string()]),
            blacklist: BTreeSet::new(),
            status: ProviderStatus::Active,
            created_at: chrono::Utc::now(),
            last_synced_at: None,
            last_used_at: None,
        }
    }

    fn proxy() -> Proxy {
        Proxy::new(ProxyConfig::default(), Arc::new(SystemClock::new())).unwrap()
    }

    fn no_stream_end() -> StreamOutcomeCallback {
        Box::new(|_| panic!("stream callback must not fire for buffered replies"))
    }

    #[tokio::test]
    async fn forwards_body_and_credential_verbatim() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-upstream"))
            .and(body_string_contains("\"model\":\"gpt-4o-mini\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "cmpl-1", "choices": []})),
            )
            .mount(&upstream)
            .await;

        let body = Bytes::from(r#"{"model":"gpt-4o-mini","messages":[],"stream":false}"#);
        match proxy()
            .forward_chat(&provider(&upstream.uri()), body, no_stream_end())
            .await
        {
            ProxyReply::Completed { status, body, .. } => {
                assert_eq!(status, 200);
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["id"], "cmpl-1");
            }
            _ => panic!("expected a completed reply"),
        }
    }

    #[tokio::test]
    async fn classifies_model_missing_404() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "model_not_found", "message": "The model does not exist"}
            })))
            .mount(&upstream)
            .await;

        match proxy()
            .forward_chat(&provider(&upstream.uri()), Bytes::from("{}"), no_stream_end())
            .await
        {
            ProxyReply::Failed { class, status, .. } => {
                assert_eq!(class, AttemptClass::ModelMissing);
                assert_eq!(status, Some(404));
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn plain_404_is_a_client_error() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
            .mount(&upstream)
            .await;

        match proxy()
            .forward_chat(&provider(&upstream.uri()), Bytes::from("{}"), no_stream_end())
            .await
        {
            ProxyReply::Failed { class, .. } => assert_eq!(class, AttemptClass::ClientError),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn classifies_quota_by_status_and_body() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&upstream)
            .await;
        match proxy()
            .forward_chat(&provider(&upstream.uri()), Bytes::from("{}"), no_stream_end())
            .await
        {
            ProxyReply::Failed { class, .. } => assert_eq!(class, AttemptClass::QuotaExhausted),
            _ => panic!("expected failure"),
        }

        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"type": "insufficient_quota", "message": "billing hard limit"}
            })))
            .mount(&upstream)
            .await;
        match proxy()
            .forward_chat(&provider(&upstream.uri()), Bytes::from("{}"), no_stream_end())
            .await
        {
            ProxyReply::Failed { class, .. } => assert_eq!(class, AttemptClass::QuotaExhausted),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn five_xx_is_a_provider_fault() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&upstream)
            .await;
        match proxy()
            .forward_chat(&provider(&upstream.uri()), Bytes::from("{}"), no_stream_end())
            .await
        {
            ProxyReply::Failed { class, status, .. } => {
                assert_eq!(class, AttemptClass::ProviderFault);
                assert_eq!(status, Some(503));
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_provider_fault() {
        match proxy()
            .forward_chat(
                &provider("http://127.0.0.1:9"),
                Bytes::from("{}"),
                no_stream_end(),
            )
            .await
        {
            ProxyReply::Failed { class, status, .. } => {
                assert_eq!(class, AttemptClass::ProviderFault);
                assert_eq!(status, None);
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn streams_pass_through_and_report_at_end() {
        let upstream = MockServer::start().await;
        let sse = "data: {\"delta\":\"hi\"}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let reply = proxy()
            .forward_chat(
                &provider(&upstream.uri()),
                Bytes::from(r#"{"stream":true}"#),
                Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            )
            .await;

        match reply {
            ProxyReply::Streaming {
                status,
                content_type,
                stream,
                ..
            } => {
                assert_eq!(status, 200);
                assert!(content_type.starts_with("text/event-stream"));
                let chunks: Vec<_> = StreamExt::collect::<Vec<_>>(stream).await;
                let collected: Vec<u8> = chunks
                    .into_iter()
                    .flat_map(|c| c.unwrap().to_vec())
                    .collect();
                assert_eq!(collected, sse.as_bytes());
            }
            _ => panic!("expected streaming reply"),
        }

        match rx.await.unwrap() {
            StreamOutcome::Success { duration_ms, .. } => {
                // End-to-end duration is time-to-last-byte; just sanity.
                assert!(duration_ms < 10_000);
            }
            other => panic!("expected success outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![b'x'; 64], "application/json"))
            .mount(&upstream)
            .await;

        let config = ProxyConfig {
            max_response_bytes: 16,
            ..Default::default()
        };
        let proxy = Proxy::new(config, Arc::new(SystemClock::new())).unwrap();
        match proxy
            .forward_chat(&provider(&upstream.uri()), Bytes::from("{}"), no_stream_end())
            .await
        {
            ProxyReply::Failed { class, .. } => assert_eq!(class, AttemptClass::ProviderFault),
            _ => panic!("expected failure"),
        }
    }
}
