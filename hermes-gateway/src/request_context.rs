//! Per-request context carried through extensions.

use std::time::Instant;
use uuid::Uuid;

/// Identity of one request: trace id, client address, start time. Created
/// by the outermost middleware and read by handlers and logging.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub client_ip: String,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(client_ip: String) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            client_ip,
            started: Instant::now(),
        }
    }
}

/// Marker inserted into response extensions by the chat handler so the
/// logging middleware can attach the dispatched model to the request log.
#[derive(Debug, Clone)]
pub struct DispatchedModel(pub String);

/// Marker for the provider that served the request, for the metrics
/// window.
#[derive(Debug, Clone)]
pub struct DispatchedProvider(pub String);

/// Marker carrying upstream first-byte latency for streamed responses.
#[derive(Debug, Clone, Copy)]
pub struct FirstByteMs(pub u64);
