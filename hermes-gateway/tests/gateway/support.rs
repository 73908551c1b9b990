//! Shared fixtures: a gateway on a throwaway database, admin helpers,
//! and wiremock upstreams that speak the provider wire protocol.

use axum_test::TestServer;
use hermes_gateway::config::Config;
use hermes_gateway::server::create_server;
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ADMIN_SECRET: &str = "test-admin-secret";

pub struct TestGateway {
    pub server: TestServer,
    _dir: TempDir,
}

pub async fn spawn_gateway() -> TestGateway {
    spawn_gateway_with(|_| {}).await
}

pub async fn spawn_gateway_with(mutate: impl FnOnce(&mut Config)) -> TestGateway {
    let dir = TempDir::new().expect("tempdir");
    let mut config = Config::default();
    config.store.db_path = dir
        .path()
        .join("hermes.db")
        .to_string_lossy()
        .into_owned();
    config.auth.secret = Some(ADMIN_SECRET.to_string());
    mutate(&mut config);
    config.validate().expect("test config must be valid");

    let (app, _state) = create_server(config).await.expect("server builds");
    TestGateway {
        server: TestServer::new(app).expect("test server"),
        _dir: dir,
    }
}

/// Mount a `/v1/models` listing on a mock upstream.
pub async fn mount_models(upstream: &MockServer, models: &[&str]) {
    let data: Vec<Value> = models
        .iter()
        .map(|m| json!({"id": m, "object": "model"}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": data,
        })))
        .mount(upstream)
        .await;
}

/// Register a provider against `upstream` and wait for its cold sync to
/// activate it. The upstream must already serve `/v1/models`.
pub async fn add_provider(gateway: &TestGateway, name: &str, upstream: &MockServer) -> String {
    let response = gateway
        .server
        .post("/admin/providers")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({
            "name": name,
            "base_url": upstream.uri(),
            "api_key": "sk-upstream",
        }))
        .await;
    assert_eq!(response.status_code(), 201, "{}", response.text());
    let id = response.json::<Value>()["provider"]["id"]
        .as_str()
        .expect("provider id")
        .to_string();

    // The cold sync runs in the background; poll until it lands.
    for _ in 0..100 {
        let response = gateway
            .server
            .get(&format!("/admin/providers/{id}"))
            .authorization_bearer(ADMIN_SECRET)
            .await;
        if response.json::<Value>()["provider"]["status"] == "active" {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("provider {id} never became active");
}

/// Create a standard-scope gateway key and return its plaintext.
pub async fn create_key(gateway: &TestGateway) -> String {
    let response = gateway
        .server
        .post("/admin/keys")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"description": "test key"}))
        .await;
    assert_eq!(response.status_code(), 201, "{}", response.text());
    response.json::<Value>()["key"]
        .as_str()
        .expect("plaintext key")
        .to_string()
}

/// A chat-completion body for `model`.
pub fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    })
}
