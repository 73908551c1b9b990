use crate::support::{
    add_provider, chat_body, create_key, mount_models, spawn_gateway, ADMIN_SECRET,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn provider_crud_round_trips() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;

    let gateway = spawn_gateway().await;
    let id = add_provider(&gateway, "crud", &upstream).await;

    // GET returns the stored representation without the credential.
    let response = gateway
        .server
        .get(&format!("/admin/providers/{id}"))
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    assert_eq!(body["provider"]["name"], "crud");
    assert!(body["provider"].get("api_key").is_none());
    assert_eq!(body["provider"]["models"][0], "gpt-4o-mini");
    assert!(body["breaker"]["state"].is_string());

    // PATCH renames and blacklists.
    let response = gateway
        .server
        .patch(&format!("/admin/providers/{id}"))
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"name": "renamed", "blacklist": ["gpt-4o-mini"]}))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["provider"]["name"], "renamed");

    // The blacklisted model leaves the public listing.
    let key = create_key(&gateway).await;
    let listing = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert!(listing.json::<Value>()["data"].as_array().unwrap().is_empty());

    // DELETE removes it.
    let response = gateway
        .server
        .delete(&format!("/admin/providers/{id}"))
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 204);
    let response = gateway
        .server
        .get(&format!("/admin/providers/{id}"))
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn create_rejects_invalid_base_url() {
    let gateway = spawn_gateway().await;
    let response = gateway
        .server
        .post("/admin/providers")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({
            "name": "bad",
            "base_url": "gopher://old",
            "api_key": "k",
        }))
        .await;
    assert_eq!(response.status_code(), 422);
}

#[tokio::test]
async fn key_lifecycle_shows_plaintext_once() {
    let gateway = spawn_gateway().await;

    let created = gateway
        .server
        .post("/admin/keys")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"description": "ci", "scope": "standard"}))
        .await;
    assert_eq!(created.status_code(), 201);
    let body = created.json::<Value>();
    let plaintext = body["key"].as_str().unwrap().to_string();
    let id = body["id"].as_str().unwrap().to_string();
    assert!(plaintext.starts_with("hm-"));

    // The listing exposes metadata only, never hash or plaintext.
    let listing = gateway
        .server
        .get("/admin/keys")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    let keys = listing.json::<Value>()["keys"].as_array().unwrap().clone();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].get("key").is_none());
    assert!(keys[0].get("key_hash").is_none());

    // The key authenticates until deleted.
    let probe = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&plaintext)
        .await;
    assert_eq!(probe.status_code(), 200);

    let response = gateway
        .server
        .delete(&format!("/admin/keys/{id}"))
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 204);

    let probe = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&plaintext)
        .await;
    assert_eq!(probe.status_code(), 401);
}

#[tokio::test]
async fn invalid_key_scope_is_422() {
    let gateway = spawn_gateway().await;
    let response = gateway
        .server
        .post("/admin/keys")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"description": "x", "scope": "root"}))
        .await;
    assert_eq!(response.status_code(), 422);
}

#[tokio::test]
async fn settings_validate_and_persist() {
    let gateway = spawn_gateway().await;

    let response = gateway
        .server
        .post("/admin/settings")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"key": "chatMaxRetries", "value": "5"}))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());

    let response = gateway
        .server
        .get("/admin/settings")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    let body = response.json::<Value>();
    assert_eq!(body["effective"]["chatMaxRetries"], 5);
    assert_eq!(body["persisted"]["chatMaxRetries"], "5");

    // Unknown keys and malformed values are configuration errors.
    let response = gateway
        .server
        .post("/admin/settings")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"key": "noSuchSetting", "value": "1"}))
        .await;
    assert_eq!(response.status_code(), 422);

    let response = gateway
        .server
        .post("/admin/settings")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"key": "rateLimitMax", "value": "many"}))
        .await;
    assert_eq!(response.status_code(), 422);
}

#[tokio::test]
async fn request_logs_record_chat_traffic() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chatcmpl-9"})))
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway().await;
    add_provider(&gateway, "one", &upstream).await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&chat_body("gpt-4o-mini", false))
        .await;
    assert_eq!(response.status_code(), 200);

    // The sink flushes on its interval; poll the admin endpoint.
    let mut found = false;
    for _ in 0..100 {
        let logs = gateway
            .server
            .get("/admin/request-logs")
            .authorization_bearer(ADMIN_SECRET)
            .await;
        let logs = logs.json::<Value>();
        let rows = logs["logs"].as_array().unwrap();
        if rows
            .iter()
            .any(|r| r["path"] == "/v1/chat/completions" && r["status"] == 200)
        {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(found, "request log row never appeared");

    // Sync logs exist for the provider registration and model sync.
    let logs = gateway
        .server
        .get("/admin/sync-logs")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert!(!logs.json::<Value>()["logs"].as_array().unwrap().is_empty());

    // Metrics merge counters and the live window.
    let metrics = gateway
        .server
        .get("/admin/metrics")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    let metrics = metrics.json::<Value>();
    assert!(metrics["window"]["samples"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn breaker_listing_and_reset() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;

    let gateway = spawn_gateway().await;
    let id = add_provider(&gateway, "one", &upstream).await;

    let response = gateway
        .server
        .get("/admin/circuit-breaker")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    assert_eq!(body["breakers"][0]["provider_id"], id.as_str());
    assert_eq!(body["breakers"][0]["state"], "closed");

    let response = gateway
        .server
        .post(&format!("/admin/circuit-breaker/{id}/reset"))
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 200);

    let response = gateway
        .server
        .post("/admin/circuit-breaker/nope/reset")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn health_reports_providers() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;

    let gateway = spawn_gateway().await;
    let id = add_provider(&gateway, "one", &upstream).await;

    let response = gateway.server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["breakers_open"], 0);
    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["id"], id.as_str());
    assert_eq!(providers[0]["state"], "closed");
    assert!(providers[0]["score"].as_f64().unwrap() > 0.0);
}
