use crate::support::{create_key, spawn_gateway, spawn_gateway_with, ADMIN_SECRET};
use serde_json::{json, Value};

#[tokio::test]
async fn public_api_requires_a_bearer_token() {
    let gateway = spawn_gateway().await;

    let response = gateway.server.get("/v1/models").await;
    assert_eq!(response.status_code(), 401);
    assert_eq!(
        response.json::<Value>()["error"]["type"],
        "authentication_error"
    );

    let response = gateway
        .server
        .get("/v1/models")
        .authorization_bearer("hm-not-a-real-key")
        .await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn valid_key_passes_public_auth() {
    let gateway = spawn_gateway().await;
    let key = create_key(&gateway).await;
    let response = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn admin_requires_admin_credentials() {
    let gateway = spawn_gateway().await;

    let response = gateway.server.get("/admin/providers").await;
    assert_eq!(response.status_code(), 401);

    // A standard-scope key is not enough.
    let key = create_key(&gateway).await;
    let response = gateway
        .server
        .get("/admin/providers")
        .authorization_bearer(&key)
        .await;
    assert_eq!(response.status_code(), 401);

    // The backdoor secret is.
    let response = gateway
        .server
        .get("/admin/providers")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn admin_scope_key_reaches_admin_surface() {
    let gateway = spawn_gateway().await;

    let created = gateway
        .server
        .post("/admin/keys")
        .authorization_bearer(ADMIN_SECRET)
        .json(&json!({"description": "ops", "scope": "admin"}))
        .await;
    assert_eq!(created.status_code(), 201);
    let plaintext = created.json::<Value>()["key"].as_str().unwrap().to_string();

    let response = gateway
        .server
        .get("/admin/providers")
        .authorization_bearer(&plaintext)
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn without_backdoor_secret_admin_is_locked() {
    let gateway = spawn_gateway_with(|config| {
        config.auth.secret = None;
    })
    .await;
    let response = gateway
        .server
        .get("/admin/providers")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn health_needs_no_credentials() {
    let gateway = spawn_gateway().await;
    let response = gateway.server.get("/health").await;
    assert_eq!(response.status_code(), 200);
}
