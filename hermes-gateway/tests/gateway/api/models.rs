use crate::support::{add_provider, create_key, mount_models, spawn_gateway, ADMIN_SECRET};
use serde_json::Value;
use wiremock::MockServer;

fn model_ids(body: &Value) -> Vec<String> {
    body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn lists_the_union_of_active_providers() {
    let a = MockServer::start().await;
    mount_models(&a, &["gpt-4o-mini", "gpt-4"]).await;
    let b = MockServer::start().await;
    mount_models(&b, &["gpt-4o-mini", "mistral-large"]).await;

    let gateway = spawn_gateway().await;
    add_provider(&gateway, "a", &a).await;
    add_provider(&gateway, "b", &b).await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    assert_eq!(body["object"], "list");

    let ids = model_ids(&body);
    // Deduplicated union, each entry once.
    assert_eq!(ids.len(), 3);
    for expected in ["gpt-4", "gpt-4o-mini", "mistral-large"] {
        assert!(ids.contains(&expected.to_string()), "missing {expected}");
    }
}

#[tokio::test]
async fn empty_registry_lists_nothing() {
    let gateway = spawn_gateway().await;
    let key = create_key(&gateway).await;
    let response = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert_eq!(response.status_code(), 200);
    assert!(model_ids(&response.json::<Value>()).is_empty());
}

#[tokio::test]
async fn registry_changes_refresh_the_cached_listing() {
    let a = MockServer::start().await;
    mount_models(&a, &["gpt-4o-mini"]).await;

    let gateway = spawn_gateway().await;
    add_provider(&gateway, "a", &a).await;
    let key = create_key(&gateway).await;

    let first = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert_eq!(model_ids(&first.json::<Value>()), vec!["gpt-4o-mini"]);

    // A second provider invalidates the snapshot-keyed cache.
    let b = MockServer::start().await;
    mount_models(&b, &["gpt-4"]).await;
    add_provider(&gateway, "b", &b).await;

    let second = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    let ids = model_ids(&second.json::<Value>());
    assert!(ids.contains(&"gpt-4".to_string()));

    // Explicit invalidation stays available to admins.
    let response = gateway
        .server
        .post("/admin/cache/invalidate")
        .authorization_bearer(ADMIN_SECRET)
        .await;
    assert_eq!(response.status_code(), 200);
}
