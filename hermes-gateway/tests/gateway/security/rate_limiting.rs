use crate::support::{create_key, spawn_gateway_with};
use serde_json::Value;

#[tokio::test]
async fn over_limit_requests_are_denied_with_headers() {
    let gateway = spawn_gateway_with(|config| {
        config.auth.rate_limit_max = 5;
    })
    .await;
    let key = create_key(&gateway).await;

    for i in 0..5 {
        let response = gateway
            .server
            .get("/v1/models")
            .authorization_bearer(&key)
            .await;
        assert_eq!(response.status_code(), 200, "request {i}");
        assert_eq!(response.header("x-ratelimit-limit").to_str().unwrap(), "5");
        let remaining: u32 = response
            .header("x-ratelimit-remaining")
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(remaining, 4 - i);
    }

    let denied = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert_eq!(denied.status_code(), 429);
    assert_eq!(
        denied.header("x-ratelimit-remaining").to_str().unwrap(),
        "0"
    );
    let retry_after: u64 = denied
        .header("retry-after")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    assert_eq!(
        denied.json::<Value>()["error"]["type"],
        "rate_limit_error"
    );
}

#[tokio::test]
async fn keys_have_independent_budgets() {
    let gateway = spawn_gateway_with(|config| {
        config.auth.rate_limit_max = 2;
    })
    .await;
    let first = create_key(&gateway).await;
    let second = create_key(&gateway).await;

    for _ in 0..2 {
        let response = gateway
            .server
            .get("/v1/models")
            .authorization_bearer(&first)
            .await;
        assert_eq!(response.status_code(), 200);
    }
    let denied = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&first)
        .await;
    assert_eq!(denied.status_code(), 429);

    // The other key still has its own budget.
    let response = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&second)
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn denied_requests_never_reach_the_dispatcher() {
    let gateway = spawn_gateway_with(|config| {
        config.auth.rate_limit_max = 1;
    })
    .await;
    let key = create_key(&gateway).await;

    let ok = gateway
        .server
        .get("/v1/models")
        .authorization_bearer(&key)
        .await;
    assert_eq!(ok.status_code(), 200);

    // With no providers registered a dispatched chat request would be a
    // 404; the limiter answers first with 429.
    let denied = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&serde_json::json!({"model": "gpt-4o-mini", "messages": []}))
        .await;
    assert_eq!(denied.status_code(), 429);
}
