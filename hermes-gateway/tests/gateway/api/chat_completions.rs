use crate::support::{add_provider, chat_body, create_key, mount_models, spawn_gateway};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn happy_path_forwards_upstream_body_and_stamps_headers() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream"))
        .and(body_string_contains("\"model\":\"gpt-4o-mini\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
        })))
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway().await;
    let provider_id = add_provider(&gateway, "one", &upstream).await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&chat_body("gpt-4o-mini", false))
        .await;

    assert_eq!(response.status_code(), 200, "{}", response.text());
    let body = response.json::<Value>();
    assert_eq!(body["id"], "chatcmpl-1");
    assert_eq!(
        response.header("x-hermes-provider").to_str().unwrap(),
        provider_id
    );
    let score: f64 = response
        .header("x-hermes-score")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((0.0..=1.0).contains(&score));
    assert!(!response.header("x-hermes-trace").is_empty());
}

#[tokio::test]
async fn model_name_is_normalized_before_dispatch() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chatcmpl-2"})))
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway().await;
    add_provider(&gateway, "one", &upstream).await;
    let key = create_key(&gateway).await;

    // Vendor prefix and casing collapse onto the advertised model.
    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&chat_body("openai/GPT-4o-Mini", false))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
}

#[tokio::test]
async fn unknown_model_is_404() {
    let gateway = spawn_gateway().await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&chat_body("no-such-model", false))
        .await;
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.json::<Value>()["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn body_without_model_is_400() {
    let gateway = spawn_gateway().await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&json!({"messages": []}))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn failover_serves_from_the_healthy_provider() {
    let failing = MockServer::start().await;
    mount_models(&failing, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    mount_models(&healthy, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chatcmpl-3"})))
        .mount(&healthy)
        .await;

    let gateway = spawn_gateway().await;
    add_provider(&gateway, "failing", &failing).await;
    let healthy_id = add_provider(&gateway, "healthy", &healthy).await;
    let key = create_key(&gateway).await;

    // Whichever ranks first, the client always lands on the healthy one.
    for _ in 0..3 {
        let response = gateway
            .server
            .post("/v1/chat/completions")
            .authorization_bearer(&key)
            .json(&chat_body("gpt-4o-mini", false))
            .await;
        assert_eq!(response.status_code(), 200, "{}", response.text());
        assert_eq!(
            response.header("x-hermes-provider").to_str().unwrap(),
            healthy_id
        );
    }
}

#[tokio::test]
async fn exhausted_candidates_return_502_with_attempts() {
    let a = MockServer::start().await;
    mount_models(&a, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&a)
        .await;

    let b = MockServer::start().await;
    mount_models(&b, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("insufficient_quota"))
        .mount(&b)
        .await;

    let gateway = spawn_gateway().await;
    let a_id = add_provider(&gateway, "a", &a).await;
    let b_id = add_provider(&gateway, "b", &b).await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&chat_body("gpt-4o-mini", false))
        .await;

    assert_eq!(response.status_code(), 502);
    let body = response.json::<Value>();
    assert_eq!(body["error"]["type"], "bad_gateway");
    let attempted = body["error"]["attempted"].as_array().unwrap();
    assert_eq!(attempted.len(), 2);
    let ids: Vec<&str> = attempted
        .iter()
        .map(|a| a["provider_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&a_id.as_str()));
    assert!(ids.contains(&b_id.as_str()));
}

#[tokio::test]
async fn upstream_client_error_passes_through() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "messages must not be empty", "type": "invalid_request_error"}
        })))
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

    assert_eq!(response.status_code(), 400);
    assert_eq!(
        response.json::<Value>()["error"]["type"],
        "invalid_request_error"
    );
}

#[tokio::test]
async fn streaming_bytes_arrive_verbatim() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["gpt-4o-mini"]).await;
    let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway().await;
    let provider_id = add_provider(&gateway, "one", &upstream).await;
    let key = create_key(&gateway).await;

    let response = gateway
        .server
        .post("/v1/chat/completions")
        .authorization_bearer(&key)
        .json(&chat_body("gpt-4o-mini", true))
        .await;

    assert_eq!(response.status_code(), 200);
    assert!(response
        .header("content-type")
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(
        response.header("x-hermes-provider").to_str().unwrap(),
        provider_id
    );
    assert_eq!(response.text(), sse);
}
