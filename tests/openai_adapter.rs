//! Integration tests for the OpenAI-compatible provider adapter against a
//! mock HTTP upstream.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate::config::ApiKey;
use relaygate::provider::{LlmProvider, OpenAiCompatible, ProviderError};
use relaygate::GenerationParams;

const TIMEOUT: Duration = Duration::from_secs(5);

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "index": 0,
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "total_tokens": 15
        }
    })
}

fn adapter(server: &MockServer, api_key: Option<&str>) -> OpenAiCompatible {
    OpenAiCompatible::new(
        "mock",
        &format!("{}/v1/", server.uri()),
        api_key.map(ApiKey::from),
        reqwest::Client::new(),
    )
}

#[tokio::test]
async fn test_success_parses_text_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test-123"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.2
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hi there")))
        .expect(1)
        .mount(&server)
        .await;

    let params = GenerationParams::new().with("temperature", 0.2);
    let completion = adapter(&server, Some("sk-test-123"))
        .call("hello", &params, "gpt-4o-mini", TIMEOUT)
        .await
        .unwrap();

    assert_eq!(completion.text, "hi there");
    assert_eq!(completion.input_tokens, 10);
    assert_eq!(completion.output_tokens, 5);
}

#[tokio::test]
async fn test_missing_usage_counts_zero_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&server)
        .await;

    let completion = adapter(&server, None)
        .call("hello", &GenerationParams::new(), "m", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(completion.text, "ok");
    assert_eq!((completion.input_tokens, completion.output_tokens), (0, 0));
}

#[tokio::test]
async fn test_429_maps_to_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "12")
                .set_body_string("quota exhausted"),
        )
        .mount(&server)
        .await;

    let err = adapter(&server, None)
        .call("hello", &GenerationParams::new(), "m", TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
            message: "quota exhausted".to_string(),
        }
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_503_maps_to_retryable_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = adapter(&server, None)
        .call("hello", &GenerationParams::new(), "m", TIMEOUT)
        .await
        .unwrap_err();

    match &err {
        ProviderError::Upstream { status, message } => {
            assert_eq!(*status, Some(503));
            assert!(message.contains("overloaded"));
        }
        other => panic!("expected Upstream, got {:?}", other),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_400_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "bad request", "type": "invalid_request_error"}
        })))
        .mount(&server)
        .await;

    let err = adapter(&server, None)
        .call("hello", &GenerationParams::new(), "m", TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("too late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let timeout = Duration::from_millis(200);
    let err = adapter(&server, None)
        .call("hello", &GenerationParams::new(), "m", timeout)
        .await
        .unwrap_err();
    assert_eq!(err, ProviderError::Timeout { after: timeout });
}

#[tokio::test]
async fn test_unreachable_upstream_is_transport_error() {
    let provider = OpenAiCompatible::new(
        "nowhere",
        "http://127.0.0.1:1/v1",
        None,
        reqwest::Client::new(),
    );
    let err = provider
        .call("hello", &GenerationParams::new(), "m", TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "transport");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_probe_uses_a_one_token_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"max_tokens": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("p")))
        .expect(1)
        .mount(&server)
        .await;

    adapter(&server, None).probe("m", TIMEOUT).await.unwrap();
}
