use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use chat_relay::{
    providers::{
        ChatBackend, ChatGptApi, ProviderClient, UnofficialProxyApi,
        model::ChatMessage,
    },
    relay::{ChatRelay, RelayOutcome, RelayRequest},
    translator::ErrorKind,
};

/// Build an OpenAI streaming body delivering `pieces` in order
fn openai_sse(id: &str, pieces: &[&str]) -> String {
    let mut body = String::new();
    for (i, piece) in pieces.iter().enumerate() {
        let delta = if i == 0 {
            json!({"role": "assistant", "content": piece})
        } else {
            json!({"content": piece})
        };
        let chunk = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": 1714560000,
            "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "delta": delta, "finish_reason": null}]
        });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Build a reverse-proxy conversation body with cumulative assistant text
fn conversation_sse(conversation_id: &str, message_id: &str, texts: &[&str]) -> String {
    let mut body = String::new();
    for text in texts {
        let event = json!({
            "message": {
                "id": message_id,
                "author": {"role": "assistant"},
                "content": {"content_type": "text", "parts": [text]}
            },
            "conversation_id": conversation_id,
            "error": null
        });
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}

fn direct_relay(server: &MockServer, model: &str, timeout: Duration) -> ChatRelay {
    let api = ChatGptApi::new("sk-test", Some(&server.uri()), Some(model), client());
    ChatRelay::new(Arc::new(ProviderClient::new(ChatBackend::DirectKey(api), timeout)))
}

fn reverse_relay(server: &MockServer, timeout: Duration) -> ChatRelay {
    let url = format!("{}/api/conversation", server.uri());
    let api = UnofficialProxyApi::new("access-token", Some(&url), None, client());
    ChatRelay::new(Arc::new(ProviderClient::new(ChatBackend::ReverseProxyToken(api), timeout)))
}

async fn received_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

async fn relay_collecting(relay: &ChatRelay, request: RelayRequest) -> (RelayOutcome, Vec<ChatMessage>) {
    let mut chunks = Vec::new();
    let outcome = relay
        .relay(request, &mut |chunk: &ChatMessage| chunks.push(chunk.clone()))
        .await;
    (outcome, chunks)
}

#[tokio::test]
async fn test_direct_key_streams_chunks_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(sse_response(openai_sse("chatcmpl-1", &["C1", "C2", "C3"])))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let (outcome, chunks) = relay_collecting(&relay, RelayRequest::new("Hello")).await;

    let deltas: Vec<_> = chunks.iter().map(|c| c.delta.clone().unwrap()).collect();
    assert_eq!(deltas, vec!["C1", "C2", "C3"]);
    let texts: Vec<_> = chunks.iter().map(|c| c.text.clone()).collect();
    assert_eq!(texts, vec!["C1", "C1C2", "C1C2C3"]);

    match outcome {
        RelayOutcome::Success { final_response, new_context } => {
            assert_eq!(final_response.text, "C1C2C3");
            assert_eq!(final_response.id, "chatcmpl-1");
            assert_eq!(new_context, json!({"parentMessageId": "chatcmpl-1"}));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_gpt4_32k_budget_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(openai_sse("chatcmpl-2", &["Hi"])))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-4-32k", Duration::from_secs(5));
    let (outcome, _) = relay_collecting(&relay, RelayRequest::new("Hello")).await;
    assert!(outcome.is_success());

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["model"], "gpt-4-32k");
    assert_eq!(bodies[0]["max_tokens"], 8192);
    assert_eq!(bodies[0]["stream"], true);
}

#[tokio::test]
async fn test_direct_key_system_message_is_attached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(openai_sse("chatcmpl-3", &["ok"])))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let request = RelayRequest::new("Hello").with_system_message("Answer in French.");
    let (outcome, _) = relay_collecting(&relay, request).await;
    assert!(outcome.is_success());

    let bodies = received_bodies(&server).await;
    let messages = bodies[0]["messages"].as_array().unwrap();
    assert_eq!(messages[0], json!({"role": "system", "content": "Answer in French."}));
    assert_eq!(messages[1], json!({"role": "user", "content": "Hello"}));
}

#[tokio::test]
async fn test_direct_key_ignores_reverse_proxy_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(openai_sse("chatcmpl-4", &["fresh"])))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let request = RelayRequest::new("Hello")
        .with_context(json!({"conversationId": "conv-1", "parentMessageId": "msg-1"}));
    let (outcome, _) = relay_collecting(&relay, request).await;

    match outcome {
        RelayOutcome::Success { new_context, .. } => {
            assert_eq!(new_context, json!({"parentMessageId": "chatcmpl-4"}));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_direct_key_parent_reference_does_not_rebuild_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(openai_sse("chatcmpl-6", &["again"])))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let (fresh, _) = relay_collecting(&relay, RelayRequest::new("Hello")).await;
    let request = RelayRequest::new("Hello").with_context(json!({"parentMessageId": "chatcmpl-1"}));
    let (continued, _) = relay_collecting(&relay, request).await;
    assert!(fresh.is_success() && continued.is_success());

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies[1]["messages"].as_array().unwrap().len(), 2);
    assert!(!bodies[1].to_string().contains("chatcmpl-1"));
    assert_eq!(bodies[0]["messages"][1], bodies[1]["messages"][1]);
}

#[tokio::test]
async fn test_reverse_proxy_first_call_has_no_continuation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/conversation"))
        .and(header("authorization", "Bearer access-token"))
        .respond_with(sse_response(conversation_sse("conv-1", "msg-2", &["Hel", "Hello"])))
        .mount(&server)
        .await;

    let relay = reverse_relay(&server, Duration::from_secs(5));
    let request = RelayRequest::new("Hello").with_system_message("ignored in this mode");
    let (outcome, chunks) = relay_collecting(&relay, request).await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].text, "Hello");

    let bodies = received_bodies(&server).await;
    let body = bodies[0].as_object().unwrap();
    assert!(!body.contains_key("conversation_id"));
    assert_eq!(body["action"], "next");
    assert_eq!(body["model"], "text-davinci-002-render-sha");
    assert_eq!(body["messages"][0]["content"]["parts"][0], "Hello");
    assert!(!body["messages"].to_string().contains("ignored in this mode"));

    match outcome {
        RelayOutcome::Success { new_context, .. } => {
            assert_eq!(new_context, json!({"conversationId": "conv-1", "parentMessageId": "msg-2"}));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reverse_proxy_context_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/conversation"))
        .respond_with(sse_response(conversation_sse("conv-7", "msg-8", &["Sure"])))
        .mount(&server)
        .await;

    let relay = reverse_relay(&server, Duration::from_secs(5));
    let (first, _) = relay_collecting(&relay, RelayRequest::new("Hi")).await;
    let context = match first {
        RelayOutcome::Success { new_context, .. } => new_context,
        other => panic!("expected success, got {:?}", other),
    };

    let (second, _) = relay_collecting(&relay, RelayRequest::new("And then?").with_context(context)).await;
    assert!(second.is_success());

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[1]["conversation_id"], "conv-7");
    assert_eq!(bodies[1]["parent_message_id"], "msg-8");
}

#[tokio::test]
async fn test_reverse_proxy_rejects_direct_key_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/conversation"))
        .respond_with(sse_response(conversation_sse("conv-2", "msg-3", &["New"])))
        .mount(&server)
        .await;

    let relay = reverse_relay(&server, Duration::from_secs(5));
    let request = RelayRequest::new("Hi").with_context(json!({"parentMessageId": "chatcmpl-9"}));
    let (outcome, _) = relay_collecting(&relay, request).await;
    assert!(outcome.is_success());

    let bodies = received_bodies(&server).await;
    assert!(bodies[0].get("conversation_id").is_none());
    assert_ne!(bodies[0]["parent_message_id"], "chatcmpl-9");
}

#[tokio::test]
async fn test_timeout_yields_timeout_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            sse_response(openai_sse("chatcmpl-5", &["late"])).set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_millis(200));
    let (outcome, chunks) = relay_collecting(&relay, RelayRequest::new("Hello")).await;

    assert!(chunks.is_empty());
    match outcome {
        RelayOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::Timeout),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_service_unavailable_is_translated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let (outcome, _) = relay_collecting(&relay, RelayRequest::new("Hello")).await;

    assert_eq!(
        outcome,
        RelayOutcome::Failure {
            kind: ErrorKind::ProviderUnavailable,
            message: "[OpenAI] 服务器繁忙，请稍后再试 | Server is busy, please try again later".to_string(),
        }
    );
}

#[tokio::test]
async fn test_reverse_proxy_unauthorized_is_translated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/conversation"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "token expired"})))
        .mount(&server)
        .await;

    let relay = reverse_relay(&server, Duration::from_secs(5));
    let (outcome, _) = relay_collecting(&relay, RelayRequest::new("Hello")).await;

    match outcome {
        RelayOutcome::Failure { kind, message } => {
            assert_eq!(kind, ErrorKind::ProviderAuthFailed);
            assert!(message.contains("Incorrect API key provided"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_status_keeps_provider_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"error": {"message": "Rate limit reached", "type": "requests"}})),
        )
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let (outcome, _) = relay_collecting(&relay, RelayRequest::new("Hello")).await;

    assert_eq!(
        outcome,
        RelayOutcome::Failure {
            kind: ErrorKind::Unknown,
            message: "OpenAI error 429: Rate limit reached".to_string(),
        }
    );
}

#[tokio::test]
async fn test_atomic_response_delivers_zero_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response("data: [DONE]\n\n".to_string()))
        .mount(&server)
        .await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let (outcome, chunks) = relay_collecting(&relay, RelayRequest::new("Hello")).await;

    assert!(chunks.is_empty());
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_empty_message_never_reaches_provider() {
    let server = MockServer::start().await;

    let relay = direct_relay(&server, "gpt-3.5-turbo", Duration::from_secs(5));
    let (outcome, _) = relay_collecting(&relay, RelayRequest::new("   ")).await;

    match outcome {
        RelayOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::InvalidRequest),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_provider_fails_without_status() {
    let api = ChatGptApi::new("sk-test", Some("http://127.0.0.1:9"), None, client());
    let relay = ChatRelay::new(Arc::new(ProviderClient::new(
        ChatBackend::DirectKey(api),
        Duration::from_secs(5),
    )));

    let (outcome, _) = relay_collecting(&relay, RelayRequest::new("Hello")).await;
    match outcome {
        RelayOutcome::Failure { kind, message } => {
            assert_eq!(kind, ErrorKind::Unknown);
            assert!(message.starts_with("Failed to send request to OpenAI"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}
