use std::ops::ControlFlow;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    errors::AppError,
    providers::{
        ChatApi, ProgressFn,
        model::{ChatMessage, ProviderErrorBody},
        sse::{DONE_MARKER, SseDecoder},
        unofficial::model::*,
    },
};

pub const DEFAULT_REVERSE_PROXY_URL: &str = "https://bypass.churchless.tech/api/conversation";
pub const DEFAULT_MODEL: &str = "text-davinci-002-render-sha";

/// Keys the request body owns; context fields with these names are not forwarded.
const RESERVED_BODY_KEYS: &[&str] = &[
    "action",
    "messages",
    "model",
    "parent_message_id",
    "conversation_id",
];

/// Call options for the reverse-proxy backend, built from the caller's context bag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReverseSendOptions {
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub extra: Map<String, Value>,
}

/// Unofficial ChatGPT web backend reached through a reverse proxy (`ChatGPTUnofficialProxyAPI`)
pub struct UnofficialProxyApi {
    access_token: String,
    reverse_proxy_url: String,
    model: String,
    client: Client,
}

impl UnofficialProxyApi {
    pub fn new(
        access_token: impl Into<String>,
        reverse_proxy_url: Option<&str>,
        model: Option<&str>,
        client: Client,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            reverse_proxy_url: reverse_proxy_url
                .unwrap_or(DEFAULT_REVERSE_PROXY_URL)
                .to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn reverse_proxy_url(&self) -> &str {
        &self.reverse_proxy_url
    }
}

/// Accept a caller-held context only if it came from this backend.
///
/// Contexts from the direct API-key backend carry no `conversationId` and are
/// ignored, which starts a new conversation.
pub fn reverse_context_from(context: &Value) -> Option<Map<String, Value>> {
    let object = context.as_object()?;
    if object.is_empty() {
        return None;
    }

    match object.get("conversationId") {
        Some(Value::String(id)) if !id.is_empty() => Some(object.clone()),
        _ => {
            tracing::warn!("Ignoring conversation context without conversationId");
            None
        }
    }
}

fn take_string(bag: &mut Map<String, Value>, key: &str) -> Option<String> {
    match bag.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn apply_event(
    result: &mut ChatMessage,
    data: &str,
    on_progress: &mut ProgressFn<'_>,
) -> Result<ControlFlow<()>, AppError> {
    if data.trim() == DONE_MARKER {
        return Ok(ControlFlow::Break(()));
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed conversation event");
            return Ok(ControlFlow::Continue(()));
        }
    };

    let event: ConversationEvent = serde_json::from_value(value.clone())
        .map_err(|e| AppError::StreamingError(format!("Unexpected conversation event: {}", e)))?;

    if let Some(error) = event.error.filter(|e| !e.is_null()) {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Err(AppError::StreamingError(message));
    }

    if let Some(conversation_id) = event.conversation_id {
        result.conversation_id = Some(conversation_id);
    }

    if let Some(message) = event.message {
        if let Some(text) = message.assistant_text() {
            result.text = text.to_string();
            result.id = message.id;
            result.detail = Some(value);
            on_progress(result);
        }
    }

    Ok(ControlFlow::Continue(()))
}

#[async_trait]
impl ChatApi for UnofficialProxyApi {
    type Options = ReverseSendOptions;

    // This backend has no system prompt; the argument is dropped.
    fn build_options(&self, prior_context: Option<&Value>, _system_message: Option<&str>) -> ReverseSendOptions {
        let Some(mut bag) = prior_context.and_then(reverse_context_from) else {
            return ReverseSendOptions::default();
        };

        let conversation_id = take_string(&mut bag, "conversationId");
        let parent_message_id = take_string(&mut bag, "parentMessageId");
        for key in RESERVED_BODY_KEYS {
            bag.remove(*key);
        }

        ReverseSendOptions {
            conversation_id,
            parent_message_id,
            extra: bag,
        }
    }

    async fn send_message(
        &self,
        text: &str,
        options: ReverseSendOptions,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<ChatMessage, AppError> {
        let message_id = Uuid::new_v4().to_string();

        let request = ConversationRequest {
            action: "next".to_string(),
            messages: vec![ConversationPrompt::user_text(&message_id, text)],
            model: self.model.clone(),
            parent_message_id: options
                .parent_message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: options.conversation_id,
            extra: options.extra,
        };

        tracing::debug!(
            model = %self.model,
            conversation_id = ?request.conversation_id,
            "Sending conversation request to reverse proxy"
        );

        let response = self
            .client
            .post(&self.reverse_proxy_url)
            .bearer_auth(&self.access_token)
            .header("Accept", "text/event-stream")
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::network(format!("Failed to reach reverse proxy: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::provider_error(
                status,
                format!("ChatGPT error {}: {}", status, ProviderErrorBody::message_from(&body)),
            ));
        }

        let mut result = ChatMessage::assistant(Uuid::new_v4().to_string(), message_id);
        result.conversation_id = request.conversation_id;

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| AppError::StreamingError(format!("Failed to read conversation stream: {}", e)))?;
            for data in decoder.push(&chunk) {
                if apply_event(&mut result, &data, on_progress)?.is_break() {
                    return Ok(result);
                }
            }
        }

        if let Some(data) = decoder.finish() {
            apply_event(&mut result, &data, on_progress)?;
        }

        Ok(result)
    }

    fn continuation(&self, response: &ChatMessage) -> Value {
        match &response.conversation_id {
            Some(conversation_id) => json!({
                "conversationId": conversation_id,
                "parentMessageId": response.id,
            }),
            // A parent-only context reads as a direct-key one and is refused
            // next turn, so the thread restarts.
            None => {
                tracing::warn!(
                    message_id = %response.id,
                    "Reverse proxy reply carried no conversation_id; next turn starts a new conversation"
                );
                json!({ "parentMessageId": response.id })
            }
        }
    }
}
