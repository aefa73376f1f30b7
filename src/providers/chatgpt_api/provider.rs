use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    errors::AppError,
    providers::{
        ChatApi, ProgressFn,
        chatgpt_api::model::*,
        model::{ChatMessage, ProviderErrorBody, Role},
        sse::{DONE_MARKER, SseDecoder},
    },
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Call options understood by the direct API-key backend
///
/// `parent_message_id` is accepted so both backends share one context shape.
/// No history is kept, so it is only logged and never used to rebuild
/// earlier turns; every request carries the system prompt and the new user turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectSendOptions {
    pub system_message: Option<String>,
    pub parent_message_id: Option<String>,
}

/// Direct OpenAI chat-completions backend (`ChatGPTAPI`)
pub struct ChatGptApi {
    api_key: String,
    api_base_url: String,
    model: String,
    budget: TokenBudget,
    client: Client,
}

impl ChatGptApi {
    /// 创建直连 API 密钥模式的后端
    ///
    /// ## 参数说明
    /// - `api_base_url`: 不含 `/v1` 的基础地址，未提供时使用 `https://api.openai.com`
    /// - `model`: 模型名称，未提供时使用 `gpt-3.5-turbo`；token 预算在此时根据模型名确定
    pub fn new(
        api_key: impl Into<String>,
        api_base_url: Option<&str>,
        model: Option<&str>,
        client: Client,
    ) -> Self {
        let model = model.unwrap_or(DEFAULT_MODEL).to_string();
        let budget = TokenBudget::for_model(&model);

        Self {
            api_key: api_key.into(),
            api_base_url: api_base_url
                .unwrap_or(DEFAULT_API_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model,
            budget,
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.api_base_url)
    }

    /// Remaining account credit from the billing endpoint
    pub async fn fetch_balance(&self, timeout: Duration) -> Result<f64, AppError> {
        let url = format!("{}/dashboard/billing/credit_grants", self.api_base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AppError::network(format!("Failed to query balance: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::provider_error(status, ProviderErrorBody::message_from(&body)));
        }

        let grants = response
            .json::<CreditGrants>()
            .await
            .map_err(|e| AppError::provider_error(500, format!("Failed to parse balance: {}", e)))?;

        Ok(grants.total_available.unwrap_or(0.0))
    }
}

fn default_system_message() -> String {
    format!(
        "You are ChatGPT, a large language model trained by OpenAI. Answer as concisely as possible.\nCurrent date: {}",
        chrono::Local::now().format("%Y-%m-%d")
    )
}

/// Extract the parent reference from a caller-held context.
///
/// A context carrying `conversationId` was produced by the reverse-proxy
/// backend and is not accepted here.
pub fn parent_message_id_from(context: &Value) -> Option<String> {
    let object = context.as_object()?;

    if object.get("conversationId").is_some_and(|v| !v.is_null()) {
        tracing::warn!("Ignoring conversation context produced by the reverse-proxy backend");
        return None;
    }

    object
        .get("parentMessageId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Fold one SSE payload into the running message
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
            tracing::warn!(error = %e, "Skipping malformed OpenAI stream event");
            return Ok(ControlFlow::Continue(()));
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("OpenAI stream reported an error");
        return Err(AppError::StreamingError(message.to_string()));
    }

    let chunk: CompletionChunk = serde_json::from_value(value.clone())
        .map_err(|e| AppError::StreamingError(format!("Unexpected OpenAI stream event: {}", e)))?;

    result.id = chunk.id;

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(role) = choice.delta.role {
            result.role = role;
        }
        if let Some(content) = choice.delta.content {
            result.text.push_str(&content);
            result.delta = Some(content);
            result.detail = Some(value);
            on_progress(result);
        }
    }

    Ok(ControlFlow::Continue(()))
}

#[async_trait]
impl ChatApi for ChatGptApi {
    type Options = DirectSendOptions;

    fn build_options(&self, prior_context: Option<&Value>, system_message: Option<&str>) -> DirectSendOptions {
        DirectSendOptions {
            system_message: system_message
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            parent_message_id: prior_context.and_then(parent_message_id_from),
        }
    }

    async fn send_message(
        &self,
        text: &str,
        options: DirectSendOptions,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<ChatMessage, AppError> {
        let user_message_id = Uuid::new_v4().to_string();

        let messages = vec![
            CompletionMessage {
                role: Role::System,
                content: options.system_message.unwrap_or_else(default_system_message),
            },
            CompletionMessage {
                role: Role::User,
                content: text.to_string(),
            },
        ];

        let max_tokens = self.budget.response_tokens_for(&messages).ok_or_else(|| {
            AppError::bad_request(format!(
                "Prompt is too long for model {} ({} token context)",
                self.model, self.budget.max_model_tokens
            ))
        })?;

        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens,
            stream: true,
        };

        tracing::debug!(
            model = %self.model,
            max_tokens,
            user_message_id = %user_message_id,
            parent_message_id = ?options.parent_message_id,
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::network(format!("Failed to send request to OpenAI: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::provider_error(
                status,
                format!("OpenAI error {}: {}", status, ProviderErrorBody::message_from(&body)),
            ));
        }

        let mut result = ChatMessage::assistant(Uuid::new_v4().to_string(), user_message_id);
        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| AppError::StreamingError(format!("Failed to read OpenAI stream: {}", e)))?;
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
        json!({ "parentMessageId": response.id })
    }
}
