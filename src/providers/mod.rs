pub mod chatgpt_api;
pub mod model;
pub mod sse;
pub mod unofficial;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::{
    config::{OpenAIConfig, non_empty},
    errors::AppError,
};
use self::model::{ChatMessage, ChatReply};

pub use chatgpt_api::ChatGptApi;
pub use unofficial::UnofficialProxyApi;

/// Per-chunk callback threaded from the transport up to the caller
pub type ProgressFn<'a> = dyn FnMut(&ChatMessage) + Send + 'a;

/// Process-wide backend selection, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendMode {
    #[serde(rename = "ChatGPTAPI")]
    DirectKey,
    #[serde(rename = "ChatGPTUnofficialProxyAPI")]
    ReverseProxyToken,
}

impl BackendMode {
    /// Name shown to clients
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::DirectKey => "ChatGPTAPI",
            BackendMode::ReverseProxyToken => "ChatGPTUnofficialProxyAPI",
        }
    }
}

/// One backend communication mode
///
/// Each implementation owns the interpretation of the caller's opaque
/// conversation context: `build_options` turns it into mode-specific call
/// options and `continuation` produces the context for the next turn.
#[async_trait]
pub trait ChatApi: Send + Sync {
    type Options: Send + 'static;

    /// Build call options from the caller's context and optional system prompt
    fn build_options(&self, prior_context: Option<&Value>, system_message: Option<&str>) -> Self::Options;

    /// Send one prompt, invoking `on_progress` for every partial response in arrival order
    async fn send_message(
        &self,
        text: &str,
        options: Self::Options,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<ChatMessage, AppError>;

    /// Context the caller must send back to continue after `response`
    fn continuation(&self, response: &ChatMessage) -> Value;
}

/// The active backend, a tagged union over the two modes
pub enum ChatBackend {
    DirectKey(ChatGptApi),
    ReverseProxyToken(UnofficialProxyApi),
}

/// 提供商客户端适配器
///
/// 将两种后端模式封装在同一个接口之后：发送消息（可选上下文、系统消息、流式回调），
/// 返回完整响应或失败。每次调用都受配置的超时时间约束。
pub struct ProviderClient {
    backend: ChatBackend,
    timeout: Duration,
}

impl ProviderClient {
    pub fn new(backend: ChatBackend, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// 根据凭据选择后端模式
    ///
    /// ## 内部实现逻辑
    /// 1. 存在 API 密钥时使用直连模式（`ChatGPTAPI`）
    /// 2. 否则存在访问令牌时使用反向代理模式（`ChatGPTUnofficialProxyAPI`）
    /// 3. 两者都不存在时返回配置错误，进程拒绝启动
    pub fn from_config(config: &OpenAIConfig, client: Client) -> Result<Self, AppError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let model = non_empty(&config.api_model);

        let backend = if let Some(api_key) = non_empty(&config.api_key) {
            let api = ChatGptApi::new(api_key, non_empty(&config.api_base_url), model, client);
            tracing::info!(
                model = api.model(),
                max_model_tokens = api.budget().max_model_tokens,
                max_response_tokens = api.budget().max_response_tokens,
                "Using direct API key backend"
            );
            ChatBackend::DirectKey(api)
        } else if let Some(access_token) = non_empty(&config.access_token) {
            let api = UnofficialProxyApi::new(
                access_token,
                non_empty(&config.api_reverse_proxy),
                model,
                client,
            );
            tracing::info!(
                model = api.model(),
                reverse_proxy = api.reverse_proxy_url(),
                "Using reverse proxy access token backend"
            );
            ChatBackend::ReverseProxyToken(api)
        } else {
            return Err(AppError::ConfigError(
                "Missing OPENAI_API_KEY or OPENAI_ACCESS_TOKEN environment variable".to_string(),
            ));
        };

        Ok(Self::new(backend, timeout))
    }

    pub fn mode(&self) -> BackendMode {
        match &self.backend {
            ChatBackend::DirectKey(_) => BackendMode::DirectKey,
            ChatBackend::ReverseProxyToken(_) => BackendMode::ReverseProxyToken,
        }
    }

    pub fn backend(&self) -> &ChatBackend {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a message through the active backend
    ///
    /// This is the only place that branches on the backend mode.
    pub async fn send_message(
        &self,
        text: &str,
        prior_context: Option<&Value>,
        system_message: Option<&str>,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<ChatReply, AppError> {
        match &self.backend {
            ChatBackend::DirectKey(api) => {
                send_with_timeout(api, self.timeout, text, prior_context, system_message, on_progress).await
            }
            ChatBackend::ReverseProxyToken(api) => {
                send_with_timeout(api, self.timeout, text, prior_context, system_message, on_progress).await
            }
        }
    }

    /// Account balance; only the direct API-key backend has a billing endpoint
    pub async fn fetch_balance(&self) -> Option<Result<f64, AppError>> {
        match &self.backend {
            ChatBackend::DirectKey(api) => Some(api.fetch_balance(self.timeout).await),
            ChatBackend::ReverseProxyToken(_) => None,
        }
    }
}

async fn send_with_timeout<A: ChatApi>(
    api: &A,
    timeout: Duration,
    text: &str,
    prior_context: Option<&Value>,
    system_message: Option<&str>,
    on_progress: &mut ProgressFn<'_>,
) -> Result<ChatReply, AppError> {
    let options = api.build_options(prior_context, system_message);

    let message = tokio::time::timeout(timeout, api.send_message(text, options, on_progress))
        .await
        .map_err(|_| {
            AppError::timeout(format!(
                "No response from provider within {} ms",
                timeout.as_millis()
            ))
        })??;

    let context = api.continuation(&message);
    Ok(ChatReply { message, context })
}
