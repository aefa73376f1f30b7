use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::{
    providers::{BackendMode, ProgressFn, ProviderClient, model::ChatMessage},
    translator::{ErrorKind, translate},
};

/// One prompt plus the caller-held continuation context
#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    pub message: String,
    /// Opaque context returned by the previous turn; `None` starts a new thread
    pub prior_context: Option<Value>,
    pub system_message: Option<String>,
}

impl RelayRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.prior_context = Some(context);
        self
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }
}

/// Final result of one relay call; exactly one variant applies
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Success {
        final_response: ChatMessage,
        new_context: Value,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl RelayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Success { .. })
    }
}

/// 聊天中继
///
/// ## 功能说明
/// 接收消息与可选的上一轮上下文，调用提供商客户端适配器，
/// 将每个增量块按到达顺序原样转发给调用方，并把最终结果归一化为成功/失败结构。
///
/// ## 错误处理
/// 提供商侧的任何失败都经过错误翻译器转换为 `RelayOutcome::Failure`，不会向外抛出。
/// 后端模式在构造时已确定，因此不存在未初始化的中继。
pub struct ChatRelay {
    provider: Arc<ProviderClient>,
}

impl ChatRelay {
    pub fn new(provider: Arc<ProviderClient>) -> Self {
        Self { provider }
    }

    pub fn mode(&self) -> BackendMode {
        self.provider.mode()
    }

    pub async fn relay(&self, request: RelayRequest, on_chunk: &mut ProgressFn<'_>) -> RelayOutcome {
        if request.message.trim().is_empty() {
            return RelayOutcome::Failure {
                kind: ErrorKind::InvalidRequest,
                message: "Message cannot be empty".to_string(),
            };
        }

        let started = Instant::now();
        let mut chunks: usize = 0;
        let mut forward = |partial: &ChatMessage| {
            chunks += 1;
            on_chunk(partial);
        };

        tracing::info!(
            mode = self.mode().as_str(),
            has_context = request.prior_context.is_some(),
            "Relaying chat message"
        );

        let result = self
            .provider
            .send_message(
                &request.message,
                request.prior_context.as_ref(),
                request.system_message.as_deref(),
                &mut forward,
            )
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(reply) => {
                tracing::info!(chunks, duration_ms, response_id = %reply.message.id, "Chat relay completed");
                RelayOutcome::Success {
                    final_response: reply.message,
                    new_context: reply.context,
                }
            }
            Err(error) => {
                let translated = translate(&error);
                tracing::warn!(
                    chunks,
                    duration_ms,
                    kind = ?translated.kind,
                    error = %error,
                    "Chat relay failed"
                );
                RelayOutcome::Failure {
                    kind: translated.kind,
                    message: translated.message,
                }
            }
        }
    }
}
