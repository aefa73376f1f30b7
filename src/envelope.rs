use serde::{Deserialize, Serialize};

/// Outcome tag carried in every non-streaming response body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Fail,
    Unauthorized,
}

/// 统一响应信封
///
/// 所有非流式接口（配置查询、会话探测、密钥校验）以及流式接口的失败终止块
/// 都使用 `{status, message, data}` 三字段结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ResponseStatus,
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: None,
            data: Some(data),
        }
    }

    pub fn success_with_message(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: Some(message.into()),
            data,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Fail,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Unauthorized,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}
