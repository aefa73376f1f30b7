use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Partial or final response delivered to the caller
///
/// `text` is cumulative; `delta` holds the newest piece when the backend
/// streams increments. Continuation ids are echoed so the caller can resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    /// Raw provider payload of the most recent event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ChatMessage {
    pub fn assistant(id: impl Into<String>, parent_message_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: String::new(),
            role: Role::Assistant,
            parent_message_id: Some(parent_message_id.into()),
            conversation_id: None,
            delta: None,
            detail: None,
        }
    }
}

/// Full provider answer plus the continuation context for the next turn
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub message: ChatMessage,
    pub context: Value,
}

/// Error body shared by OpenAI and the reverse proxies
#[derive(Debug, Deserialize)]
pub struct ProviderErrorBody {
    pub error: Option<ProviderErrorDetail>,
    pub detail: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderErrorDetail {
    pub message: Option<String>,
}

impl ProviderErrorBody {
    /// Best human-readable message from a non-2xx body, falling back to the raw text
    pub fn message_from(body: &str) -> String {
        let parsed = serde_json::from_str::<ProviderErrorBody>(body).ok();
        let message = parsed.and_then(|b| {
            b.error
                .and_then(|e| e.message)
                .or_else(|| b.detail.map(|d| match d {
                    Value::String(s) => s,
                    other => other.to_string(),
                }))
        });
        message.unwrap_or_else(|| body.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_wire_names() {
        let mut message = ChatMessage::assistant("m-2", "m-1");
        message.text = "Hi".to_string();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["parentMessageId"], "m-1");
        assert_eq!(json["role"], "assistant");
        assert!(json.get("conversationId").is_none());
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error"}}"#;
        assert_eq!(ProviderErrorBody::message_from(body), "Incorrect API key");
        assert_eq!(ProviderErrorBody::message_from(r#"{"detail":"Too many requests"}"#), "Too many requests");
        assert_eq!(ProviderErrorBody::message_from("bad gateway\n"), "bad gateway");
    }
}
