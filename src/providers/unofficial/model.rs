use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::providers::model::Role;

// ChatGPT web conversation structures spoken by the reverse proxies
#[derive(Serialize, Debug)]
pub struct ConversationRequest {
    pub action: String,
    pub messages: Vec<ConversationPrompt>,
    pub model: String,
    pub parent_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Remaining context fields, forwarded untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Debug)]
pub struct ConversationPrompt {
    pub id: String,
    pub role: Role,
    pub content: PromptContent,
}

#[derive(Serialize, Debug)]
pub struct PromptContent {
    pub content_type: String,
    pub parts: Vec<String>,
}

impl ConversationPrompt {
    pub fn user_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: PromptContent {
                content_type: "text".to_string(),
                parts: vec![text.into()],
            },
        }
    }
}

/// One `data:` event of the conversation stream
#[derive(Deserialize, Debug)]
pub struct ConversationEvent {
    pub message: Option<EventMessage>,
    pub conversation_id: Option<String>,
    pub error: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct EventMessage {
    pub id: String,
    pub author: EventAuthor,
    #[serde(default)]
    pub content: EventContent,
}

#[derive(Deserialize, Debug)]
pub struct EventAuthor {
    pub role: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct EventContent {
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl EventMessage {
    /// Cumulative assistant text carried by this event, if any
    pub fn assistant_text(&self) -> Option<&str> {
        if self.author.role != "assistant" {
            return None;
        }
        self.content
            .parts
            .first()
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
    }
}
