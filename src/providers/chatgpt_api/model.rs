use serde::{Deserialize, Serialize};

use crate::providers::model::Role;

// OpenAI chat-completions structures used by the direct API-key backend
#[derive(Serialize, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<CompletionMessage>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

/// One `data:` event of a streamed completion
#[derive(Deserialize, Debug)]
pub struct CompletionChunk {
    pub id: String,
    #[serde(default)]
    pub choices: Vec<CompletionChunkChoice>,
}

#[derive(Deserialize, Debug)]
pub struct CompletionChunkChoice {
    #[serde(default)]
    pub delta: CompletionDelta,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CompletionDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CreditGrants {
    pub total_available: Option<f64>,
}

/// Context window and reply size for the configured model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_model_tokens: u32,
    pub max_response_tokens: u32,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_model_tokens: 4000,
            max_response_tokens: 1000,
        }
    }
}

impl TokenBudget {
    pub fn for_model(model: &str) -> Self {
        let model = model.to_lowercase();
        if model.contains("gpt-4") {
            if model.contains("32k") {
                return Self {
                    max_model_tokens: 32768,
                    max_response_tokens: 8192,
                };
            }
            return Self {
                max_model_tokens: 8192,
                max_response_tokens: 2048,
            };
        }
        Self::default()
    }

    /// Reply budget left once the prompt is accounted for, `None` if the prompt does not fit
    pub fn response_tokens_for(&self, messages: &[CompletionMessage]) -> Option<u32> {
        let prompt_tokens = estimate_tokens(messages);
        let available = self.max_model_tokens.checked_sub(prompt_tokens)?;
        if available == 0 {
            return None;
        }
        Some(available.min(self.max_response_tokens))
    }
}

/// Rough count: one token per four bytes of content, plus per-message framing.
pub fn estimate_tokens(messages: &[CompletionMessage]) -> u32 {
    messages
        .iter()
        .map(|m| (m.content.len() as u32).div_ceil(4) + 4)
        .sum()
}
