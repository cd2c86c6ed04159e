//! Conversation message model shared by history, sessions, and the engine.
//!
//! Messages are immutable once appended. Everything stored in a session log
//! is a [`NormalizedMessage`]: a [`Message`] plus its id, parent id, and
//! creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CONTEXT_WINDOW_TOKENS: u32 = 128_000;
pub const DEFAULT_OUTPUT_TOKENS: u32 = 8_192;

// === Core Message Types ===

/// A single conversation event, tagged by role.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        parts: Vec<AssistantPart>,
        /// Raw model text, truncated after the honored tool call.
        rendered_text: String,
        model_id: String,
        usage: Usage,
    },
    #[serde(rename = "tool")]
    ToolResult {
        entries: Vec<ToolResultEntry>,
    },
}

/// User message content: plain text or structured parts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum UserPart {
    Text { text: String },
    Image { data: String, mime_type: String },
    ToolResult(ToolResultEntry),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantPart {
    Text { text: String },
    Reasoning { text: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Outcome of one tool invocation as recorded in history.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEntry {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub result: String,
    pub is_error: bool,
}

/// A message as stored: the payload plus its position in the conversation tree.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub id: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

impl NormalizedMessage {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<UserContent>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// Short role label used in transcripts and listings.
    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::ToolResult { .. } => "tool",
        }
    }

    /// Visible prose of the message, ignoring reasoning and tool payloads.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Message::System { content } => content.clone(),
            Message::User { content } => content.text(),
            Message::Assistant { parts, .. } => parts
                .iter()
                .filter_map(|part| match part {
                    AssistantPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            Message::ToolResult { entries } => entries
                .iter()
                .map(|entry| entry.result.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// The tool call carried by an assistant message, if any.
    #[must_use]
    pub fn tool_use(&self) -> Option<(&str, &str, &Value)> {
        let Message::Assistant { parts, .. } = self else {
            return None;
        };
        parts.iter().find_map(|part| match part {
            AssistantPart::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    #[must_use]
    pub fn usage(&self) -> Option<&Usage> {
        match self {
            Message::Assistant { usage, .. } => Some(usage),
            _ => None,
        }
    }
}

impl UserContent {
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            UserContent::Text(text) => text.clone(),
            UserContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    UserPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for UserContent {
    fn from(value: String) -> Self {
        UserContent::Text(value)
    }
}

impl From<&str> for UserContent {
    fn from(value: &str) -> Self {
        UserContent::Text(value.to_string())
    }
}

impl From<Vec<UserPart>> for UserContent {
    fn from(value: Vec<UserPart>) -> Self {
        UserContent::Parts(value)
    }
}

// === Tool Calls ===

/// A tool invocation proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub call_id: String,
    pub name: String,
    pub params: Value,
}

/// A finished tool invocation, as reported in a run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    pub input: Value,
    pub output: String,
    pub approved: bool,
    pub is_error: bool,
}

// === Usage ===

/// Token usage metadata for a response.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

// === Model Input ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InputPart {
    Text { text: String },
    Image { data: String, mime_type: String },
}

/// One entry of the provider-neutral request transcript.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelInputItem {
    pub role: InputRole,
    pub content: Vec<InputPart>,
}

impl ModelInputItem {
    pub fn text(role: InputRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![InputPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text parts.
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                InputPart::Text { text } => Some(text.as_str()),
                InputPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// === Model Limits ===

/// Context and output budgets for a model, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub context: u32,
    pub output: u32,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            context: DEFAULT_CONTEXT_WINDOW_TOKENS,
            output: DEFAULT_OUTPUT_TOKENS,
        }
    }
}

/// Map known models to their approximate limits.
#[must_use]
pub fn limits_for_model(model: &str) -> ModelLimits {
    let lower = model.to_lowercase();
    if lower.contains("deepseek") {
        return ModelLimits {
            context: DEFAULT_CONTEXT_WINDOW_TOKENS,
            output: 8_192,
        };
    }
    if lower.contains("claude") {
        return ModelLimits {
            context: 200_000,
            output: 32_000,
        };
    }
    if lower.contains("gpt-4.1") {
        return ModelLimits {
            context: 1_047_576,
            output: 32_768,
        };
    }
    if lower.contains("gpt-4o") {
        return ModelLimits {
            context: 128_000,
            output: 16_384,
        };
    }
    if lower.contains("gemini") {
        return ModelLimits {
            context: 1_048_576,
            output: 65_536,
        };
    }
    ModelLimits::default()
}
