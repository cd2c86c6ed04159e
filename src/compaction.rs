//! Context compaction for long conversations.
//!
//! Compaction replaces the active conversation with a single synthetic user
//! message carrying a model-written summary. It is triggered from the usage
//! reported on the last assistant turn and never runs on a guess.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm_client::{LlmClient, LlmError, RequestOptions, StreamEvent};
use crate::logging;
use crate::models::{
    AssistantPart, InputRole, Message, ModelInputItem, ModelLimits, NormalizedMessage, Usage,
    UserContent, UserPart,
};
use crate::utils::truncate_chars;

/// Fraction of the usable window at which compaction fires (9/10).
const COMPACTION_RATIO_NUM: u64 = 9;
const COMPACTION_RATIO_DEN: u64 = 10;
/// Output reservation never exceeds this many tokens.
pub const MAX_OUTPUT_RESERVE_TOKENS: u32 = 32_000;
const MIN_RESERVE_TOKENS: u32 = 4_096;
const MAX_RESERVE_TOKENS: u32 = 100_000;
const RESERVE_DIVISOR: u32 = 8;

pub const SUMMARY_PREAMBLE: &str = "This session is being continued from a previous conversation. \
Summary of the earlier conversation:";

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that creates concise conversation summaries.";

/// Why a compaction attempt produced nothing.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("summarizer returned an empty summary")]
    EmptySummary,
    #[error("summarizer failed: {0}")]
    Summarizer(#[source] anyhow::Error),
}

/// Result of [`crate::history::History::compress`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressOutcome {
    pub compacted: bool,
    pub summary: Option<String>,
}

/// Condenses a transcript into a summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &[&NormalizedMessage]) -> Result<String>;
}

/// Reserved-token budget; grows with the window, with a floor and a ceiling.
#[must_use]
pub fn scaled_reserve(context: u32) -> u32 {
    (context / RESERVE_DIVISOR).clamp(MIN_RESERVE_TOKENS, MAX_RESERVE_TOKENS)
}

/// Token count above which the active branch should be compacted.
#[must_use]
pub fn compaction_threshold(limits: &ModelLimits) -> u64 {
    let output = limits.output.min(MAX_OUTPUT_RESERVE_TOKENS);
    let usable = limits.context.saturating_sub(output);
    let base = usable.max(scaled_reserve(limits.context));
    u64::from(base) * COMPACTION_RATIO_NUM / COMPACTION_RATIO_DEN
}

/// Decide from the last assistant turn's usage whether to compact.
#[must_use]
pub fn should_compact(last_usage: Option<&Usage>, limits: &ModelLimits) -> bool {
    let Some(usage) = last_usage else {
        return false;
    };
    usage.total_tokens > compaction_threshold(limits)
}

/// Body of the synthetic root message that replaces a compacted history.
#[must_use]
pub fn summary_message_text(summary: &str) -> String {
    format!("{SUMMARY_PREAMBLE}\n\n{}", summary.trim())
}

/// Render the active path as plain text for summarization.
#[must_use]
pub fn render_transcript(messages: &[&NormalizedMessage]) -> String {
    let mut out = String::new();
    for entry in messages {
        match &entry.message {
            Message::System { content } => {
                let _ = write!(out, "System: {content}\n\n");
            }
            Message::User { content } => match content {
                UserContent::Text(text) => {
                    let _ = write!(out, "User: {text}\n\n");
                }
                UserContent::Parts(parts) => {
                    for part in parts {
                        match part {
                            UserPart::Text { text } => {
                                let _ = write!(out, "User: {text}\n\n");
                            }
                            UserPart::Image { mime_type, .. } => {
                                let _ = write!(out, "User: [image {mime_type}]\n\n");
                            }
                            UserPart::ToolResult(result) => {
                                let snippet = truncate_chars(&result.result, 500);
                                let _ = write!(out, "Tool result ({}): {snippet}\n\n", result.tool_name);
                            }
                        }
                    }
                }
            },
            Message::Assistant { parts, .. } => {
                for part in parts {
                    match part {
                        AssistantPart::Text { text } => {
                            let _ = write!(out, "Assistant: {text}\n\n");
                        }
                        AssistantPart::ToolUse { name, .. } => {
                            let _ = write!(out, "Assistant: [Used tool: {name}]\n\n");
                        }
                        // Reasoning is not part of the shared record.
                        AssistantPart::Reasoning { .. } => {}
                    }
                }
            }
            Message::ToolResult { entries } => {
                for result in entries {
                    let snippet = truncate_chars(&result.result, 500);
                    let _ = write!(out, "Tool result ({}): {snippet}\n\n", result.tool_name);
                }
            }
        }
    }
    out
}

/// Summarizer backed by the conversation's own model client.
pub struct ModelSummarizer {
    client: Arc<dyn LlmClient>,
    max_output_tokens: u32,
}

impl ModelSummarizer {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            max_output_tokens: 2048,
        }
    }

    async fn summarize_once(&self, transcript: &str) -> std::result::Result<String, LlmError> {
        let request = vec![ModelInputItem::text(
            InputRole::User,
            format!(
                "Summarize the following conversation in a concise but comprehensive way. \
                 Preserve key information, decisions made, files touched, and any pending work. \
                 Keep it under 500 words.\n\n---\n\n{transcript}"
            ),
        )];
        let options = RequestOptions {
            max_output_tokens: self.max_output_tokens,
            temperature: Some(0.3),
        };
        let mut stream = self
            .client
            .send(&request, SUMMARY_SYSTEM_PROMPT, &options)
            .await?;

        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(text) => summary.push_str(&text),
                StreamEvent::ReasoningDelta(_) | StreamEvent::Finish(_) => {}
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    /// Retries transient failures with exponential backoff (1s, 2s).
    async fn summarize(&self, transcript: &[&NormalizedMessage]) -> Result<String> {
        const MAX_RETRIES: u32 = 3;
        const BASE_DELAY_MS: u64 = 1000;

        let text = render_transcript(transcript);
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(BASE_DELAY_MS * (1 << (attempt - 1)));
                tokio::time::sleep(delay).await;
            }

            match self.summarize_once(&text).await {
                Ok(summary) => return Ok(summary),
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err.into());
                    }
                    logging::warn(format!(
                        "Summarization attempt {} failed: {err}",
                        attempt + 1
                    ));
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(err) => err.into(),
            None => anyhow::anyhow!("Summarization failed after {MAX_RETRIES} retries"),
        })
    }
}
