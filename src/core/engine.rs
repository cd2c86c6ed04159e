//! The turn loop.
//!
//! One [`Engine::run`] call drives a session from a user input to either a
//! final answer or a typed failure. Each turn streams one model response,
//! honors at most one tool call from it, routes that call through the
//! approval gate, and feeds the result back. Nothing is thrown past `run`:
//! every failure comes back as a [`RunFailure`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalGate, ApprovalReason, Verdict};
use crate::audit;
use crate::compaction::Summarizer;
use crate::core::events::Event;
use crate::core::tool_parser::{Segment, StreamFilter, parse_response};
use crate::core::turn::{RunFailureKind, RunOutcome, TurnContext};
use crate::error_taxonomy::ErrorEnvelope;
use crate::llm_client::{LlmClient, LlmError, RequestOptions, StreamEvent};
use crate::logging;
use crate::models::{
    AssistantPart, Message, ModelLimits, NormalizedMessage, ToolCallRecord, ToolResultEntry,
    ToolUse, Usage, UserContent,
};
use crate::session_store::Session;
use crate::tools::{ToolError, ToolRegistry, ToolResult};
use crate::utils::{short_id, truncate_with_ellipsis};

/// Maximum time to wait for a single stream chunk before assuming a stall.
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 90;
/// Maximum total bytes of text/reasoning content before aborting the stream.
const STREAM_MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024; // 10 MB
/// Hard cap for any tool output inserted into model context.
const TOOL_RESULT_CONTEXT_HARD_LIMIT_CHARS: usize = 12_000;
/// Soft cap for known noisy tools inserted into model context.
const TOOL_RESULT_CONTEXT_SOFT_LIMIT_CHARS: usize = 2_000;
/// Snippet length kept when compacting tool output for model context.
const TOOL_RESULT_CONTEXT_SNIPPET_CHARS: usize = 900;
/// Max chars to keep from metadata-provided output summaries.
const TOOL_RESULT_METADATA_SUMMARY_CHARS: usize = 320;

pub const DEFAULT_MAX_TURNS: u32 = 50;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limits: ModelLimits,
    pub max_turns: u32,
    pub system_prompt: String,
    pub request: RequestOptions,
    /// Summarize the history when the last turn used most of the window.
    pub compaction: bool,
    /// Where tool approvals and results are recorded; `None` disables it.
    pub audit_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ModelLimits::default(),
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: String::new(),
            request: RequestOptions::default(),
            compaction: true,
            audit_log: None,
        }
    }
}

/// Why a single turn produced no response.
enum TurnError {
    Canceled,
    Api(LlmError),
}

/// The raw material of one streamed response.
struct StreamedResponse {
    text: String,
    reasoning: String,
    usage: Usage,
}

fn format_tool_error(err: &ToolError, tool_name: &str) -> String {
    match err {
        ToolError::InvalidInput { message } => {
            format!("Invalid input for tool '{tool_name}': {message}")
        }
        ToolError::MissingField { field } => {
            format!("Tool '{tool_name}' is missing required field '{field}'")
        }
        ToolError::PathEscape { path } => format!(
            "Path escapes workspace: {}. Use a workspace-relative path.",
            path.display()
        ),
        ToolError::ExecutionFailed { message } => message.clone(),
        ToolError::Timeout { seconds } => format!(
            "Tool '{tool_name}' timed out after {seconds}s. Try a narrower scope or a longer timeout."
        ),
        ToolError::NotAvailable { message } => {
            format!("Tool '{tool_name}' is not available: {message}")
        }
        ToolError::PermissionDenied { message } => {
            format!("Tool '{tool_name}' was denied: {message}")
        }
    }
}

fn summarize_text(text: &str, limit: usize) -> String {
    truncate_with_ellipsis(text, limit, "...")
}

fn tool_result_is_noisy(tool_name: &str) -> bool {
    matches!(tool_name, "exec_shell" | "grep_files")
}

fn tool_result_metadata_summary(metadata: Option<&Value>) -> Option<String> {
    let obj = metadata?.as_object()?;
    for key in ["summary", "stdout_summary", "stderr_summary", "message"] {
        if let Some(text) = obj.get(key).and_then(Value::as_str) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(summarize_text(trimmed, TOOL_RESULT_METADATA_SUMMARY_CHARS));
            }
        }
    }
    None
}

fn compact_tool_result_for_context(tool_name: &str, output: &ToolResult) -> String {
    let raw = output.content.trim();
    if raw.is_empty() {
        return String::new();
    }

    let raw_chars = raw.chars().count();
    let should_compact = raw_chars > TOOL_RESULT_CONTEXT_HARD_LIMIT_CHARS
        || (tool_result_is_noisy(tool_name) && raw_chars > TOOL_RESULT_CONTEXT_SOFT_LIMIT_CHARS);
    if !should_compact {
        return raw.to_string();
    }

    let snippet = summarize_text(raw, TOOL_RESULT_CONTEXT_SNIPPET_CHARS);
    let omitted = raw_chars.saturating_sub(snippet.chars().count());
    let summary = tool_result_metadata_summary(output.metadata.as_ref());

    if let Some(summary) = summary {
        format!(
            "[{tool_name} output compacted to protect context]\nSummary: {summary}\nSnippet: {snippet}\n(Original: {raw_chars} chars, omitted: {omitted} chars.)"
        )
    } else {
        format!(
            "[{tool_name} output compacted to protect context]\nSnippet: {snippet}\n(Original: {raw_chars} chars, omitted: {omitted} chars.)"
        )
    }
}

fn verdict_label(reason: ApprovalReason) -> String {
    match reason {
        ApprovalReason::Yolo => "yolo".to_string(),
        ApprovalReason::ReadOnly => "read_only".to_string(),
        ApprovalReason::NotRequired => "not_required".to_string(),
        ApprovalReason::AutoEdit => "auto_edit".to_string(),
        ApprovalReason::SessionTool => "session_tool".to_string(),
        ApprovalReason::Human(decision) => serde_json::to_value(decision)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "human".to_string()),
    }
}

/// Drives model turns for one session at a time.
pub struct Engine {
    client: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    gate: ApprovalGate,
    summarizer: Arc<dyn Summarizer>,
    tx_event: Option<mpsc::Sender<Event>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        client: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        gate: ApprovalGate,
        summarizer: Arc<dyn Summarizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            tools,
            gate,
            summarizer,
            tx_event: None,
            config,
        }
    }

    /// Send progress events to `tx_event`.
    #[must_use]
    pub fn with_events(mut self, tx_event: mpsc::Sender<Event>) -> Self {
        self.tx_event = Some(tx_event);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    async fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx_event {
            let _ = tx.send(event).await;
        }
    }

    fn audit(&self, event: &str, details: Value) {
        if let Some(path) = self.config.audit_log.as_deref() {
            audit::log_sensitive_event(path, event, details);
        }
    }

    /// Run the loop for one user input.
    pub async fn run(
        &self,
        session: &mut Session,
        input: impl Into<UserContent>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let outcome = self.run_inner(session, input.into(), cancel).await;
        let (usage, turns, failure) = match &outcome {
            Ok(success) => (success.usage, success.turns, None),
            Err(failure) => (failure.usage, failure.turns, Some(failure.kind)),
        };
        if let Err(failure) = &outcome {
            logging::info(format!("Run ended: {failure}"));
        }
        self.emit(Event::RunFinished {
            usage,
            turns,
            failure,
        })
        .await;
        outcome
    }

    async fn run_inner(
        &self,
        session: &mut Session,
        input: UserContent,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut turn = TurnContext::new(self.config.max_turns);

        // Compact before the new input lands so the prompt survives verbatim.
        if self.config.compaction && !cancel.is_cancelled() {
            self.maybe_compact(session).await;
        }
        let prompt = input.text();
        self.append(session, Message::user(input)).await;
        if let Err(err) = session.record_prompt(&prompt) {
            self.report_persist_failure(format!("Failed to record prompt: {err:#}"))
                .await;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(turn.fail(RunFailureKind::Canceled, "Run canceled", None));
            }
            if !turn.has_turns_left() {
                return Err(turn.fail(
                    RunFailureKind::MaxTurnsExceeded,
                    format!(
                        "Stopped after reaching the maximum of {} turns",
                        self.config.max_turns
                    ),
                    None,
                ));
            }
            if self.config.compaction && turn.turns() > 0 {
                self.maybe_compact(session).await;
            }

            let turn_number = turn.begin_turn();
            tracing::debug!(session_id = session.id(), turn = turn_number, "model request");
            self.emit(Event::TurnStarted { turn: turn_number }).await;

            let response = match self.stream_response(session, cancel).await {
                Ok(response) => response,
                Err(TurnError::Canceled) => {
                    return Err(turn.fail(RunFailureKind::Canceled, "Run canceled", None));
                }
                Err(TurnError::Api(err)) => {
                    let envelope = ErrorEnvelope::from(err.clone());
                    let message = err.to_string();
                    logging::warn(format!("Model request failed: {message}"));
                    self.emit(Event::error(message.clone(), envelope.recoverable))
                        .await;
                    return Err(turn.fail(
                        RunFailureKind::ApiError,
                        message,
                        Some(envelope.to_details()),
                    ));
                }
            };
            turn.record_usage(&response.usage);

            let (assistant, tool_use) = self.assistant_message(response);
            let stored = self.append(session, assistant).await;

            let Some(tool_use) = tool_use else {
                let final_text = stored.message.text();
                let history = session
                    .history()
                    .active_path()
                    .into_iter()
                    .cloned()
                    .collect();
                return Ok(turn.succeed(final_text, history));
            };

            self.emit(Event::ToolCallStarted {
                id: tool_use.call_id.clone(),
                name: tool_use.name.clone(),
                input: tool_use.params.clone(),
            })
            .await;

            let verdict = match self.tools.approval_context(&tool_use.name, &tool_use.params) {
                Some(context) => {
                    let verdict = tokio::select! {
                        () = cancel.cancelled() => None,
                        verdict = self.gate.should_approve(&tool_use, &context, session) => Some(verdict),
                    };
                    let Some(verdict) = verdict else {
                        self.append_tool_result(
                            session,
                            &tool_use,
                            "Tool call canceled before it ran.".to_string(),
                            true,
                        )
                        .await;
                        return Err(turn.fail(RunFailureKind::Canceled, "Run canceled", None));
                    };
                    if verdict.escalated() {
                        self.audit(
                            audit::APPROVAL_REQUIRED,
                            json!({
                                "session_id": session.id(),
                                "tool": tool_use.name,
                                "category": context.category,
                                "input": tool_use.params,
                            }),
                        );
                    }
                    verdict
                }
                // Unknown tools run so the registry's error reaches the model.
                None => Verdict {
                    approved: true,
                    reason: ApprovalReason::NotRequired,
                },
            };
            self.audit(
                audit::APPROVAL_DECISION,
                json!({
                    "session_id": session.id(),
                    "tool": tool_use.name,
                    "approved": verdict.approved,
                    "reason": verdict_label(verdict.reason),
                }),
            );

            if !verdict.approved {
                let output = format!("Tool call '{}' was denied by the user.", tool_use.name);
                self.append_tool_result(session, &tool_use, output.clone(), true)
                    .await;
                turn.record_tool_call(ToolCallRecord {
                    call_id: tool_use.call_id.clone(),
                    name: tool_use.name.clone(),
                    input: tool_use.params.clone(),
                    output: output.clone(),
                    approved: false,
                    is_error: true,
                });
                self.emit(Event::ToolCallComplete {
                    id: tool_use.call_id.clone(),
                    name: tool_use.name.clone(),
                    output: output.clone(),
                    success: false,
                    approval: None,
                })
                .await;
                return Err(turn.fail(RunFailureKind::ToolDenied, output, None));
            }

            tracing::info!(
                session_id = session.id(),
                turn = turn_number,
                tool = %tool_use.name,
                "running tool"
            );
            let (output, is_error, error) = match self
                .tools
                .invoke(&tool_use.name, tool_use.params.clone())
                .await
            {
                Ok(result) => (
                    compact_tool_result_for_context(&tool_use.name, &result),
                    !result.success,
                    None,
                ),
                Err(err) => (
                    format_tool_error(&err, &tool_use.name),
                    true,
                    Some(ErrorEnvelope::from(err).to_details()),
                ),
            };
            self.audit(
                audit::TOOL_RESULT,
                json!({
                    "session_id": session.id(),
                    "tool": tool_use.name,
                    "success": !is_error,
                    "output_chars": output.chars().count(),
                    "error": error,
                }),
            );

            self.append_tool_result(session, &tool_use, output.clone(), is_error)
                .await;
            turn.record_tool_call(ToolCallRecord {
                call_id: tool_use.call_id.clone(),
                name: tool_use.name.clone(),
                input: tool_use.params.clone(),
                output: output.clone(),
                approved: true,
                is_error,
            });
            self.emit(Event::ToolCallComplete {
                id: tool_use.call_id,
                name: tool_use.name,
                output,
                success: !is_error,
                approval: Some(verdict.reason),
            })
            .await;
        }
    }

    /// Stream one response, filtering call markup out of the live text.
    async fn stream_response(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<StreamedResponse, TurnError> {
        let input = session.history().to_model_input();
        let mut stream = tokio::select! {
            () = cancel.cancelled() => return Err(TurnError::Canceled),
            result = self.client.send(&input, &self.config.system_prompt, &self.config.request) => {
                result.map_err(TurnError::Api)?
            }
        };

        let mut filter = StreamFilter::new();
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut usage = Usage::default();
        let mut content_bytes: usize = 0;
        let chunk_timeout = Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS);

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(TurnError::Canceled),
                result = tokio::time::timeout(chunk_timeout, stream.next()) => match result {
                    Ok(next) => next,
                    Err(_) => {
                        return Err(TurnError::Api(LlmError::StreamError(format!(
                            "Stream stalled: no data received for {STREAM_CHUNK_TIMEOUT_SECS}s"
                        ))));
                    }
                }
            };
            let Some(event) = next else {
                break;
            };

            match event.map_err(TurnError::Api)? {
                StreamEvent::TextDelta(delta) => {
                    content_bytes = content_bytes.saturating_add(delta.len());
                    text.push_str(&delta);
                    let visible = filter.push(&delta);
                    if !visible.is_empty() {
                        self.emit(Event::TextDelta { content: visible }).await;
                    }
                }
                StreamEvent::ReasoningDelta(delta) => {
                    content_bytes = content_bytes.saturating_add(delta.len());
                    reasoning.push_str(&delta);
                    self.emit(Event::ReasoningDelta { content: delta }).await;
                }
                StreamEvent::Finish(final_usage) => usage = final_usage,
            }

            if content_bytes > STREAM_MAX_CONTENT_BYTES {
                return Err(TurnError::Api(LlmError::StreamError(format!(
                    "Stream exceeded maximum content size of {STREAM_MAX_CONTENT_BYTES} bytes"
                ))));
            }
        }

        let tail = filter.finish();
        if !tail.is_empty() {
            self.emit(Event::TextDelta { content: tail }).await;
        }

        Ok(StreamedResponse {
            text,
            reasoning,
            usage,
        })
    }

    /// Build the assistant message for a finished response and pick out its call.
    fn assistant_message(&self, response: StreamedResponse) -> (Message, Option<ToolUse>) {
        let parsed = parse_response(&response.text);
        let mut parts = Vec::new();
        if !response.reasoning.trim().is_empty() {
            parts.push(AssistantPart::Reasoning {
                text: response.reasoning,
            });
        }

        let mut tool_use = None;
        for segment in parsed.segments {
            match segment {
                Segment::Text(text) => {
                    if !text.is_empty() {
                        parts.push(AssistantPart::Text { text });
                    }
                }
                Segment::ToolUse { name, params } => {
                    if tool_use.is_some() {
                        continue;
                    }
                    let call = ToolUse {
                        call_id: format!("call_{}", short_id()),
                        name,
                        params,
                    };
                    parts.push(AssistantPart::ToolUse {
                        id: call.call_id.clone(),
                        name: call.name.clone(),
                        input: call.params.clone(),
                    });
                    tool_use = Some(call);
                }
            }
        }

        let message = Message::Assistant {
            parts,
            rendered_text: parsed.rendered_text,
            model_id: self.client.model_id().to_string(),
            usage: response.usage,
        };
        (message, tool_use)
    }

    async fn append(&self, session: &mut Session, message: Message) -> NormalizedMessage {
        let stored = session.record(message);
        if let Err(err) = session.persist_message(&stored) {
            self.report_persist_failure(format!(
                "Failed to persist message {}: {err:#}",
                stored.id
            ))
            .await;
        }
        self.emit(Event::MessageAppended {
            message: Box::new(stored.clone()),
        })
        .await;
        stored
    }

    async fn append_tool_result(
        &self,
        session: &mut Session,
        tool_use: &ToolUse,
        result: String,
        is_error: bool,
    ) {
        let entry = ToolResultEntry {
            call_id: tool_use.call_id.clone(),
            tool_name: tool_use.name.clone(),
            input: tool_use.params.clone(),
            result,
            is_error,
        };
        self.append(
            session,
            Message::ToolResult {
                entries: vec![entry],
            },
        )
        .await;
    }

    async fn report_persist_failure(&self, message: String) {
        logging::warn(&message);
        self.emit(Event::error(message, true)).await;
    }

    async fn maybe_compact(&self, session: &mut Session) {
        if !session.history().needs_compaction(&self.config.limits) {
            return;
        }
        self.emit(Event::CompactionStarted {
            message: "Summarizing earlier conversation to free context".to_string(),
        })
        .await;
        match session
            .compress(&self.config.limits, self.summarizer.as_ref())
            .await
        {
            Ok(outcome) if outcome.compacted => {
                let chars = outcome.summary.as_deref().map_or(0, |s| s.chars().count());
                logging::info(format!("Compacted session {} ({chars} chars)", session.id()));
                self.emit(Event::CompactionCompleted {
                    message: format!("History replaced by a {chars}-char summary"),
                })
                .await;
            }
            Ok(_) => {}
            Err(err) => {
                let message = format!("Compaction failed: {err}");
                logging::warn(&message);
                self.emit(Event::CompactionFailed { message }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests;
