//! Run results and per-run bookkeeping.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::models::{NormalizedMessage, ToolCallRecord, Usage};

/// Why a run stopped without a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunFailureKind {
    ToolDenied,
    MaxTurnsExceeded,
    ApiError,
    Canceled,
}

impl fmt::Display for RunFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunFailureKind::ToolDenied => "tool-denied",
            RunFailureKind::MaxTurnsExceeded => "max-turns-exceeded",
            RunFailureKind::ApiError => "api-error",
            RunFailureKind::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct RunSuccess {
    pub final_text: String,
    /// Active path at the end of the run.
    pub history: Vec<NormalizedMessage>,
    pub usage: Usage,
    pub turns: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RunFailure {
    pub kind: RunFailureKind,
    pub message: String,
    /// Provider diagnostics for `api-error`.
    pub details: Option<Value>,
    pub usage: Usage,
    pub turns: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    pub duration_ms: u64,
}

pub type RunOutcome = Result<RunSuccess, RunFailure>;

/// Counters and accumulators for one run.
#[derive(Debug)]
pub struct TurnContext {
    started: Instant,
    max_turns: u32,
    turns: u32,
    usage: Usage,
    tool_calls: Vec<ToolCallRecord>,
}

impl TurnContext {
    #[must_use]
    pub fn new(max_turns: u32) -> Self {
        Self {
            started: Instant::now(),
            max_turns,
            turns: 0,
            usage: Usage::default(),
            tool_calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn turns(&self) -> u32 {
        self.turns
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    /// Whether another model request is allowed.
    #[must_use]
    pub fn has_turns_left(&self) -> bool {
        self.turns < self.max_turns
    }

    /// Count a new model request and return its 1-based number.
    pub fn begin_turn(&mut self) -> u32 {
        self.turns += 1;
        self.turns
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    pub fn record_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_calls.push(record);
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn fail(
        &self,
        kind: RunFailureKind,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> RunFailure {
        RunFailure {
            kind,
            message: message.into(),
            details,
            usage: self.usage,
            turns: self.turns,
            tool_calls: self.tool_calls.clone(),
            duration_ms: self.elapsed_ms(),
        }
    }

    #[must_use]
    pub fn succeed(self, final_text: String, history: Vec<NormalizedMessage>) -> RunSuccess {
        RunSuccess {
            final_text,
            history,
            usage: self.usage,
            turns: self.turns,
            duration_ms: self.elapsed_ms(),
            tool_calls: self.tool_calls,
        }
    }
}
