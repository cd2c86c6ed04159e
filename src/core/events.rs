//! Events emitted by the engine while a run is in progress.
//!
//! Delivery is fire-and-forget over a bounded channel: a missing or closed
//! listener never fails the run.

use serde_json::Value;

use crate::approval::{ApprovalReason, ToolCategory};
use crate::core::turn::RunFailureKind;
use crate::models::{NormalizedMessage, Usage};

/// Events emitted by the engine to update the UI.
#[derive(Debug, Clone)]
pub enum Event {
    // === Turn Lifecycle ===
    /// A model request is about to be sent.
    TurnStarted { turn: u32 },

    /// Display-safe text; tool-call markup has been removed.
    TextDelta { content: String },

    ReasoningDelta { content: String },

    /// A message was added to the session history.
    MessageAppended { message: Box<NormalizedMessage> },

    // === Tool Events ===
    ToolCallStarted {
        id: String,
        name: String,
        input: Value,
    },

    ToolCallComplete {
        id: String,
        name: String,
        output: String,
        success: bool,
        /// How the call was approved, or `None` when it was denied.
        approval: Option<ApprovalReason>,
    },

    /// A human decision is needed; answer through the approval broker.
    ApprovalRequired {
        id: String,
        tool_name: String,
        category: ToolCategory,
        input: Value,
    },

    // === Compaction ===
    CompactionStarted { message: String },

    CompactionCompleted { message: String },

    CompactionFailed { message: String },

    // === Run End ===
    RunFinished {
        usage: Usage,
        turns: u32,
        failure: Option<RunFailureKind>,
    },

    // === System Events ===
    Error { message: String, recoverable: bool },

    Status { message: String },
}

impl Event {
    /// Create a new error event
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Event::Error {
            message: message.into(),
            recoverable,
        }
    }

    /// Create a new status event
    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
        }
    }
}
