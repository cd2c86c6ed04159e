//! Append-only conversation history with fork resolution.
//!
//! The log is a flat arena of [`NormalizedMessage`]s in append order plus an
//! id index. Branches are never stored as pointers: the active path is
//! recomputed on every read by starting at the last root and following, at
//! each fork, the most recently appended child.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::compaction::{
    CompactionError, CompressOutcome, Summarizer, should_compact, summary_message_text,
};
use crate::core::tool_parser::render_tool_call;
use crate::models::{
    AssistantPart, InputPart, InputRole, Message, ModelInputItem, ModelLimits, NormalizedMessage,
    ToolResultEntry, Usage, UserContent, UserPart,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("duplicate message id '{0}'")]
    DuplicateId(String),
    #[error("message '{id}' references unknown or later parent '{parent}'")]
    UnknownParent { id: String, parent: String },
}

/// Ordered, parent-linked message log.
#[derive(Debug, Clone, Default)]
pub struct History {
    log: Vec<NormalizedMessage>,
    index: HashMap<String, usize>,
    /// Ids dropped by compaction; they still exist in the persisted log.
    retired: HashSet<String>,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted order, checking that every parent came first.
    pub fn from_log(messages: Vec<NormalizedMessage>) -> Result<Self, HistoryError> {
        let mut history = Self::new();
        for message in messages {
            history.push(message)?;
        }
        Ok(history)
    }

    fn push(&mut self, message: NormalizedMessage) -> Result<(), HistoryError> {
        if self.index.contains_key(&message.id) {
            return Err(HistoryError::DuplicateId(message.id));
        }
        if let Some(parent) = message.parent_id.as_deref()
            && !self.index.contains_key(parent)
        {
            return Err(HistoryError::UnknownParent {
                id: message.id.clone(),
                parent: parent.to_string(),
            });
        }
        self.index.insert(message.id.clone(), self.log.len());
        self.log.push(message);
        Ok(())
    }

    fn is_taken(&self, id: &str) -> bool {
        self.index.contains_key(id) || self.retired.contains(id)
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = new_message_id();
            if !self.is_taken(&id) {
                return id;
            }
        }
    }

    /// Append after the tip of the active path.
    pub fn append(&mut self, message: Message) -> NormalizedMessage {
        let parent_id = self.active_tip().map(|tip| tip.id.clone());
        self.append_root_or_child(message, parent_id)
    }

    /// Append under an explicit parent, creating a fork when the parent
    /// already has children. `None` starts a new root.
    pub fn append_with_parent(
        &mut self,
        message: Message,
        parent_id: Option<&str>,
    ) -> Result<NormalizedMessage, HistoryError> {
        if let Some(parent) = parent_id
            && !self.index.contains_key(parent)
        {
            return Err(HistoryError::UnknownParent {
                id: String::new(),
                parent: parent.to_string(),
            });
        }
        Ok(self.append_root_or_child(message, parent_id.map(str::to_string)))
    }

    fn append_root_or_child(
        &mut self,
        message: Message,
        parent_id: Option<String>,
    ) -> NormalizedMessage {
        let normalized = NormalizedMessage {
            id: self.fresh_id(),
            parent_id,
            created_at: Utc::now(),
            message,
        };
        self.index.insert(normalized.id.clone(), self.log.len());
        self.log.push(normalized.clone());
        normalized
    }

    /// The conversation as currently seen.
    #[must_use]
    pub fn active_path(&self) -> Vec<&NormalizedMessage> {
        let Some(root) = self.log.iter().rposition(NormalizedMessage::is_root) else {
            return Vec::new();
        };

        // Later children overwrite earlier ones, so each entry is the latest.
        let mut latest_child: HashMap<&str, usize> = HashMap::new();
        for (idx, message) in self.log.iter().enumerate().skip(root + 1) {
            if let Some(parent) = message.parent_id.as_deref() {
                latest_child.insert(parent, idx);
            }
        }

        let mut path = vec![&self.log[root]];
        let mut current = root;
        while let Some(&next) = latest_child.get(self.log[current].id.as_str()) {
            if next <= current {
                break;
            }
            path.push(&self.log[next]);
            current = next;
        }
        path
    }

    fn active_tip(&self) -> Option<&NormalizedMessage> {
        self.active_path().last().copied()
    }

    /// Every stored message in append order, including inactive branches.
    #[must_use]
    pub fn messages(&self) -> &[NormalizedMessage] {
        &self.log
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NormalizedMessage> {
        self.index.get(id).map(|&idx| &self.log[idx])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Last assistant message on the active path.
    #[must_use]
    pub fn last_assistant(&self) -> Option<&NormalizedMessage> {
        self.active_path()
            .into_iter()
            .rev()
            .find(|entry| matches!(entry.message, Message::Assistant { .. }))
    }

    #[must_use]
    pub fn last_assistant_usage(&self) -> Option<&Usage> {
        self.last_assistant().and_then(|entry| entry.message.usage())
    }

    /// Convert the active path into provider-neutral request items.
    #[must_use]
    pub fn to_model_input(&self) -> Vec<ModelInputItem> {
        self.active_path()
            .into_iter()
            .filter_map(|entry| message_to_input(&entry.message))
            .collect()
    }

    /// Whether the last assistant turn's usage crossed the compaction line.
    #[must_use]
    pub fn needs_compaction(&self, limits: &ModelLimits) -> bool {
        should_compact(self.last_assistant_usage(), limits)
    }

    /// Summarize the active path and replace the log with one synthetic root.
    ///
    /// An empty or failed summary leaves the history untouched.
    pub async fn compress(
        &mut self,
        limits: &ModelLimits,
        summarizer: &dyn Summarizer,
    ) -> Result<CompressOutcome, CompactionError> {
        if !self.needs_compaction(limits) {
            return Ok(CompressOutcome::default());
        }

        let summary = {
            let path = self.active_path();
            summarizer
                .summarize(&path)
                .await
                .map_err(CompactionError::Summarizer)?
        };
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(CompactionError::EmptySummary);
        }

        self.replace_with_summary(&summary);
        Ok(CompressOutcome {
            compacted: true,
            summary: Some(summary),
        })
    }

    /// Discard the in-memory log and start over from a single summary root.
    pub fn replace_with_summary(&mut self, summary: &str) -> NormalizedMessage {
        self.log.clear();
        self.retired.extend(self.index.drain().map(|(id, _)| id));
        self.append_root_or_child(Message::user(summary_message_text(summary)), None)
    }
}

fn message_to_input(message: &Message) -> Option<ModelInputItem> {
    match message {
        Message::System { content } => Some(ModelInputItem::text(InputRole::System, content)),
        Message::User { content } => {
            let parts = match content {
                UserContent::Text(text) => vec![InputPart::Text { text: text.clone() }],
                UserContent::Parts(parts) => parts
                    .iter()
                    .map(|part| match part {
                        UserPart::Text { text } => InputPart::Text { text: text.clone() },
                        UserPart::Image { data, mime_type } => InputPart::Image {
                            data: data.clone(),
                            mime_type: mime_type.clone(),
                        },
                        UserPart::ToolResult(entry) => InputPart::Text {
                            text: function_result_text(entry),
                        },
                    })
                    .collect(),
            };
            Some(ModelInputItem {
                role: InputRole::User,
                content: parts,
            })
        }
        Message::Assistant {
            parts,
            rendered_text,
            ..
        } => {
            let text = if rendered_text.is_empty() {
                assistant_text_from_parts(parts)
            } else {
                rendered_text.clone()
            };
            if text.trim().is_empty() {
                return None;
            }
            Some(ModelInputItem::text(InputRole::Assistant, text))
        }
        Message::ToolResult { entries } => Some(ModelInputItem {
            role: InputRole::User,
            content: entries
                .iter()
                .map(|entry| InputPart::Text {
                    text: function_result_text(entry),
                })
                .collect(),
        }),
    }
}

fn assistant_text_from_parts(parts: &[AssistantPart]) -> String {
    let mut text = String::new();
    for part in parts {
        match part {
            AssistantPart::Text { text: chunk } => text.push_str(chunk),
            AssistantPart::ToolUse { name, input, .. } => {
                text.push_str(&render_tool_call(name, input));
            }
            AssistantPart::Reasoning { .. } => {}
        }
    }
    text
}

/// Render a tool result the way the model expects to read it back.
#[must_use]
pub fn function_result_text(entry: &ToolResultEntry) -> String {
    let input = serde_json::to_string(&entry.input).unwrap_or_else(|_| entry.input.to_string());
    let body = if entry.is_error {
        format!("Error: {}", entry.result)
    } else {
        entry.result.clone()
    };
    format!(
        "[{} for '{}'] result: \n<function_results>\n{}\n</function_results>",
        entry.tool_name, input, body
    )
}
