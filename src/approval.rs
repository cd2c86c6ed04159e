//! Tool approval policy.
//!
//! The gate decides, per proposed tool call, whether it may run. Cheap rules
//! are checked first; only when none of them applies is a human asked. Session
//! scoped answers are written back to the session policy before returning.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::core::events::Event;
use crate::logging;
use crate::models::ToolUse;
use crate::session_store::Session;
use crate::utils::short_id;

/// Global or per-session approval posture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalMode {
    #[default]
    Default,
    AutoEdit,
    Yolo,
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApprovalMode::Default => "default",
            ApprovalMode::AutoEdit => "autoEdit",
            ApprovalMode::Yolo => "yolo",
        };
        f.write_str(label)
    }
}

impl FromStr for ApprovalMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" | "ask" => Ok(ApprovalMode::Default),
            "autoedit" | "auto-edit" | "auto_edit" => Ok(ApprovalMode::AutoEdit),
            "yolo" => Ok(ApprovalMode::Yolo),
            other => anyhow::bail!(
                "Invalid approval mode '{other}': expected default, autoEdit, or yolo."
            ),
        }
    }
}

/// Answer from the human channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    ApproveOnce,
    ApproveSessionEdits,
    ApproveSessionTool,
    Deny,
}

impl ApprovalDecision {
    #[must_use]
    pub fn is_approved(self) -> bool {
        !matches!(self, ApprovalDecision::Deny)
    }
}

/// Coarse side-effect class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Write,
    Command,
    Network,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ToolCategory::Read => "read",
            ToolCategory::Write => "write",
            ToolCategory::Command => "command",
            ToolCategory::Network => "network",
        };
        f.write_str(label)
    }
}

/// What the registry knows about a call before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalContext {
    pub category: ToolCategory,
    /// Result of the tool's own predicate; `Some(false)` means no approval needed.
    pub requires_approval: Option<bool>,
}

impl ApprovalContext {
    #[must_use]
    pub fn new(category: ToolCategory) -> Self {
        Self {
            category,
            requires_approval: None,
        }
    }
}

/// Which rule produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalReason {
    Yolo,
    ReadOnly,
    NotRequired,
    AutoEdit,
    SessionTool,
    Human(ApprovalDecision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub approved: bool,
    pub reason: ApprovalReason,
}

impl Verdict {
    fn approve(reason: ApprovalReason) -> Self {
        Self {
            approved: true,
            reason,
        }
    }

    #[must_use]
    pub fn escalated(&self) -> bool {
        matches!(self.reason, ApprovalReason::Human(_))
    }
}

/// Channel to whoever can approve a tool call.
#[async_trait]
pub trait HumanApproval: Send + Sync {
    async fn request_approval(
        &self,
        tool_use: &ToolUse,
        category: ToolCategory,
    ) -> Result<ApprovalDecision>;
}

/// Layered approval policy.
#[derive(Clone)]
pub struct ApprovalGate {
    mode: ApprovalMode,
    auto_edit: bool,
    human: Arc<dyn HumanApproval>,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode, auto_edit: bool, human: Arc<dyn HumanApproval>) -> Self {
        Self {
            mode,
            auto_edit,
            human,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    /// Decide whether `tool_use` may run. First matching rule wins.
    pub async fn should_approve(
        &self,
        tool_use: &ToolUse,
        context: &ApprovalContext,
        session: &mut Session,
    ) -> Verdict {
        let policy = session.policy();
        if self.mode == ApprovalMode::Yolo || policy.approval_mode == ApprovalMode::Yolo {
            return Verdict::approve(ApprovalReason::Yolo);
        }
        if context.category == ToolCategory::Read {
            return Verdict::approve(ApprovalReason::ReadOnly);
        }
        if context.requires_approval == Some(false) {
            return Verdict::approve(ApprovalReason::NotRequired);
        }
        if context.category == ToolCategory::Write
            && (self.auto_edit
                || self.mode == ApprovalMode::AutoEdit
                || policy.approval_mode == ApprovalMode::AutoEdit)
        {
            return Verdict::approve(ApprovalReason::AutoEdit);
        }
        if policy.approved_tool_names.contains(&tool_use.name) {
            return Verdict::approve(ApprovalReason::SessionTool);
        }

        let decision = match self
            .human
            .request_approval(tool_use, context.category)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                logging::warn(format!(
                    "Approval channel failed for {}: {err}; denying",
                    tool_use.name
                ));
                ApprovalDecision::Deny
            }
        };

        let persisted = match decision {
            ApprovalDecision::ApproveSessionEdits => session.update_policy(|policy| {
                policy.approval_mode = ApprovalMode::AutoEdit;
            }),
            ApprovalDecision::ApproveSessionTool => {
                let name = tool_use.name.clone();
                session.update_policy(move |policy| {
                    policy.approved_tool_names.insert(name);
                })
            }
            ApprovalDecision::ApproveOnce | ApprovalDecision::Deny => Ok(()),
        };
        if let Err(err) = persisted {
            logging::warn(format!("Failed to persist session approval: {err:#}"));
        }

        Verdict {
            approved: decision.is_approved(),
            reason: ApprovalReason::Human(decision),
        }
    }
}

// === Approval Broker ===

/// In-process human channel: each request parks on a oneshot until
/// [`ApprovalBroker::resolve`] is called with its id.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    tx_event: mpsc::Sender<Event>,
}

impl ApprovalBroker {
    pub fn new(tx_event: mpsc::Sender<Event>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            tx_event,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ApprovalDecision>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Complete a pending request. Returns false for unknown or stale ids.
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let Some(sender) = self.pending().remove(request_id) else {
            return false;
        };
        sender.send(decision).is_ok()
    }

    /// Ids of requests still waiting for an answer.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending().keys().cloned().collect()
    }
}

/// Removes a request from the pending table however its wait ends.
struct PendingEntry<'a> {
    broker: &'a ApprovalBroker,
    request_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.broker.pending().remove(&self.request_id);
    }
}

#[async_trait]
impl HumanApproval for ApprovalBroker {
    async fn request_approval(
        &self,
        tool_use: &ToolUse,
        category: ToolCategory,
    ) -> Result<ApprovalDecision> {
        let request_id = short_id();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id.clone(), tx);
        let _entry = PendingEntry {
            broker: self,
            request_id: request_id.clone(),
        };

        let sent = self
            .tx_event
            .send(Event::ApprovalRequired {
                id: request_id.clone(),
                tool_name: tool_use.name.clone(),
                category,
                input: tool_use.params.clone(),
            })
            .await;
        if sent.is_err() {
            anyhow::bail!("approval listener is gone");
        }

        rx.await
            .map_err(|_| anyhow::anyhow!("approval request {request_id} was dropped"))
    }
}

/// Short human-readable description of a pending call.
#[must_use]
pub fn describe_tool_call(tool_name: &str, category: ToolCategory, input: &Value) -> String {
    let args = serde_json::to_string(input).unwrap_or_else(|_| input.to_string());
    format!(
        "{tool_name} ({category}) {}",
        crate::utils::truncate_with_ellipsis(&args, 200, "...")
    )
}
