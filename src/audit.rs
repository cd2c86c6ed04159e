//! Lightweight audit logging for tool approvals and results.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};

pub const APPROVAL_REQUIRED: &str = "tool.approval_required";
pub const APPROVAL_DECISION: &str = "tool.approval_decision";
pub const TOOL_RESULT: &str = "tool.result";

/// Append an audit event to `path`.
///
/// Best-effort: a failed write is logged and otherwise ignored.
pub fn log_sensitive_event(path: &Path, event: &str, details: Value) {
    if let Err(err) = append_event(path, event, details) {
        crate::logging::warn(format!("audit log write failed: {err}"));
    }
}

fn append_event(path: &Path, event: &str, details: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let record = json!({
        "ts": Utc::now().to_rfc3339(),
        "event": event,
        "details": details,
    });
    writeln!(file, "{}", serde_json::to_string(&record)?)?;
    Ok(())
}

/// `~/.turnwise/audit.log`, if a home directory exists.
#[must_use]
pub fn default_audit_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".turnwise").join("audit.log"))
}
