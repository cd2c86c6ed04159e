//! Tool trait, context, and shared result/error types.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::approval::ToolCategory;

/// Execution environment handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Resolve `raw` against the workspace and reject anything outside it.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ToolError::invalid_input("path cannot be empty"));
        }
        let expanded = shellexpand::tilde(trimmed);
        let candidate = Path::new(expanded.as_ref());
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        };

        let root = normalize(&self.workspace);
        let resolved = normalize(&joined);
        if !resolved.starts_with(&root) || !real_path(&resolved).starts_with(real_path(&root)) {
            return Err(ToolError::PathEscape { path: resolved });
        }
        Ok(resolved)
    }

    /// Display form relative to the workspace.
    #[must_use]
    pub fn relative<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        let root = normalize(&self.workspace);
        path.strip_prefix(&root)
            .unwrap_or(path)
            .to_string_lossy()
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Follow symlinks through the deepest ancestor that exists on disk; the
/// components below it are kept as written.
fn real_path(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(mut real) = existing.canonicalize() {
            real.extend(missing.iter().rev());
            return real;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Output of a tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub success: bool,
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::success(serde_json::to_string_pretty(value)?))
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("missing required field: {field}")]
    MissingField { field: String },
    #[error("path escapes workspace: {}", path.display())]
    PathEscape { path: PathBuf },
    #[error("{message}")]
    ExecutionFailed { message: String },
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("not available: {message}")]
    NotAvailable { message: String },
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },
}

impl ToolError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: message.into(),
        }
    }
}

/// A tool the model can call.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn input_schema(&self) -> Value;

    fn category(&self) -> ToolCategory;

    /// Per-call approval override. `Some(false)` lets a specific call skip
    /// the human even though the category would normally ask.
    fn requires_approval(&self, _input: &Value) -> Option<bool> {
        None
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;
}

// === Input helpers ===

pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::missing_field(field))
}

#[must_use]
pub fn optional_str<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

#[must_use]
pub fn optional_u64(input: &Value, field: &str, default: u64) -> u64 {
    input.get(field).and_then(Value::as_u64).unwrap_or(default)
}

#[must_use]
pub fn optional_bool(input: &Value, field: &str, default: bool) -> bool {
    input.get(field).and_then(Value::as_bool).unwrap_or(default)
}
