//! Workspace file tools: read, list, write, and exact-match edit.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use super::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, optional_u64, required_str,
};
use crate::approval::ToolCategory;

const MAX_READ_LINES: u64 = 2_000;

pub struct ReadFileTool;

#[async_trait]
impl ToolSpec for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 text file from the workspace. Lines are numbered from 1."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "offset": { "type": "integer", "description": "First line to return (1-based, default 1)" },
                "limit": { "type": "integer", "description": "Maximum lines to return (default 2000)" }
            },
            "required": ["path"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.resolve_path(required_str(&input, "path")?)?;
        let offset = optional_u64(&input, "offset", 1).max(1);
        let limit = optional_u64(&input, "limit", MAX_READ_LINES).clamp(1, MAX_READ_LINES);

        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::execution_failed(format!("Failed to read {}: {e}", path.display()))
        })?;

        let skip = usize::try_from(offset - 1).unwrap_or(usize::MAX);
        let take = usize::try_from(limit).unwrap_or(usize::MAX);
        let total = contents.lines().count();
        let numbered = contents
            .lines()
            .enumerate()
            .skip(skip)
            .take(take)
            .map(|(idx, line)| format!("{:>6}\t{line}", idx + 1))
            .collect::<Vec<_>>()
            .join("\n");

        let shown_end = (skip + take).min(total);
        let mut content = numbered;
        if shown_end < total {
            content.push_str(&format!(
                "\n[{} more lines; continue with offset {}]",
                total - shown_end,
                shown_end + 1
            ));
        }
        Ok(ToolResult::success(content).with_metadata(json!({ "total_lines": total })))
    }
}

#[derive(Debug, Serialize)]
struct DirEntry {
    name: String,
    kind: &'static str,
}

pub struct ListDirTool;

#[async_trait]
impl ToolSpec for ListDirTool {
    fn name(&self) -> &'static str {
        "list_dir"
    }

    fn description(&self) -> &'static str {
        "List the entries of a workspace directory."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: workspace root)" }
            }
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw = input.get("path").and_then(Value::as_str).unwrap_or(".");
        let dir = context.resolve_path(raw)?;

        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| {
            ToolError::execution_failed(format!("Failed to list {}: {e}", dir.display()))
        })?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::execution_failed(e.to_string()))?
        {
            let kind = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => "dir",
                Ok(ft) if ft.is_symlink() => "symlink",
                _ => "file",
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        ToolResult::json(&entries).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl ToolSpec for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a workspace file with the given content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.resolve_path(required_str(&input, "path")?)?;
        let content = required_str(&input, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::execution_failed(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| {
            ToolError::execution_failed(format!("Failed to write {}: {e}", path.display()))
        })?;

        Ok(ToolResult::success(format!(
            "Wrote {} bytes to {}",
            content.len(),
            context.relative(&path)
        )))
    }
}

pub struct EditFileTool;

#[async_trait]
impl ToolSpec for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &'static str {
        "Replace an exact snippet in a workspace file. The snippet must match once unless replace_all is set."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "search": { "type": "string", "description": "Exact text to find" },
                "replace": { "type": "string", "description": "Replacement text" },
                "replace_all": { "type": "boolean", "description": "Replace every occurrence (default false)" }
            },
            "required": ["path", "search", "replace"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.resolve_path(required_str(&input, "path")?)?;
        let search = required_str(&input, "search")?;
        let replace = required_str(&input, "replace")?;
        let replace_all = optional_bool(&input, "replace_all", false);

        if search.is_empty() {
            return Err(ToolError::invalid_input("search text cannot be empty"));
        }

        let original = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::execution_failed(format!("Failed to read {}: {e}", path.display()))
        })?;
        let count = original.matches(search).count();
        let updated = match count {
            0 => {
                return Ok(ToolResult::error(format!(
                    "Search text not found in {}",
                    context.relative(&path)
                )));
            }
            1 => original.replacen(search, replace, 1),
            _ if replace_all => original.replace(search, replace),
            n => {
                return Ok(ToolResult::error(format!(
                    "Search text matches {n} times in {}; add context or set replace_all",
                    context.relative(&path)
                )));
            }
        };

        tokio::fs::write(&path, updated).await.map_err(|e| {
            ToolError::execution_failed(format!("Failed to write {}: {e}", path.display()))
        })?;
        Ok(ToolResult::success(format!(
            "Replaced {count} occurrence(s) in {}",
            context.relative(&path)
        )))
    }
}
