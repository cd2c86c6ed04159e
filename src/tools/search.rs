//! `grep_files`: regex search across the workspace, honoring ignore files.

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::RegexBuilder;
use serde_json::{Value, json};

use super::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, optional_str, optional_u64,
    required_str,
};
use crate::approval::ToolCategory;

const DEFAULT_MAX_MATCHES: u64 = 200;
const MAX_LINE_CHARS: usize = 300;

pub struct GrepFilesTool;

#[async_trait]
impl ToolSpec for GrepFilesTool {
    fn name(&self) -> &'static str {
        "grep_files"
    }

    fn description(&self) -> &'static str {
        "Search workspace files for a regular expression. Returns path:line: text matches."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression" },
                "path": { "type": "string", "description": "Directory or file to search (default: workspace)" },
                "case_insensitive": { "type": "boolean" },
                "max_matches": { "type": "integer", "description": "Stop after this many matches (default 200)" }
            },
            "required": ["pattern"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&input, "pattern")?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(optional_bool(&input, "case_insensitive", false))
            .build()
            .map_err(|e| ToolError::invalid_input(format!("Invalid pattern: {e}")))?;
        let root = match optional_str(&input, "path") {
            Some(path) if !path.trim().is_empty() => context.resolve_path(path)?,
            _ => context.workspace.clone(),
        };
        let max_matches =
            usize::try_from(optional_u64(&input, "max_matches", DEFAULT_MAX_MATCHES)).unwrap_or(1);
        let context = context.clone();

        // Directory walking is blocking I/O.
        let (lines, truncated) = tokio::task::spawn_blocking(move || {
            let mut lines = Vec::new();
            let mut builder = WalkBuilder::new(&root);
            builder.hidden(true).follow_links(false).require_git(false);
            for entry in builder.build().flatten() {
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                for (idx, line) in text.lines().enumerate() {
                    if !regex.is_match(line) {
                        continue;
                    }
                    if lines.len() >= max_matches {
                        return (lines, true);
                    }
                    let shown = crate::utils::truncate_with_ellipsis(line.trim_end(), MAX_LINE_CHARS, "...");
                    lines.push(format!("{}:{}: {shown}", context.relative(entry.path()), idx + 1));
                }
            }
            (lines, false)
        })
        .await
        .map_err(|e| ToolError::execution_failed(format!("Search task failed: {e}")))?;

        if lines.is_empty() {
            return Ok(ToolResult::success("No matches found."));
        }
        let count = lines.len();
        let mut content = lines.join("\n");
        if truncated {
            content.push_str(&format!("\n[Stopped after {count} matches]"));
        }
        Ok(ToolResult::success(content).with_metadata(json!({
            "matches": count,
            "truncated": truncated,
        })))
    }
}
