//! System prompt assembly.

use std::path::Path;

use serde_json::json;

use crate::core::tool_parser::render_tool_call;
use crate::tools::ToolRegistry;

// Prompt files loaded at compile time
pub const BASE_PROMPT: &str = include_str!("prompts/base.txt");

/// How the model must write a tool call, with a worked example.
#[must_use]
pub fn tool_call_instructions() -> String {
    let example = render_tool_call("read_file", &json!({"path": "src/main.rs"}));
    format!(
        "## Tool Calls\n\n\
         To call a tool, write exactly one block in this form anywhere in your reply:\n\n\
         {example}\n\n\
         The arguments must be a JSON object matching the tool's parameters. \
         Anything you write after the block is discarded."
    )
}

/// Build the full system prompt: base text, workspace, call format, tool list.
#[must_use]
pub fn build_system_prompt(base: &str, tools: &ToolRegistry, workspace: &Path) -> String {
    let mut prompt = format!(
        "{}\n\n## Workspace\n\n{}",
        base.trim(),
        workspace.display()
    );
    if tools.is_empty() {
        return prompt;
    }
    let definitions =
        serde_json::to_string_pretty(&tools.definitions()).unwrap_or_else(|_| "[]".to_string());
    prompt.push_str("\n\n");
    prompt.push_str(&tool_call_instructions());
    prompt.push_str("\n\n## Available Tools\n\n```json\n");
    prompt.push_str(&definitions);
    prompt.push_str("\n```");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tool_parser::parse_response;
    use crate::tools::{ToolContext, ToolRegistry};

    #[test]
    fn example_call_parses_as_a_tool_call() {
        let instructions = tool_call_instructions();
        let parsed = parse_response(&instructions);
        let (name, params) = parsed.tool_call().expect("example call");
        assert_eq!(name, "read_file");
        assert_eq!(params["path"], "src/main.rs");
    }

    #[test]
    fn prompt_lists_registered_tools() {
        let registry = ToolRegistry::with_defaults(ToolContext::new("/work"));
        let prompt = build_system_prompt(BASE_PROMPT, &registry, Path::new("/work"));
        assert!(prompt.starts_with("You are a coding assistant"));
        assert!(prompt.contains("/work"));
        for name in registry.names() {
            assert!(prompt.contains(name), "missing {name}");
        }
    }

    #[test]
    fn empty_registry_omits_the_tool_section() {
        let registry = ToolRegistry::builder(ToolContext::new("/work")).build();
        let prompt = build_system_prompt("Base.", &registry, Path::new("/work"));
        assert!(!prompt.contains("## Tool Calls"));
    }
}
