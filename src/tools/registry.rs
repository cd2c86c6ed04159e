//! Name-indexed tool registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec};
use crate::approval::{ApprovalContext, ToolCategory};

/// Holds the tools available to a run and dispatches calls by name.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn ToolSpec>>,
    context: ToolContext,
}

impl ToolRegistry {
    #[must_use]
    pub fn builder(context: ToolContext) -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            tools: BTreeMap::new(),
            context,
        }
    }

    /// Every built-in tool, rooted at `context.workspace`.
    #[must_use]
    pub fn with_defaults(context: ToolContext) -> Self {
        Self::builder(context)
            .with_file_tools()
            .with_search_tools()
            .with_shell_tools()
            .build()
    }

    #[must_use]
    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolSpec>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// What the approval gate needs to know about a call, or `None` when the
    /// tool is unknown.
    #[must_use]
    pub fn approval_context(&self, name: &str, input: &Value) -> Option<ApprovalContext> {
        let tool = self.tools.get(name)?;
        Some(ApprovalContext {
            category: tool.category(),
            requires_approval: tool.requires_approval(input),
        })
    }

    /// Run a tool by name.
    pub async fn invoke(&self, name: &str, input: Value) -> Result<ToolResult, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::not_available(format!(
                "unknown tool '{name}'. Available tools: {}",
                self.names().join(", ")
            )));
        };
        tool.execute(input, &self.context).await
    }

    /// Tool metadata as a JSON array, for the system prompt.
    #[must_use]
    pub fn definitions(&self) -> Value {
        Value::Array(
            self.tools
                .values()
                .map(|tool| {
                    json!({
                        "name": tool.name(),
                        "description": tool.description(),
                        "category": tool.category(),
                        "parameters": tool.input_schema(),
                    })
                })
                .collect(),
        )
    }

    /// Names grouped by category, for status output.
    #[must_use]
    pub fn names_in(&self, category: ToolCategory) -> Vec<&'static str> {
        self.tools
            .values()
            .filter(|tool| tool.category() == category)
            .map(|tool| tool.name())
            .collect()
    }
}

pub struct ToolRegistryBuilder {
    tools: BTreeMap<&'static str, Arc<dyn ToolSpec>>,
    context: ToolContext,
}

impl ToolRegistryBuilder {
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn ToolSpec>) -> Self {
        self.tools.insert(tool.name(), tool);
        self
    }

    #[must_use]
    pub fn with_file_tools(self) -> Self {
        use super::file::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
        self.with_tool(Arc::new(ReadFileTool))
            .with_tool(Arc::new(ListDirTool))
            .with_tool(Arc::new(WriteFileTool))
            .with_tool(Arc::new(EditFileTool))
    }

    #[must_use]
    pub fn with_search_tools(self) -> Self {
        self.with_tool(Arc::new(super::search::GrepFilesTool))
    }

    #[must_use]
    pub fn with_shell_tools(self) -> Self {
        self.with_tool(Arc::new(super::shell::ExecShellTool))
    }

    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: self.tools,
            context: self.context,
        }
    }
}
