//! Shell command execution in the workspace.
//!
//! Commands run through `sh -c` with a timeout. A short allow-list of
//! read-only commands is exempt from approval; everything else is a
//! `command`-category call the gate will ask about.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_u64, required_str};
use crate::approval::ToolCategory;

/// Maximum output size before truncation.
const MAX_OUTPUT_SIZE: usize = 30_000;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_MS: u64 = 600_000;

const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "pwd", "cat", "head", "wc", "echo", "which", "whoami", "date", "tree", "file", "stat",
];
const READ_ONLY_GIT_SUBCOMMANDS: &[&str] = &["status", "diff", "log", "show", "rev-parse"];

/// Flags that make an otherwise read-only command write a file.
fn writes_output(arg: &str) -> bool {
    arg.starts_with("--output") || arg.starts_with("-o") || arg == "--ext-diff"
}

/// Arguments that name something outside the workspace.
fn escapes_workspace(arg: &str) -> bool {
    let value = arg.split_once('=').map_or(arg, |(_, value)| value);
    value.starts_with('/')
        || value.starts_with('~')
        || value.split(['/', '\\']).any(|part| part == "..")
}

/// Whether `command` is a single allow-listed invocation with no shell plumbing
/// whose arguments neither write files nor leave the workspace.
#[must_use]
pub fn is_read_only_command(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return false;
    }
    // Redirection, pipes, chaining, and substitution can all write.
    if trimmed
        .chars()
        .any(|c| matches!(c, '|' | '&' | ';' | '>' | '<' | '`' | '$' | '\n'))
    {
        return false;
    }
    let Some(words) = shlex::split(trimmed) else {
        return false;
    };
    let (allowed, args) = match words.as_slice() {
        [] => return false,
        [git, sub, args @ ..] if git == "git" => {
            (READ_ONLY_GIT_SUBCOMMANDS.contains(&sub.as_str()), args)
        }
        [program, args @ ..] => (READ_ONLY_COMMANDS.contains(&program.as_str()), args),
    };
    allowed
        && !args
            .iter()
            .any(|arg| writes_output(arg) || escapes_workspace(arg))
}

fn char_boundary_at_or_before(text: &str, max_bytes: usize) -> usize {
    if max_bytes >= text.len() {
        return text.len();
    }
    let mut idx = max_bytes;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_SIZE {
        return output.to_string();
    }
    let cut = char_boundary_at_or_before(output, MAX_OUTPUT_SIZE);
    let omitted = output.len() - cut;
    format!(
        "{}...\n\n[Output truncated at {MAX_OUTPUT_SIZE} bytes. {omitted} bytes omitted.]",
        &output[..cut]
    )
}

/// Tool for executing shell commands.
pub struct ExecShellTool;

#[async_trait]
impl ToolSpec for ExecShellTool {
    fn name(&self) -> &'static str {
        "exec_shell"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command in the workspace directory. Returns stdout, stderr, and exit code."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (default: 120000, max: 600000)"
                }
            },
            "required": ["command"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Command
    }

    fn requires_approval(&self, input: &Value) -> Option<bool> {
        let command = input.get("command").and_then(Value::as_str)?;
        is_read_only_command(command).then_some(false)
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = required_str(&input, "command")?;
        let timeout_ms = optional_u64(&input, "timeout_ms", DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
        let started = Instant::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&context.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::execution_failed(format!("Failed to execute: {command}: {e}")))?;

        let output = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => {
                result.map_err(|e| ToolError::execution_failed(format!("Shell execution failed: {e}")))?
            }
            Err(_) => {
                return Err(ToolError::Timeout {
                    seconds: timeout_ms.div_ceil(1000),
                });
            }
        };

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();
        let success = output.status.success();

        let content = if success {
            if stdout.is_empty() && stderr.is_empty() {
                "(no output)".to_string()
            } else if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n\nSTDERR:\n{stderr}")
            }
        } else {
            format!("Command failed (exit code: {exit_code:?})\n\nSTDOUT:\n{stdout}\n\nSTDERR:\n{stderr}")
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(ToolResult {
            content,
            success,
            metadata: Some(json!({
                "exit_code": exit_code,
                "duration_ms": duration_ms,
            })),
        })
    }
}
