//! execute_shell - Run a shell command through the sandbox

use crate::sandbox::MAX_COMMAND_TIMEOUT_SECS;
use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::ToolInvocation;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Shell command execution tool
pub struct ExecuteShellTool;

#[async_trait]
impl Tool for ExecuteShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory. Use for builds, tests and other project commands."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The command to execute with sh -c"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_COMMAND_TIMEOUT_SECS,
                    "description": "Timeout in seconds (default from sandbox settings)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::ExecuteShell(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::ExecuteShell(args) = invocation else {
            anyhow::bail!("execute_shell cannot run {}", invocation.tool_name());
        };

        let timeout = args.timeout.map(Duration::from_secs);
        let result = ctx.sandbox().run_shell(&args.command, timeout).await?;

        let mut content = result.output;
        if result.exit_code != 0 && !result.timed_out {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&format!("[Exit code: {}]", result.exit_code));
        }
        if content.is_empty() {
            content = "(no output)".to_string();
        }

        let metadata = serde_json::json!({
            "exit_code": result.exit_code,
            "timed_out": result.timed_out,
            "truncated": result.truncated,
        });
        let output = if result.exit_code == 0 && !result.timed_out {
            ToolOutput::success(content)
        } else {
            ToolOutput::error(content)
        };
        Ok(output.with_metadata(metadata))
    }
}
