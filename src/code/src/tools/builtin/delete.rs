//! delete_file - Remove a file

use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::ToolInvocation;
use anyhow::{Context, Result};
use async_trait::async_trait;

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Directories are not removed."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to delete"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::DeleteFile(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::DeleteFile(args) = invocation else {
            anyhow::bail!("delete_file cannot run {}", invocation.tool_name());
        };

        let resolved = ctx.resolve_path(&args.path)?;
        if resolved.is_dir() {
            return Ok(ToolOutput::error(format!(
                "{} is a directory; only files can be deleted",
                args.path
            )));
        }
        if !resolved.exists() {
            return Ok(ToolOutput::error(format!("File not found: {}", args.path)));
        }

        tokio::fs::remove_file(&resolved)
            .await
            .with_context(|| format!("Failed to delete file: {}", args.path))?;

        Ok(ToolOutput::success(format!(
            "Deleted {}",
            ctx.display_path(&resolved)
        )))
    }
}
