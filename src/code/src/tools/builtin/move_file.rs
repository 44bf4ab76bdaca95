//! move_file - Rename or move a file within the working directory

use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::ToolInvocation;
use anyhow::{Context, Result};
use async_trait::async_trait;

pub struct MoveFileTool;

#[async_trait]
impl Tool for MoveFileTool {
    fn name(&self) -> &str {
        "move_file"
    }

    fn description(&self) -> &str {
        "Move or rename a file. Fails if the destination already exists."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "source": {
                    "type": "string",
                    "description": "Existing file path"
                },
                "destination": {
                    "type": "string",
                    "description": "New file path"
                }
            },
            "required": ["source", "destination"],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::MoveFile(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::MoveFile(args) = invocation else {
            anyhow::bail!("move_file cannot run {}", invocation.tool_name());
        };

        let source = ctx.resolve_path(&args.source)?;
        let destination = ctx.resolve_path(&args.destination)?;

        if !source.is_file() {
            return Ok(ToolOutput::error(format!("File not found: {}", args.source)));
        }
        if destination.exists() {
            return Ok(ToolOutput::error(format!(
                "Destination already exists: {}",
                args.destination
            )));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        tokio::fs::rename(&source, &destination)
            .await
            .with_context(|| format!("Failed to move {} to {}", args.source, args.destination))?;

        Ok(ToolOutput::success(format!(
            "Moved {} -> {}",
            ctx.display_path(&source),
            ctx.display_path(&destination)
        )))
    }
}
