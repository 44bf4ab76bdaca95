//! edit_file - Edit files with exact string replacement

use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::ToolInvocation;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// File editing tool with string replacement
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing a specific string with another. The old_string must be unique in the file unless replace_all is true."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The exact string to replace (must be unique unless replace_all=true)"
                },
                "new_string": {
                    "type": "string",
                    "description": "The string to replace it with"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false)"
                }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::EditFile(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::EditFile(args) = invocation else {
            anyhow::bail!("edit_file cannot run {}", invocation.tool_name());
        };

        let resolved = ctx.resolve_path(&args.path)?;
        if !resolved.is_file() {
            return Ok(ToolOutput::error(format!("File not found: {}", args.path)));
        }

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .with_context(|| format!("Failed to read file: {}", args.path))?;

        let count = content.matches(args.old_string.as_str()).count();
        if count == 0 {
            return Ok(ToolOutput::error(format!(
                "String not found in {}: {:?}",
                args.path, args.old_string
            )));
        }
        if count > 1 && !args.replace_all {
            return Ok(ToolOutput::error(format!(
                "Found {} occurrences of the string in {}. Use replace_all=true to replace all, or provide more context to make it unique.",
                count, args.path
            )));
        }

        let new_content = if args.replace_all {
            content.replace(&args.old_string, &args.new_string)
        } else {
            content.replacen(&args.old_string, &args.new_string, 1)
        };

        tokio::fs::write(&resolved, &new_content)
            .await
            .with_context(|| format!("Failed to write file: {}", args.path))?;

        let display = ctx.display_path(&resolved);
        Ok(ToolOutput::success(generate_diff(&content, &new_content, &display))
            .with_metadata(serde_json::json!({ "replacements": count })))
    }
}

/// Unified diff between old and new content
fn generate_diff(old: &str, new: &str, file_path: &str) -> String {
    similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file_path}"), &format!("b/{file_path}"))
        .to_string()
}
