//! write_file - Create or overwrite a file

use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::ToolInvocation;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// File writing tool
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Overwrites existing files."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::WriteFile(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::WriteFile(args) = invocation else {
            anyhow::bail!("write_file cannot run {}", invocation.tool_name());
        };

        let resolved = ctx.resolve_path(&args.path)?;
        if resolved.is_dir() {
            return Ok(ToolOutput::error(format!("{} is a directory", args.path)));
        }

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        tokio::fs::write(&resolved, &args.content)
            .await
            .with_context(|| format!("Failed to write file: {}", args.path))?;

        tracing::info!(
            "Wrote {} bytes to {}",
            args.content.len(),
            resolved.display()
        );

        Ok(ToolOutput::success(format!(
            "Wrote {} bytes to {}",
            args.content.len(),
            ctx.display_path(&resolved)
        ))
        .with_metadata(serde_json::json!({ "bytes": args.content.len() })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_context;
    use crate::tools::invocation::WriteFileArgs;

    fn write(path: &str, content: &str) -> ToolInvocation {
        ToolInvocation::WriteFile(WriteFileArgs {
            path: path.to_string(),
            content: content.to_string(),
        })
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = test_context(temp_dir.path()).await;

        let result = WriteFileTool
            .execute(&write("src/deep/new.rs", "fn main() {}\n"), &ctx)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.content.contains("src/deep/new.rs"));
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("src/deep/new.rs")).unwrap(),
            "fn main() {}\n"
        );
    }

    #[tokio::test]
    async fn test_write_outside_workdir_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = test_context(temp_dir.path()).await;

        assert!(WriteFileTool
            .execute(&write("../escape.txt", "x"), &ctx)
            .await
            .is_err());
    }
}
