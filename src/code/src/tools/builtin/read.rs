//! read_file - Read file contents with line numbers

use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::{ToolInvocation, MAX_LINE_LENGTH, MAX_READ_LINES};
use anyhow::{Context, Result};
use async_trait::async_trait;

/// File reading tool
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the working directory. Returns line-numbered output."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Line number to start reading from (0-indexed, default: 0)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read (default: 2000)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::ReadFile(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::ReadFile(args) = invocation else {
            anyhow::bail!("read_file cannot run {}", invocation.tool_name());
        };

        let resolved = ctx.resolve_path(&args.path)?;
        tracing::debug!("Reading file: {}", resolved.display());

        if !resolved.exists() {
            return Ok(ToolOutput::error(format!("File not found: {}", args.path)));
        }
        if resolved.is_dir() {
            return Ok(ToolOutput::error(format!(
                "{} is a directory, not a file",
                args.path
            )));
        }

        let bytes = tokio::fs::read(&resolved)
            .await
            .with_context(|| format!("Failed to read file: {}", args.path))?;
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(ToolOutput::error(format!(
                "{} is not a UTF-8 text file",
                args.path
            )));
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start = args.offset.unwrap_or(0).min(total_lines);
        let end = (start + args.limit.unwrap_or(MAX_READ_LINES)).min(total_lines);

        // Format with line numbers (1-indexed like cat -n)
        let mut output = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            let line = if line.len() > MAX_LINE_LENGTH {
                let mut cut = MAX_LINE_LENGTH;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}...", &line[..cut])
            } else {
                line.to_string()
            };
            output.push_str(&format!("{:>6}\t{}\n", start + i + 1, line));
        }

        if end < total_lines {
            output.push_str(&format!(
                "\n[Showing lines {}-{} of {}. Use offset/limit for more.]",
                start + 1,
                end,
                total_lines
            ));
        }
        if output.is_empty() {
            output = format!("{} is empty", args.path);
        }

        Ok(ToolOutput::success(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_context;
    use crate::tools::invocation::ReadFileArgs;

    fn read(path: &str, offset: Option<usize>, limit: Option<usize>) -> ToolInvocation {
        ToolInvocation::ReadFile(ReadFileArgs {
            path: path.to_string(),
            offset,
            limit,
        })
    }

    #[tokio::test]
    async fn test_read_file_with_line_numbers() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let ctx = test_context(temp_dir.path()).await;

        let result = ReadFileTool.execute(&read("a.txt", None, None), &ctx).await.unwrap();
        assert!(result.success);
        assert!(result.content.contains("     1\tone"));
        assert!(result.content.contains("     3\tthree"));
    }

    #[tokio::test]
    async fn test_read_file_offset_limit() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "1\n2\n3\n4\n5\n").unwrap();
        let ctx = test_context(temp_dir.path()).await;

        let result = ReadFileTool
            .execute(&read("a.txt", Some(1), Some(2)), &ctx)
            .await
            .unwrap();
        assert!(result.content.contains("     2\t2"));
        assert!(!result.content.contains("     4\t4"));
        assert!(result.content.contains("Showing lines 2-3 of 5"));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = test_context(temp_dir.path()).await;

        let result = ReadFileTool.execute(&read("nope.txt", None, None), &ctx).await.unwrap();
        assert!(!result.success);
        assert!(result.content.contains("File not found"));
    }

    #[tokio::test]
    async fn test_read_outside_workdir_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = test_context(temp_dir.path()).await;

        assert!(ReadFileTool
            .execute(&read("../../etc/passwd", None, None), &ctx)
            .await
            .is_err());
    }
}
