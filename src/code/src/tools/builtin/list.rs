//! list_directory - List directory contents

use crate::tools::types::{Tool, ToolContext, ToolOutput};
use crate::tools::ToolInvocation;
use anyhow::Result;
use async_trait::async_trait;

/// Upper bound on listed entries
const MAX_ENTRIES: usize = 1000;

/// Directory listing tool
pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the contents of a directory. Directories end with '/'. Recursive listings honour .gitignore."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path to list (default: working directory)"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Walk subdirectories (default: false)"
                }
            },
            "required": [],
            "additionalProperties": false
        })
    }

    fn parse(&self, args: serde_json::Value) -> Result<ToolInvocation> {
        Ok(ToolInvocation::ListDirectory(serde_json::from_value(args)?))
    }

    async fn execute(&self, invocation: &ToolInvocation, ctx: &ToolContext) -> Result<ToolOutput> {
        let ToolInvocation::ListDirectory(args) = invocation else {
            anyhow::bail!("list_directory cannot run {}", invocation.tool_name());
        };

        let root = ctx.resolve_path(&args.path)?;
        if !root.is_dir() {
            return Ok(ToolOutput::error(format!("{} is not a directory", args.path)));
        }

        let recursive = args.recursive;
        let walk_root = root.clone();
        let (entries, truncated) = tokio::task::spawn_blocking(move || {
            let mut builder = ignore::WalkBuilder::new(&walk_root);
            builder.hidden(false).filter_entry(|e| e.file_name() != ".git");
            if !recursive {
                builder.max_depth(Some(1));
            }

            let mut entries = Vec::new();
            let mut truncated = false;
            for entry in builder.build().flatten() {
                if entry.depth() == 0 {
                    continue;
                }
                if entries.len() >= MAX_ENTRIES {
                    truncated = true;
                    break;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&walk_root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                entries.push(if is_dir { format!("{relative}/") } else { relative });
            }
            entries.sort();
            (entries, truncated)
        })
        .await?;

        if entries.is_empty() {
            return Ok(ToolOutput::success(format!("{} is empty", args.path)));
        }

        let mut output = entries.join("\n");
        if truncated {
            output.push_str(&format!("\n\n[Listing truncated at {} entries]", MAX_ENTRIES));
        }
        Ok(ToolOutput::success(output))
    }
}
