//! Core types for the tool system

use super::ToolInvocation;
use crate::sandbox::Sandbox;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tool execution context
///
/// Gives tools the sandbox that confines their paths and runs their commands.
#[derive(Debug, Clone)]
pub struct ToolContext {
    sandbox: Arc<Sandbox>,
}

impl ToolContext {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn workdir(&self) -> &Path {
        self.sandbox.workdir()
    }

    /// Resolve a tool path inside the isolation boundary
    pub fn resolve_path(&self, path: &str) -> keel_core::Result<PathBuf> {
        self.sandbox.resolve_path(path)
    }

    /// Path shown back to the model
    pub fn display_path(&self, path: &Path) -> String {
        self.sandbox.relative(path).display().to_string()
    }
}

/// Tool execution output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Output content shown to the model
    pub content: String,
    /// Whether execution was successful
    pub success: bool,
    /// Optional metadata (exit code, byte counts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Handler for one tool name
///
/// Arguments reach `parse` only after they validated against `parameters`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must be unique within registry)
    fn name(&self) -> &str;

    /// Human-readable description for LLM
    fn description(&self) -> &str;

    /// JSON Schema for tool parameters
    fn parameters(&self) -> serde_json::Value;

    /// Build the typed invocation from schema-valid arguments
    fn parse(&self, args: serde_json::Value) -> anyhow::Result<ToolInvocation>;

    /// Execute an invocation previously produced by `parse`
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_output_success() {
        let output = ToolOutput::success("Hello");
        assert!(output.success);
        assert_eq!(output.content, "Hello");
    }

    #[test]
    fn test_tool_output_error() {
        let output = ToolOutput::error("Failed").with_metadata(serde_json::json!({"exit_code": 1}));
        assert!(!output.success);
        assert_eq!(output.metadata.unwrap()["exit_code"], 1);
    }
}
