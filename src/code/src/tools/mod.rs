//! Tool system
//!
//! Model tool calls are closed-set, typed invocations:
//!
//! ```text
//! (name, json args)
//!   → ToolRegistry::parse    schema validation + typed ToolInvocation
//!   → permission gate        (agent loop)
//!   → ToolExecutor::execute  handler runs inside the Sandbox
//! ```

mod builtin;
pub mod invocation;
mod registry;
mod types;

pub use builtin::register_builtin_tools;
pub use invocation::ToolInvocation;
pub use registry::ToolRegistry;
pub use types::{Tool, ToolContext, ToolOutput};

use crate::llm::ToolDefinition;
use crate::sandbox::Sandbox;
use keel_core::Result;
use std::sync::Arc;

/// Maximum lines to read from a file
pub const MAX_READ_LINES: usize = 2000;

/// Maximum line length before truncation
pub const MAX_LINE_LENGTH: usize = 2000;

/// Runs validated invocations at the sandbox's isolation level.
///
/// The executor makes no policy decisions; callers check permissions first.
pub struct ToolExecutor {
    registry: ToolRegistry,
    context: ToolContext,
}

impl ToolExecutor {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry);
        tracing::debug!(
            "ToolExecutor initialized in {}",
            sandbox.workdir().display()
        );
        Self {
            registry,
            context: ToolContext::new(sandbox),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        self.context.sandbox()
    }

    /// Get the tool registry for additional registrations
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Validate a model tool call into a typed invocation
    pub fn parse(&self, name: &str, args: &serde_json::Value) -> Result<ToolInvocation> {
        self.registry.parse(name, args)
    }

    /// Execute an invocation. Failures become error outputs for the model.
    pub async fn execute(&self, invocation: &ToolInvocation) -> ToolOutput {
        let name = invocation.tool_name();
        tracing::info!("Executing tool: {}", invocation.summary());

        match self.registry.execute(invocation, &self.context).await {
            Ok(output) => {
                tracing::info!("Tool {} completed with success={}", name, output.success);
                output
            }
            Err(e) => {
                tracing::warn!("Tool {} failed: {:#}", name, e);
                ToolOutput::error(format!("{e:#}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{KeelError, SandboxMode, SandboxSettings};

    async fn executor(dir: &std::path::Path) -> ToolExecutor {
        let sandbox = Sandbox::new(SandboxMode::Basic, SandboxSettings::default(), dir).await;
        ToolExecutor::new(Arc::new(sandbox))
    }

    #[tokio::test]
    async fn test_parse_then_execute() {
        let temp_dir = tempfile::tempdir().unwrap();
        let executor = executor(temp_dir.path()).await;

        let invocation = executor
            .parse(
                "write_file",
                &serde_json::json!({"path": "hello.txt", "content": "hi"}),
            )
            .unwrap();
        let output = executor.execute(&invocation).await;
        assert!(output.success);
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("hello.txt")).unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn test_schema_violation_is_validation_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let executor = executor(temp_dir.path()).await;

        let err = executor
            .parse("write_file", &serde_json::json!({"path": "a.txt"}))
            .unwrap_err();
        assert!(matches!(err, KeelError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn test_sandbox_violation_becomes_error_output() {
        let temp_dir = tempfile::tempdir().unwrap();
        let executor = executor(temp_dir.path()).await;

        let invocation = executor
            .parse("read_file", &serde_json::json!({"path": "/etc/hostname"}))
            .unwrap();
        let output = executor.execute(&invocation).await;
        assert!(!output.success);
        assert!(output.content.contains("outside the working directory"));
    }
}
