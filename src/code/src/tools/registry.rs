//! Tool Registry
//!
//! Name → handler table. Arguments are checked against the handler's JSON
//! schema before they are turned into a typed invocation.

use super::types::{Tool, ToolContext, ToolOutput};
use super::ToolInvocation;
use crate::llm::ToolDefinition;
use keel_core::{KeelError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Tool registry for managing all available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registering tool: {}", name);
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.insert(name, tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Tool definitions for the model, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate model-supplied arguments and build the typed invocation.
    pub fn parse(&self, name: &str, args: &serde_json::Value) -> Result<ToolInvocation> {
        let tool = self
            .get(name)
            .ok_or_else(|| KeelError::ToolValidation(format!("Unknown tool: {name}")))?;

        let schema = tool.parameters();
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            KeelError::ToolValidation(format!("invalid schema for tool {name}: {e}"))
        })?;
        if !validator.is_valid(args) {
            let messages = validator
                .iter_errors(args)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(KeelError::ToolValidation(format!(
                "invalid arguments for {name}: {}",
                messages.join("; ")
            )));
        }

        tool.parse(args.clone())
            .map_err(|e| KeelError::ToolValidation(format!("invalid arguments for {name}: {e}")))
    }

    /// Execute a parsed invocation with its registered handler
    pub async fn execute(
        &self,
        invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let name = invocation.tool_name();
        match self.get(name) {
            Some(tool) => tool.execute(invocation, ctx).await,
            None => Ok(ToolOutput::error(format!("Unknown tool: {name}"))),
        }
    }
}
