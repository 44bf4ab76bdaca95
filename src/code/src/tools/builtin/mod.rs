//! Built-in tool implementations
//!
//! - read_file: Read file contents
//! - write_file: Write content to files
//! - edit_file: Edit files with string replacement
//! - delete_file: Remove a file
//! - move_file: Move or rename a file
//! - list_directory: List directory contents
//! - execute_shell: Execute shell commands

mod delete;
mod edit;
mod list;
mod move_file;
mod read;
mod shell;
mod write;

use super::registry::ToolRegistry;
use std::sync::Arc;

pub use delete::DeleteFileTool;
pub use edit::EditFileTool;
pub use list::ListDirectoryTool;
pub use move_file::MoveFileTool;
pub use read::ReadFileTool;
pub use shell::ExecuteShellTool;
pub use write::WriteFileTool;

/// Register all built-in tools with the registry
pub fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(EditFileTool));
    registry.register(Arc::new(DeleteFileTool));
    registry.register(Arc::new(MoveFileTool));
    registry.register(Arc::new(ListDirectoryTool));
    registry.register(Arc::new(ExecuteShellTool));

    tracing::debug!("Registered {} built-in tools", registry.len());
}

#[cfg(test)]
pub(crate) async fn test_context(dir: &std::path::Path) -> super::ToolContext {
    let sandbox = crate::sandbox::Sandbox::new(
        keel_core::SandboxMode::Basic,
        keel_core::SandboxSettings::default(),
        dir,
    )
    .await;
    super::ToolContext::new(Arc::new(sandbox))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtin_tools() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        register_builtin_tools(&registry);

        assert_eq!(registry.len(), 7);
        for name in [
            "read_file",
            "write_file",
            "edit_file",
            "delete_file",
            "move_file",
            "list_directory",
            "execute_shell",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_builtin_schemas_compile() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry);
        for definition in registry.definitions() {
            assert!(
                jsonschema::validator_for(&definition.parameters).is_ok(),
                "{}",
                definition.name
            );
        }
    }
}
