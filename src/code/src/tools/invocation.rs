//! Typed tool invocations
//!
//! Every tool call the model makes is turned into one of these variants
//! before any permission check or execution happens.

use crate::checkpoint::OperationKind;
use crate::permissions::PermissionCategory;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    pub path: String,
    /// Zero-based first line
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditFileArgs {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveFileArgs {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListDirectoryArgs {
    #[serde(default = "default_list_path")]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

fn default_list_path() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteShellArgs {
    pub command: String,
    /// Timeout in seconds, overriding the sandbox default
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// The closed set of actions a model can request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolInvocation {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    EditFile(EditFileArgs),
    DeleteFile(DeleteFileArgs),
    MoveFile(MoveFileArgs),
    ListDirectory(ListDirectoryArgs),
    ExecuteShell(ExecuteShellArgs),
}

impl ToolInvocation {
    /// Registered tool name handling this variant
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolInvocation::ReadFile(_) => "read_file",
            ToolInvocation::WriteFile(_) => "write_file",
            ToolInvocation::EditFile(_) => "edit_file",
            ToolInvocation::DeleteFile(_) => "delete_file",
            ToolInvocation::MoveFile(_) => "move_file",
            ToolInvocation::ListDirectory(_) => "list_directory",
            ToolInvocation::ExecuteShell(_) => "execute_shell",
        }
    }

    /// Every (category, subject) pair that must be allowed before running.
    /// A move needs write access at both ends.
    pub fn permission_subjects(&self) -> Vec<(PermissionCategory, &str)> {
        match self {
            ToolInvocation::ReadFile(a) => vec![(PermissionCategory::FileRead, a.path.as_str())],
            ToolInvocation::ListDirectory(a) => {
                vec![(PermissionCategory::FileRead, a.path.as_str())]
            }
            ToolInvocation::WriteFile(a) => vec![(PermissionCategory::FileWrite, a.path.as_str())],
            ToolInvocation::EditFile(a) => vec![(PermissionCategory::FileWrite, a.path.as_str())],
            ToolInvocation::DeleteFile(a) => {
                vec![(PermissionCategory::FileWrite, a.path.as_str())]
            }
            ToolInvocation::MoveFile(a) => vec![
                (PermissionCategory::FileWrite, a.source.as_str()),
                (PermissionCategory::FileWrite, a.destination.as_str()),
            ],
            ToolInvocation::ExecuteShell(a) => {
                vec![(PermissionCategory::ShellExecute, a.command.as_str())]
            }
        }
    }

    /// Kind of operation recorded in the checkpoint log, `None` for reads.
    pub fn operation_kind(&self) -> Option<OperationKind> {
        match self {
            ToolInvocation::ReadFile(_) | ToolInvocation::ListDirectory(_) => None,
            ToolInvocation::WriteFile(_) | ToolInvocation::EditFile(_) => {
                Some(OperationKind::Write)
            }
            ToolInvocation::DeleteFile(_) => Some(OperationKind::Delete),
            ToolInvocation::MoveFile(_) => Some(OperationKind::Move),
            ToolInvocation::ExecuteShell(_) => Some(OperationKind::Execute),
        }
    }

    pub fn is_mutating(&self) -> bool {
        self.operation_kind().is_some()
    }

    /// Primary path or command, as recorded in the operation log
    pub fn target(&self) -> &str {
        match self {
            ToolInvocation::ReadFile(a) => &a.path,
            ToolInvocation::WriteFile(a) => &a.path,
            ToolInvocation::EditFile(a) => &a.path,
            ToolInvocation::DeleteFile(a) => &a.path,
            ToolInvocation::MoveFile(a) => &a.source,
            ToolInvocation::ListDirectory(a) => &a.path,
            ToolInvocation::ExecuteShell(a) => &a.command,
        }
    }

    /// Destination of a move
    pub fn destination(&self) -> Option<&str> {
        match self {
            ToolInvocation::MoveFile(a) => Some(&a.destination),
            _ => None,
        }
    }

    /// One-line description for prompts and logs
    pub fn summary(&self) -> String {
        match self {
            ToolInvocation::MoveFile(a) => {
                format!("{} {} -> {}", self.tool_name(), a.source, a.destination)
            }
            ToolInvocation::ExecuteShell(a) => format!("{}: {}", self.tool_name(), a.command),
            other => format!("{} {}", other.tool_name(), other.target()),
        }
    }
}
