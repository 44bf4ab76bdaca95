//! Operation log kept between checkpoints.
//!
//! Each mutating tool call is logged before it runs, together with the
//! pre-image needed to revert it. The log is replaced wholesale on every
//! change (`operations.json`, atomic write).

use crate::store;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Write,
    Delete,
    Move,
    Execute,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Write => write!(f, "write"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::Move => write!(f, "move"),
            OperationKind::Execute => write!(f, "execute"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Active,
    Undone,
}

/// State of a path before the operation touched it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backup {
    /// Nothing existed at the path
    Absent,
    /// Original bytes saved in the undo directory under `blob`
    Saved { blob: String },
    /// Working tree captured by the backend (shell commands)
    Tree { tree: String },
}

/// One recorded mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    /// Path relative to the working directory, or the command for `execute`
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: OperationStatus,
    /// The approval gate was bypassed with `--auto-approve`
    #[serde(default)]
    pub auto_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub backup: Backup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_backup: Option<Backup>,
}

impl Operation {
    pub fn is_active(&self) -> bool {
        self.status == OperationStatus::Active
    }
}

/// Persistent operation log plus its pre-image blobs
#[derive(Debug, Clone)]
pub(crate) struct OperationLog {
    path: PathBuf,
    undo_dir: PathBuf,
}

impl OperationLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("operations.json"),
            undo_dir: dir.join("undo"),
        }
    }

    pub fn load(&self) -> Result<Vec<Operation>> {
        Ok(store::read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, operations: &[Operation]) -> Result<()> {
        store::write_json_atomic(&self.path, &operations)
    }

    pub fn append(&self, operation: Operation) -> Result<()> {
        let mut operations = self.load()?;
        operations.push(operation);
        self.save(&operations)
    }

    /// Drop every entry and saved blob.
    pub fn clear(&self) -> Result<()> {
        if self.undo_dir.exists() {
            std::fs::remove_dir_all(&self.undo_dir)
                .with_context(|| format!("remove {}", self.undo_dir.display()))?;
        }
        self.save(&[])
    }

    /// Save the current state of `path` under `blob` and describe it.
    pub fn capture(&self, path: &Path, blob: &str) -> Result<Backup> {
        // Tools only mutate files; a directory at the path is left alone
        if path.is_dir() {
            return Ok(Backup::Absent);
        }
        match std::fs::read(path) {
            Ok(bytes) => {
                store::write_atomic(&self.undo_dir.join(blob), &bytes)?;
                Ok(Backup::Saved {
                    blob: blob.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Backup::Absent),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Put `path` back into the state described by a file backup.
    pub fn apply(&self, path: &Path, backup: &Backup) -> Result<()> {
        match backup {
            Backup::Absent if path.is_dir() => Ok(()),
            Backup::Absent => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
            },
            Backup::Saved { blob } => {
                let blob_path = self.undo_dir.join(blob);
                let bytes = std::fs::read(&blob_path)
                    .with_context(|| format!("read backup {}", blob_path.display()))?;
                store::write_atomic(path, &bytes)
            }
            Backup::Tree { .. } => anyhow::bail!("tree backups are restored by the backend"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_operation_serde_shape() {
        let op = Operation {
            id: "op-1".to_string(),
            kind: OperationKind::Write,
            file: "src/main.rs".to_string(),
            destination: None,
            timestamp: Utc::now(),
            status: OperationStatus::Active,
            auto_approved: true,
            tool_call_id: Some("call_1".to_string()),
            backup: Backup::Absent,
            destination_backup: None,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "write");
        assert_eq!(json["status"], "active");
        assert_eq!(json["backup"]["type"], "absent");
        assert!(json.get("destination").is_none());
    }

    #[test]
    fn test_capture_and_apply() {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::new(&dir.path().join("state"));
        let file = dir.path().join("a.txt");

        assert_eq!(log.capture(&file, "b1").unwrap(), Backup::Absent);

        std::fs::write(&file, "original").unwrap();
        let saved = log.capture(&file, "b2").unwrap();
        std::fs::write(&file, "modified").unwrap();
        log.apply(&file, &saved).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original");

        log.apply(&file, &Backup::Absent).unwrap();
        assert!(!file.exists());
        // Already gone is fine
        log.apply(&file, &Backup::Absent).unwrap();
    }

    #[test]
    fn test_clear_drops_entries_and_blobs() {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::new(dir.path());
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        let backup = log.capture(&file, "blob").unwrap();
        log.append(Operation {
            id: "op".to_string(),
            kind: OperationKind::Delete,
            file: "a.txt".to_string(),
            destination: None,
            timestamp: Utc::now(),
            status: OperationStatus::Active,
            auto_approved: false,
            tool_call_id: None,
            backup,
            destination_backup: None,
        })
        .unwrap();
        assert_eq!(log.load().unwrap().len(), 1);

        log.clear().unwrap();
        assert!(log.load().unwrap().is_empty());
        assert!(!dir.path().join("undo").exists());
    }
}
