//! Checkpoints and granular undo.
//!
//! A checkpoint is a full snapshot of the working tree taken by a
//! [`VersionControlBackend`]. Between checkpoints every mutating tool call is
//! recorded as an [`Operation`] so the most recent one can be reverted
//! without a full restore.
//!
//! All mutating calls are serialised twice: an in-process mutex for tasks
//! sharing one manager, and an exclusive lock file for other keel processes
//! working in the same directory.

mod backend;
mod git;
mod operations;

pub use backend::{Checkpoint, VersionControlBackend};
pub use git::GitBackend;
pub use operations::{Backup, Operation, OperationKind, OperationStatus};

use crate::store::FileLock;
use chrono::Utc;
use keel_core::{CheckpointSettings, KeelError, KeelPaths, Result};
use operations::OperationLog;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Details of a mutation about to happen
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    /// Path relative to the working directory, or the shell command
    pub target: String,
    pub destination: Option<String>,
    pub tool_call_id: Option<String>,
    pub auto_approved: bool,
}

pub struct CheckpointManager {
    workdir: PathBuf,
    dir: PathBuf,
    backend: Arc<dyn VersionControlBackend>,
    log: OperationLog,
    guard: Mutex<()>,
    captures_ignored: bool,
}

impl CheckpointManager {
    /// Git-backed manager for `workdir`, storing state in the keel home.
    pub fn open(paths: &KeelPaths, workdir: &Path, settings: &CheckpointSettings) -> Self {
        let dir = paths.checkpoints_dir(workdir);
        let backend = Arc::new(
            GitBackend::new(dir.join("repo"), workdir).with_ignored(settings.include_ignored),
        );
        let mut manager = Self::with_backend(dir, workdir, backend);
        manager.captures_ignored = settings.include_ignored;
        manager
    }

    pub fn with_backend(
        dir: impl Into<PathBuf>,
        workdir: &Path,
        backend: Arc<dyn VersionControlBackend>,
    ) -> Self {
        let dir = dir.into();
        Self {
            workdir: workdir.to_path_buf(),
            log: OperationLog::new(&dir),
            dir,
            backend,
            guard: Mutex::new(()),
            captures_ignored: false,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Whether snapshots include files ignored by `.gitignore`. When not,
    /// restore and shell-command undo leave those files untouched.
    pub fn captures_ignored(&self) -> bool {
        self.captures_ignored
    }

    /// Snapshot the working tree and start a fresh operation log.
    pub async fn create_checkpoint(&self, message: &str) -> Result<Checkpoint> {
        let _guard = self.guard.lock().await;
        let _lock = self.lock().await?;
        self.ensure_backend().await?;

        let checkpoint = self
            .backend
            .snapshot(message)
            .await
            .map_err(|e| self.backend_error(e))?;
        self.log.clear().map_err(|e| self.log_error(e))?;

        tracing::info!(
            id = %checkpoint.short_id(),
            files = checkpoint.files.len(),
            "Created checkpoint: {}",
            checkpoint.message
        );
        Ok(checkpoint)
    }

    /// All checkpoints, most recent first
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.ensure_backend().await?;
        self.backend.list().await.map_err(|e| self.backend_error(e))
    }

    /// Reset the working tree to checkpoint `id` and discard the operation
    /// log. Without `force` the restore is refused when it would discard
    /// changes made since the checkpoint.
    pub async fn restore_checkpoint(&self, id: &str, force: bool) -> Result<Checkpoint> {
        let _guard = self.guard.lock().await;
        let _lock = self.lock().await?;
        let full_id = self.resolve(id).await?;

        if !force {
            let diff = self
                .backend
                .diff(&full_id)
                .await
                .map_err(|e| self.backend_error(e))?;
            if !diff.trim().is_empty() {
                return Err(KeelError::CheckpointConflict {
                    message: format!(
                        "restoring {} would discard changes made since the checkpoint",
                        short(&full_id)
                    ),
                    remediation: "Review them with `keel checkpoint diff`, then re-run with --force"
                        .to_string(),
                });
            }
        }

        self.backend
            .restore(&full_id)
            .await
            .map_err(|e| self.backend_error(e))?;
        self.log.clear().map_err(|e| self.log_error(e))?;

        let checkpoint = self
            .backend
            .list()
            .await
            .map_err(|e| self.backend_error(e))?
            .into_iter()
            .find(|c| c.id == full_id)
            .ok_or_else(|| KeelError::CheckpointNotFound(id.to_string()))?;
        tracing::info!(id = %checkpoint.short_id(), "Restored checkpoint");
        Ok(checkpoint)
    }

    /// Diff from checkpoint `id` to the current working tree
    pub async fn get_diff(&self, id: &str) -> Result<String> {
        let _guard = self.guard.lock().await;
        // Diffing restages the shadow index
        let _lock = self.lock().await?;
        let full_id = self.resolve(id).await?;
        self.backend
            .diff(&full_id)
            .await
            .map_err(|e| self.backend_error(e))
    }

    /// Operations recorded since the last checkpoint, oldest first
    pub async fn list_operations(&self) -> Result<Vec<Operation>> {
        self.log.load().map_err(|e| self.log_error(e))
    }

    /// Capture the pre-image of a mutation and append it to the log.
    ///
    /// Called before the tool runs, so a failed or interrupted tool can
    /// still be undone.
    pub async fn record_operation(&self, request: OperationRequest) -> Result<Operation> {
        let _guard = self.guard.lock().await;
        let _lock = self.lock().await?;

        let id = uuid::Uuid::new_v4().to_string();
        let (backup, destination_backup) = match request.kind {
            OperationKind::Execute => {
                self.ensure_backend().await?;
                let tree = self
                    .backend
                    .capture_tree()
                    .await
                    .map_err(|e| self.backend_error(e))?;
                (Backup::Tree { tree }, None)
            }
            OperationKind::Move => {
                let source = self.log_capture(&request.target, &format!("{id}.src"))?;
                let destination = match &request.destination {
                    Some(dest) => Some(self.log_capture(dest, &format!("{id}.dst"))?),
                    None => None,
                };
                (source, destination)
            }
            OperationKind::Write | OperationKind::Delete => {
                (self.log_capture(&request.target, &id)?, None)
            }
        };

        if request.auto_approved {
            tracing::warn!(
                kind = %request.kind,
                target = %request.target,
                "Recording auto-approved operation"
            );
        }

        let operation = Operation {
            id,
            kind: request.kind,
            file: request.target,
            destination: request.destination,
            timestamp: Utc::now(),
            status: OperationStatus::Active,
            auto_approved: request.auto_approved,
            tool_call_id: request.tool_call_id,
            backup,
            destination_backup,
        };
        self.log
            .append(operation.clone())
            .map_err(|e| self.log_error(e))?;
        tracing::debug!(id = %operation.id, kind = %operation.kind, "Recorded operation");
        Ok(operation)
    }

    /// Revert the most recent active operation. `Ok(None)` when there is
    /// nothing to undo.
    pub async fn undo_last_operation(&self) -> Result<Option<Operation>> {
        let _guard = self.guard.lock().await;
        let _lock = self.lock().await?;

        let mut operations = self.log.load().map_err(|e| self.log_error(e))?;
        let Some(index) = operations.iter().rposition(Operation::is_active) else {
            return Ok(None);
        };

        let operation = &operations[index];
        match (&operation.kind, &operation.backup) {
            (_, Backup::Tree { tree }) => {
                self.backend
                    .restore_tree(tree)
                    .await
                    .map_err(|e| self.backend_error(e))?;
            }
            (OperationKind::Move, backup) => {
                if let (Some(dest), Some(dest_backup)) =
                    (&operation.destination, &operation.destination_backup)
                {
                    self.log
                        .apply(&self.workdir.join(dest), dest_backup)
                        .map_err(|e| self.log_error(e))?;
                }
                self.log
                    .apply(&self.workdir.join(&operation.file), backup)
                    .map_err(|e| self.log_error(e))?;
            }
            (_, backup) => {
                self.log
                    .apply(&self.workdir.join(&operation.file), backup)
                    .map_err(|e| self.log_error(e))?;
            }
        }

        operations[index].status = OperationStatus::Undone;
        let undone = operations[index].clone();
        self.log.save(&operations).map_err(|e| self.log_error(e))?;

        tracing::info!(id = %undone.id, kind = %undone.kind, "Undid operation on {}", undone.file);
        Ok(Some(undone))
    }

    fn log_capture(&self, target: &str, blob: &str) -> Result<Backup> {
        self.log
            .capture(&self.workdir.join(target), blob)
            .map_err(|e| self.log_error(e))
    }

    async fn resolve(&self, id: &str) -> Result<String> {
        self.ensure_backend().await?;
        self.backend
            .resolve(id)
            .await
            .map_err(|e| self.backend_error(e))?
            .ok_or_else(|| KeelError::CheckpointNotFound(id.to_string()))
    }

    async fn ensure_backend(&self) -> Result<()> {
        if self.backend.is_available().await {
            return Ok(());
        }
        Err(KeelError::CheckpointConflict {
            message: format!("{} is not available on this system", self.backend.name()),
            remediation: format!(
                "Install {} or run the agent with --no-checkpoint",
                self.backend.name()
            ),
        })
    }

    /// Take the cross-process lock, retrying briefly.
    async fn lock(&self) -> Result<FileLock> {
        let path = self.dir.join("lock");
        for attempt in 0..LOCK_ATTEMPTS {
            match FileLock::try_acquire(&path) {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => {
                    tracing::debug!(attempt, "Checkpoint store busy, retrying");
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(self.log_error(e)),
            }
        }
        Err(KeelError::CheckpointConflict {
            message: format!(
                "checkpoint store for {} is locked by another keel process",
                self.workdir.display()
            ),
            remediation: "Wait for the other keel command in this directory to finish, then retry"
                .to_string(),
        })
    }

    fn backend_error(&self, err: anyhow::Error) -> KeelError {
        KeelError::CheckpointConflict {
            message: format!("{err:#}"),
            remediation: format!(
                "Inspect the checkpoint repository at {}",
                self.dir.join("repo").display()
            ),
        }
    }

    fn log_error(&self, err: anyhow::Error) -> KeelError {
        KeelError::CheckpointConflict {
            message: format!("{err:#}"),
            remediation: format!(
                "Create a new checkpoint to reset the operation log in {}",
                self.dir.display()
            ),
        }
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use git::git_available;
    use tempfile::TempDir;

    struct Fixture {
        _home: TempDir,
        work: TempDir,
        manager: CheckpointManager,
    }

    fn fixture() -> Fixture {
        let home = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let manager = CheckpointManager::open(
            &KeelPaths::new(home.path()),
            work.path(),
            &CheckpointSettings::default(),
        );
        Fixture {
            _home: home,
            work,
            manager,
        }
    }

    fn request(kind: OperationKind, target: &str) -> OperationRequest {
        OperationRequest {
            kind,
            target: target.to_string(),
            destination: None,
            tool_call_id: None,
            auto_approved: false,
        }
    }

    #[tokio::test]
    async fn test_undo_on_empty_log_is_nothing() {
        let f = fixture();
        assert!(f.manager.undo_last_operation().await.unwrap().is_none());
        assert!(f.manager.list_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undo_write_restores_previous_content() {
        let f = fixture();
        let file = f.work.path().join("a.txt");
        std::fs::write(&file, "v1").unwrap();

        f.manager
            .record_operation(request(OperationKind::Write, "a.txt"))
            .await
            .unwrap();
        std::fs::write(&file, "v2").unwrap();

        let undone = f.manager.undo_last_operation().await.unwrap().unwrap();
        assert_eq!(undone.status, OperationStatus::Undone);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "v1");

        // Only one active operation existed
        assert!(f.manager.undo_last_operation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undo_is_granular() {
        let f = fixture();
        let a = f.work.path().join("a.txt");
        let b = f.work.path().join("b.txt");

        f.manager
            .record_operation(request(OperationKind::Write, "a.txt"))
            .await
            .unwrap();
        std::fs::write(&a, "created").unwrap();
        std::fs::write(&b, "keep").unwrap();
        f.manager
            .record_operation(request(OperationKind::Delete, "b.txt"))
            .await
            .unwrap();
        std::fs::remove_file(&b).unwrap();

        f.manager.undo_last_operation().await.unwrap();
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "keep");
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "created");

        f.manager.undo_last_operation().await.unwrap();
        assert!(!a.exists());

        let ops = f.manager.list_operations().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.status == OperationStatus::Undone));
    }

    #[tokio::test]
    async fn test_undo_move() {
        let f = fixture();
        std::fs::write(f.work.path().join("old.txt"), "payload").unwrap();

        let mut req = request(OperationKind::Move, "old.txt");
        req.destination = Some("dir/new.txt".to_string());
        f.manager.record_operation(req).await.unwrap();
        std::fs::create_dir(f.work.path().join("dir")).unwrap();
        std::fs::rename(
            f.work.path().join("old.txt"),
            f.work.path().join("dir/new.txt"),
        )
        .unwrap();

        f.manager.undo_last_operation().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(f.work.path().join("old.txt")).unwrap(),
            "payload"
        );
        assert!(!f.work.path().join("dir/new.txt").exists());
    }

    #[tokio::test]
    async fn test_auto_approved_marker_recorded() {
        let f = fixture();
        let mut req = request(OperationKind::Write, "x.txt");
        req.auto_approved = true;
        req.tool_call_id = Some("call_7".to_string());
        f.manager.record_operation(req).await.unwrap();

        let ops = f.manager.list_operations().await.unwrap();
        assert!(ops[0].auto_approved);
        assert_eq!(ops[0].tool_call_id.as_deref(), Some("call_7"));
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let f = fixture();
        std::fs::write(f.work.path().join("a.txt"), [0u8, 159, 146, 150]).unwrap();
        std::fs::write(f.work.path().join("b.txt"), "b").unwrap();

        let checkpoint = f.manager.create_checkpoint("before changes").await.unwrap();

        std::fs::write(f.work.path().join("a.txt"), "text now").unwrap();
        std::fs::remove_file(f.work.path().join("b.txt")).unwrap();
        std::fs::write(f.work.path().join("c.txt"), "c").unwrap();

        let err = f
            .manager
            .restore_checkpoint(&checkpoint.id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::CheckpointConflict { .. }));

        f.manager
            .restore_checkpoint(&checkpoint.id, true)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(f.work.path().join("a.txt")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
        assert_eq!(std::fs::read_to_string(f.work.path().join("b.txt")).unwrap(), "b");
        assert!(!f.work.path().join("c.txt").exists());
    }

    #[tokio::test]
    async fn test_include_ignored_setting_reaches_snapshots() {
        if !git_available() {
            return;
        }
        let home = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        std::fs::write(work.path().join(".gitignore"), "*.log\n").unwrap();
        std::fs::write(work.path().join("run.log"), "first").unwrap();

        let f = fixture();
        assert!(!f.manager.captures_ignored());

        let manager = CheckpointManager::open(
            &KeelPaths::new(home.path()),
            work.path(),
            &CheckpointSettings {
                include_ignored: true,
            },
        );
        assert!(manager.captures_ignored());
        let checkpoint = manager.create_checkpoint("with logs").await.unwrap();
        assert!(checkpoint.files.contains(&"run.log".to_string()));

        std::fs::write(work.path().join("run.log"), "second").unwrap();
        manager.restore_checkpoint(&checkpoint.id, true).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(work.path().join("run.log")).unwrap(),
            "first"
        );
    }

    #[tokio::test]
    async fn test_create_checkpoint_clears_operations() {
        if !git_available() {
            return;
        }
        let f = fixture();
        f.manager
            .record_operation(request(OperationKind::Write, "a.txt"))
            .await
            .unwrap();
        assert_eq!(f.manager.list_operations().await.unwrap().len(), 1);

        f.manager.create_checkpoint("clean").await.unwrap();
        assert!(f.manager.list_operations().await.unwrap().is_empty());
        assert!(f.manager.undo_last_operation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undo_shell_command() {
        if !git_available() {
            return;
        }
        let f = fixture();
        std::fs::write(f.work.path().join("a.txt"), "keep").unwrap();

        f.manager
            .record_operation(request(OperationKind::Execute, "rm a.txt && touch b.txt"))
            .await
            .unwrap();
        std::fs::remove_file(f.work.path().join("a.txt")).unwrap();
        std::fs::write(f.work.path().join("b.txt"), "").unwrap();

        f.manager.undo_last_operation().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(f.work.path().join("a.txt")).unwrap(),
            "keep"
        );
        assert!(!f.work.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_list_diff_and_unknown_id() {
        if !git_available() {
            return;
        }
        let f = fixture();
        std::fs::write(f.work.path().join("a.txt"), "one\n").unwrap();
        let first = f.manager.create_checkpoint("first").await.unwrap();
        std::fs::write(f.work.path().join("a.txt"), "two\n").unwrap();
        let second = f.manager.create_checkpoint("second").await.unwrap();

        let list = f.manager.list_checkpoints().await.unwrap();
        assert_eq!(
            list.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec![second.id.as_str(), first.id.as_str()]
        );

        let diff = f.manager.get_diff(first.short_id()).await.unwrap();
        assert!(diff.contains("-one"));
        assert!(diff.contains("+two"));

        let err = f.manager.get_diff("0000000").await.unwrap_err();
        assert!(matches!(err, KeelError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_locked_store_is_a_conflict() {
        let f = fixture();
        let dir = f.manager.dir.clone();
        let _held = FileLock::acquire(&dir.join("lock")).unwrap();

        // fs2 locks are per open file description, so a second open in the
        // same process contends
        let err = f
            .manager
            .record_operation(request(OperationKind::Write, "a.txt"))
            .await
            .unwrap_err();
        match err {
            KeelError::CheckpointConflict { remediation, .. } => {
                assert!(remediation.contains("retry"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = f.manager.get_diff("HEAD").await.unwrap_err();
        assert!(matches!(err, KeelError::CheckpointConflict { .. }));
    }
}
