//! `keel checkpoint` subcommands - Snapshot and roll back the working directory.
//!
//! Checkpoints live in a shadow repository under the keel home, so the
//! project's own version control is never touched.

use clap::{Args, Subcommand};
use keel_code::checkpoint::{CheckpointManager, OperationKind, OperationStatus};

use super::Context;
use crate::output::{excerpt, format_ago, new_table};
use crate::prompt;

/// Manage checkpoints.
#[derive(Args)]
pub struct CheckpointArgs {
    #[command(subcommand)]
    pub command: CheckpointCommand,
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List checkpoints, newest first
    List,
    /// Snapshot the working directory
    Create(CreateArgs),
    /// Restore the working directory to a checkpoint
    Restore(RestoreArgs),
    /// Undo the most recent recorded operation
    Undo,
    /// Show changes since a checkpoint
    Diff(DiffArgs),
    /// List operations recorded since the last checkpoint
    Operations,
}

#[derive(Args)]
pub struct CreateArgs {
    /// Checkpoint message
    #[arg(default_value = "manual checkpoint")]
    pub message: String,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Checkpoint id or prefix
    pub id: String,

    /// Overwrite uncommitted changes without asking
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct DiffArgs {
    /// Checkpoint id or prefix
    pub id: String,
}

/// Dispatch checkpoint subcommands.
pub async fn execute(args: CheckpointArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load()?;
    let manager = CheckpointManager::open(&ctx.paths, &ctx.workdir, &ctx.settings.checkpoint);

    match args.command {
        CheckpointCommand::List => execute_list(&manager).await,
        CheckpointCommand::Create(a) => execute_create(&manager, a).await,
        CheckpointCommand::Restore(a) => execute_restore(&manager, a).await,
        CheckpointCommand::Undo => execute_undo(&manager).await,
        CheckpointCommand::Diff(a) => execute_diff(&manager, a).await,
        CheckpointCommand::Operations => execute_operations(&manager).await,
    }
}

async fn execute_list(manager: &CheckpointManager) -> Result<(), Box<dyn std::error::Error>> {
    let checkpoints = manager.list_checkpoints().await?;
    if checkpoints.is_empty() {
        println!("No checkpoints for {}", manager.workdir().display());
        return Ok(());
    }

    let mut table = new_table(&["ID", "MESSAGE", "FILES", "CREATED"]);
    for checkpoint in &checkpoints {
        table.add_row(vec![
            checkpoint.short_id().to_string(),
            excerpt(&checkpoint.message, 60),
            checkpoint.files.len().to_string(),
            format_ago(&checkpoint.timestamp),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn execute_create(
    manager: &CheckpointManager,
    args: CreateArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let checkpoint = manager.create_checkpoint(&args.message).await?;
    println!(
        "Created checkpoint {} ({} files): {}",
        checkpoint.short_id(),
        checkpoint.files.len(),
        checkpoint.message
    );
    Ok(())
}

async fn execute_restore(
    manager: &CheckpointManager,
    args: RestoreArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut force = args.force;
    if !force {
        let diff = manager.get_diff(&args.id).await?;
        if !diff.trim().is_empty() {
            let changed = changed_files(&diff);
            eprintln!("Restoring {} will discard changes to:", args.id);
            for file in &changed {
                eprintln!("  {file}");
            }
            if !prompt::confirm("Continue?")? {
                return Err("restore aborted (use --force to skip this prompt)".into());
            }
            force = true;
        }
    }

    let checkpoint = manager.restore_checkpoint(&args.id, force).await?;
    println!(
        "Restored checkpoint {}: {}",
        checkpoint.short_id(),
        checkpoint.message
    );
    note_ignored_files(manager);
    Ok(())
}

/// Snapshots skip gitignored files unless `checkpoint.include_ignored` is set.
fn note_ignored_files(manager: &CheckpointManager) {
    if !manager.captures_ignored() {
        eprintln!("{IGNORED_NOTE}");
    }
}

const IGNORED_NOTE: &str = "Note: files ignored by .gitignore are not captured and were left as they are \
(set checkpoint.include_ignored in settings.json to capture them)";

async fn execute_undo(manager: &CheckpointManager) -> Result<(), Box<dyn std::error::Error>> {
    match manager.undo_last_operation().await? {
        Some(operation) => {
            match &operation.destination {
                Some(destination) => println!(
                    "Undid {} {} -> {}",
                    operation.kind, operation.file, destination
                ),
                None => println!("Undid {} {}", operation.kind, operation.file),
            }
            if operation.kind == OperationKind::Execute {
                note_ignored_files(manager);
            }
        }
        None => println!("Nothing to undo"),
    }
    Ok(())
}

async fn execute_diff(
    manager: &CheckpointManager,
    args: DiffArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let diff = manager.get_diff(&args.id).await?;
    if diff.trim().is_empty() {
        println!("No changes since checkpoint {}", args.id);
    } else {
        print!("{diff}");
    }
    Ok(())
}

async fn execute_operations(manager: &CheckpointManager) -> Result<(), Box<dyn std::error::Error>> {
    let operations = manager.list_operations().await?;
    if operations.is_empty() {
        println!("No operations since the last checkpoint");
        return Ok(());
    }

    let mut table = new_table(&["#", "KIND", "TARGET", "STATUS", "WHEN", ""]);
    for (index, operation) in operations.iter().enumerate() {
        let target = match &operation.destination {
            Some(destination) => format!("{} -> {}", operation.file, destination),
            None => excerpt(&operation.file, 60),
        };
        let status = match operation.status {
            OperationStatus::Active => "active",
            OperationStatus::Undone => "undone",
        };
        let flags = if operation.auto_approved {
            "auto-approved"
        } else {
            ""
        };
        table.add_row(vec![
            (index + 1).to_string(),
            operation.kind.to_string(),
            target,
            status.to_string(),
            format_ago(&operation.timestamp),
            flags.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Paths named in the `diff --git a/x b/x` headers of a unified diff.
fn changed_files(diff: &str) -> Vec<&str> {
    diff.lines()
        .filter_map(|line| line.strip_prefix("diff --git a/"))
        .filter_map(|rest| rest.split(" b/").next())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_files_from_diff() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n\
                    index 1..2 100644\n\
                    --- a/src/lib.rs\n\
                    +++ b/src/lib.rs\n\
                    @@ -1 +1 @@\n\
                    -a\n\
                    +b\n\
                    diff --git a/notes.md b/notes.md\n\
                    deleted file mode 100644\n";
        assert_eq!(changed_files(diff), vec!["src/lib.rs", "notes.md"]);
    }

    #[test]
    fn test_changed_files_empty() {
        assert!(changed_files("").is_empty());
    }
}
