//! Git-backed snapshots in a shadow repository.
//!
//! The shadow repository lives in the keel home and points at the project
//! with `--work-tree`, so the project's own `.git` is never touched.

use super::backend::{Checkpoint, VersionControlBackend};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::process::Command;

const FIELD_SEP: char = '\u{1f}';

/// Paths never captured in snapshots
const EXCLUDES: &[&str] = &[".keel"];

#[derive(Debug, Clone)]
pub struct GitBackend {
    git_dir: PathBuf,
    workdir: PathBuf,
    include_ignored: bool,
}

impl GitBackend {
    pub fn new(git_dir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            workdir: workdir.into(),
            include_ignored: false,
        }
    }

    /// Capture files matched by the project's `.gitignore` as well.
    pub fn with_ignored(mut self, include: bool) -> Self {
        self.include_ignored = include;
        self
    }

    async fn has_commits(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--verify", "-q", "HEAD"]).await?;
        Ok(out.status.success())
    }

    async fn checkpoint(&self, id: &str) -> Result<Checkpoint> {
        let format = format!("--format=%H{FIELD_SEP}%s{FIELD_SEP}%ct");
        let out = self.run_capture(&["show", "-s", &format, id]).await?;
        let mut checkpoint = parse_log_line(out.trim())?;
        checkpoint.files = self.files(&checkpoint.id).await?;
        Ok(checkpoint)
    }

    async fn files(&self, id: &str) -> Result<Vec<String>> {
        let out = self
            .run_capture(&["ls-tree", "-r", "--name-only", id])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn stage_all(&self) -> Result<()> {
        if !self.include_ignored {
            self.run_checked(&["add", "-A"]).await?;
            return Ok(());
        }
        // --force also bypasses info/exclude, so drop keel's own paths again
        self.run_checked(&["add", "-A", "--force"]).await?;
        let mut args = vec!["rm", "-r", "-q", "--cached", "--ignore-unmatch", "--"];
        args.extend(EXCLUDES);
        self.run_checked(&args).await?;
        Ok(())
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!("git {}", args.join(" "));
        Command::new("git")
            .arg(format!("--git-dir={}", self.git_dir.display()))
            .arg(format!("--work-tree={}", self.workdir.display()))
            .args(["-c", "user.name=keel", "-c", "user.email=keel@localhost"])
            .args(["-c", "commit.gpgsign=false", "-c", "core.autocrlf=false"])
            .args(args)
            .current_dir(&self.workdir)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env_remove("GIT_INDEX_FILE")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[async_trait]
impl VersionControlBackend for GitBackend {
    fn name(&self) -> &str {
        "git"
    }

    async fn is_available(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn init(&self) -> Result<()> {
        if self.git_dir.join("HEAD").exists() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.git_dir)
            .await
            .with_context(|| format!("create {}", self.git_dir.display()))?;
        self.run_checked(&["init", "-q"]).await?;
        // Captured trees are unreachable from commits and must survive gc
        self.run_checked(&["config", "gc.auto", "0"]).await?;

        let info = self.git_dir.join("info");
        tokio::fs::create_dir_all(&info).await?;
        let excludes: String = EXCLUDES.iter().map(|p| format!("/{p}/\n")).collect();
        tokio::fs::write(info.join("exclude"), excludes).await?;

        tracing::info!(git_dir = %self.git_dir.display(), "Initialized checkpoint repository");
        Ok(())
    }

    async fn snapshot(&self, message: &str) -> Result<Checkpoint> {
        self.init().await?;
        self.stage_all().await?;
        self.run_checked(&["commit", "--allow-empty", "--no-verify", "-q", "-m", message])
            .await?;
        self.checkpoint("HEAD").await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        if !self.git_dir.join("HEAD").exists() || !self.has_commits().await? {
            return Ok(Vec::new());
        }
        let format = format!("--format=%H{FIELD_SEP}%s{FIELD_SEP}%ct");
        let out = self.run_capture(&["log", &format]).await?;

        let mut checkpoints = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let mut checkpoint = parse_log_line(line)?;
            checkpoint.files = self.files(&checkpoint.id).await?;
            checkpoints.push(checkpoint);
        }
        Ok(checkpoints)
    }

    async fn resolve(&self, id: &str) -> Result<Option<String>> {
        if id.trim().is_empty() || !self.git_dir.join("HEAD").exists() {
            return Ok(None);
        }
        let spec = format!("{id}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "-q", &spec]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    async fn restore(&self, id: &str) -> Result<()> {
        // Stage first so files created since the snapshot are tracked and
        // get removed by the reset
        self.stage_all().await?;
        self.run_checked(&["read-tree", "--reset", "-u", id]).await?;
        Ok(())
    }

    async fn diff(&self, id: &str) -> Result<String> {
        self.stage_all().await?;
        self.run_capture(&["diff", "--cached", "--no-color", "--no-ext-diff", id])
            .await
    }

    async fn capture_tree(&self) -> Result<String> {
        self.init().await?;
        self.stage_all().await?;
        let out = self.run_capture(&["write-tree"]).await?;
        Ok(out.trim().to_string())
    }

    async fn restore_tree(&self, tree: &str) -> Result<()> {
        self.stage_all().await?;
        self.run_checked(&["read-tree", "--reset", "-u", tree]).await?;
        Ok(())
    }
}

fn parse_log_line(line: &str) -> Result<Checkpoint> {
    let mut parts = line.splitn(3, FIELD_SEP);
    let (Some(id), Some(message), Some(ts)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("unexpected git log line: '{line}'"));
    };
    let secs: i64 = ts
        .trim()
        .parse()
        .with_context(|| format!("bad commit timestamp '{ts}'"))?;
    let timestamp: DateTime<Utc> = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| anyhow!("commit timestamp out of range: {secs}"))?;
    Ok(Checkpoint {
        id: id.to_string(),
        message: message.to_string(),
        timestamp,
        files: Vec::new(),
    })
}

#[cfg(test)]
pub(crate) fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
