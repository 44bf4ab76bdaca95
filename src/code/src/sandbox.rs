//! Isolation boundary for tool execution
//!
//! The sandbox makes no policy decisions; every call reaching it has already
//! been approved by the permission manager. It only enforces where file
//! tools may touch the disk and how shell commands are launched.

use keel_core::{KeelError, Result, SandboxMode, SandboxSettings};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum captured output in bytes before truncation
pub const MAX_OUTPUT_SIZE: usize = 100 * 1024; // 100KB

/// Exit code reported for commands killed by the timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Upper bound for a per-call timeout requested by the model
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 600;

const RUNTIME_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const CONTAINER_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Fold `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve symlinks of the longest existing prefix of `path` and re-append
/// the components that do not exist yet.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            let mut resolved = canonical;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (current.file_name().map(|n| n.to_os_string()), current.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name);
                current = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Captured result of one shell command
#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutput {
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Execution environment selected for a run
#[derive(Debug, Clone)]
pub struct Sandbox {
    requested: SandboxMode,
    mode: SandboxMode,
    settings: SandboxSettings,
    workdir: PathBuf,
    fallback_reason: Option<String>,
}

impl Sandbox {
    /// Build a sandbox, probing the container runtime when one is requested.
    /// A missing runtime degrades to `Basic` instead of failing.
    pub async fn new(mode: SandboxMode, settings: SandboxSettings, workdir: &Path) -> Self {
        let workdir = workdir
            .canonicalize()
            .unwrap_or_else(|_| normalize_lexically(workdir));

        let mut sandbox = Self {
            requested: mode,
            mode,
            settings,
            workdir,
            fallback_reason: None,
        };

        if mode == SandboxMode::Container {
            if let Err(e) = check_runtime(&sandbox.settings.container_runtime).await {
                tracing::warn!(
                    "Container sandbox unavailable, falling back to basic isolation: {}",
                    e
                );
                sandbox.mode = SandboxMode::Basic;
                sandbox.fallback_reason = Some(e.to_string());
            }
        }

        tracing::info!(
            mode = %sandbox.mode,
            workdir = %sandbox.workdir.display(),
            "Sandbox ready"
        );
        sandbox
    }

    /// Mode actually in effect
    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    pub fn requested_mode(&self) -> SandboxMode {
        self.requested
    }

    /// Why the requested mode could not be honoured
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    /// Resolve a tool path. Outside `None` mode the result must stay under
    /// the working directory after folding `..` and following symlinks.
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let raw = Path::new(path);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.workdir.join(raw)
        };
        let normalized = normalize_lexically(&joined);

        if self.mode == SandboxMode::None {
            return Ok(normalized);
        }

        let resolved = canonicalize_existing_prefix(&normalized);
        if !resolved.starts_with(&self.workdir) {
            return Err(KeelError::PermissionDenied(format!(
                "{} is outside the working directory {}",
                path,
                self.workdir.display()
            )));
        }
        Ok(normalized)
    }

    /// Where a tool path really points once symlinks are followed, relative
    /// to the working directory when it lies inside it. `None` when no
    /// symlink is involved.
    pub fn resolve_link_target(&self, path: &str) -> Option<String> {
        let raw = Path::new(path);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.workdir.join(raw)
        };
        let normalized = normalize_lexically(&joined);
        let resolved = canonicalize_existing_prefix(&normalized);
        if resolved == normalized {
            return None;
        }
        let target = resolved.strip_prefix(&self.workdir).unwrap_or(&resolved);
        Some(target.to_string_lossy().replace('\\', "/"))
    }

    /// Path relative to the working directory, for display and logging.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.workdir).unwrap_or(path)
    }

    /// Timeout for one command. Requests are capped at the larger of the
    /// configured timeout and `MAX_COMMAND_TIMEOUT_SECS`.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let default = self.timeout();
        let cap = default.max(Duration::from_secs(MAX_COMMAND_TIMEOUT_SECS));
        requested.unwrap_or(default).min(cap)
    }

    /// Run a shell command in the working directory (or the container).
    pub async fn run_shell(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput> {
        let timeout = self.effective_timeout(timeout);
        let container = (self.mode == SandboxMode::Container).then(|| {
            ContainerGuard::new(
                &self.settings.container_runtime,
                format!("keel-{}", uuid::Uuid::new_v4()),
            )
        });
        let mut cmd = self.shell_command(command, container.as_ref().map(|c| c.name.as_str()));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(mode = %self.mode, "Shell command: {}", command);

        let mut child = cmd
            .spawn()
            .map_err(|e| KeelError::Other(format!("failed to spawn shell: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout));
        let stderr_task = tokio::spawn(read_capped(stderr));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                (status.code().unwrap_or(-1), false)
            }
            Err(_) => {
                tracing::warn!("Command timed out after {:?}: {}", timeout, command);
                let _ = child.kill().await;
                // Killing the runtime client leaves the container running
                if let Some(container) = &container {
                    container.kill().await;
                }
                (TIMEOUT_EXIT_CODE, true)
            }
        };
        if let Some(container) = container {
            container.disarm();
        }

        let (out, out_truncated) = join_reader(stdout_task).await;
        let (err, err_truncated) = join_reader(stderr_task).await;

        let mut output = out;
        if !err.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err);
        }

        let mut truncated = out_truncated || err_truncated;
        if output.len() > MAX_OUTPUT_SIZE {
            let mut cut = MAX_OUTPUT_SIZE;
            while !output.is_char_boundary(cut) {
                cut -= 1;
            }
            output.truncate(cut);
            truncated = true;
        }
        if truncated {
            output.push_str(&format!("\n\n[Output truncated at {} bytes]", MAX_OUTPUT_SIZE));
        }
        if timed_out {
            output.push_str(&format!(
                "\n\n[Command timed out after {}s]",
                timeout.as_secs_f64()
            ));
        }

        Ok(ShellOutput {
            output,
            exit_code,
            timed_out,
            truncated,
        })
    }

    fn shell_command(&self, command: &str, container_name: Option<&str>) -> Command {
        match (self.mode, container_name) {
            (SandboxMode::Container, Some(name)) => {
                let mut cmd = Command::new(&self.settings.container_runtime);
                cmd.args(container_args(&self.settings, &self.workdir, name, command));
                cmd
            }
            _ => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command).current_dir(&self.workdir);
                cmd
            }
        }
    }
}

/// Named container of one `run_shell` call. Dropping an armed guard (the
/// call was cancelled mid-flight) kills the container in the background.
struct ContainerGuard {
    runtime: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: &str, name: String) -> Self {
        Self {
            runtime: runtime.to_string(),
            name,
            armed: true,
        }
    }

    async fn kill(&self) {
        kill_container(&self.runtime, &self.name).await;
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Container {} may still be running", self.name);
            return;
        };
        let runtime = self.runtime.clone();
        let name = self.name.clone();
        handle.spawn(async move { kill_container(&runtime, &name).await });
    }
}

async fn kill_container(runtime: &str, name: &str) {
    let kill = Command::new(runtime)
        .args(["kill", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(CONTAINER_KILL_TIMEOUT, kill).await {
        Ok(Ok(status)) if status.success() => {
            tracing::debug!(container = %name, "Killed container");
        }
        Ok(Ok(status)) => {
            tracing::debug!(container = %name, "'{runtime} kill' exited with {}", status);
        }
        Ok(Err(e)) => tracing::warn!(container = %name, "Failed to run '{runtime} kill': {}", e),
        Err(_) => tracing::warn!(container = %name, "'{runtime} kill' did not answer"),
    }
}

/// Arguments for `<runtime> run ...` executing `command` in a throwaway
/// container called `name`.
fn container_args(settings: &SandboxSettings, workdir: &Path, name: &str, command: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    if !settings.network {
        args.extend(["--network".to_string(), "none".to_string()]);
    }
    args.extend([
        "--memory".to_string(),
        settings.memory.clone(),
        "--cpus".to_string(),
        settings.cpus.clone(),
        "-v".to_string(),
        format!("{}:/workspace", workdir.display()),
        "-w".to_string(),
        "/workspace".to_string(),
        settings.image.clone(),
        "sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]);
    args
}

async fn check_runtime(runtime: &str) -> Result<()> {
    let check = Command::new(runtime)
        .arg("version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(RUNTIME_CHECK_TIMEOUT, check).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(KeelError::SandboxUnavailable(format!(
            "'{runtime} version' exited with {status}"
        ))),
        Ok(Err(e)) => Err(KeelError::SandboxUnavailable(format!(
            "cannot run '{runtime}': {e}"
        ))),
        Err(_) => Err(KeelError::SandboxUnavailable(format!(
            "'{runtime} version' did not answer within {}s",
            RUNTIME_CHECK_TIMEOUT.as_secs()
        ))),
    }
}

/// Read a pipe to the end, keeping at most `MAX_OUTPUT_SIZE` bytes.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_SIZE.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                tracing::warn!("Error reading command output: {}", e);
                break;
            }
        }
    }
    (kept, truncated)
}

async fn join_reader(task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (String, bool) {
    // Background processes may hold the pipe open after the shell exits
    let abort = task.abort_handle();
    match tokio::time::timeout(Duration::from_secs(2), task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            abort.abort();
            (String::new(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn basic(dir: &TempDir) -> Sandbox {
        Sandbox::new(SandboxMode::Basic, SandboxSettings::default(), dir.path()).await
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexically(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[tokio::test]
    async fn test_basic_confines_paths() {
        let dir = TempDir::new().unwrap();
        let sandbox = basic(&dir).await;

        let inside = sandbox.resolve_path("src/new.rs").unwrap();
        assert!(inside.starts_with(sandbox.workdir()));

        assert!(sandbox.resolve_path("../escape.txt").is_err());
        assert!(sandbox.resolve_path("/etc/passwd").is_err());
        assert!(sandbox.resolve_path("a/../../escape").is_err());
        assert!(sandbox.resolve_path("a/../ok.txt").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_basic_rejects_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let sandbox = basic(&dir).await;
        let err = sandbox.resolve_path("link/secret.txt").unwrap_err();
        assert!(matches!(err, KeelError::PermissionDenied(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_link_target() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        std::fs::create_dir(dir.path().join("config")).unwrap();
        std::os::unix::fs::symlink(dir.path().join(".env"), dir.path().join("notes.txt")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("config"), dir.path().join("cfg")).unwrap();

        let sandbox = basic(&dir).await;
        assert_eq!(sandbox.resolve_link_target("notes.txt").as_deref(), Some(".env"));
        assert_eq!(
            sandbox.resolve_link_target("./cfg/new.toml").as_deref(),
            Some("config/new.toml")
        );
        assert_eq!(sandbox.resolve_link_target(".env"), None);
        assert_eq!(sandbox.resolve_link_target("missing/file.txt"), None);
    }

    #[tokio::test]
    async fn test_none_mode_does_not_confine() {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(SandboxMode::None, SandboxSettings::default(), dir.path()).await;
        assert_eq!(
            sandbox.resolve_path("/etc/hosts").unwrap(),
            PathBuf::from("/etc/hosts")
        );
    }

    #[tokio::test]
    async fn test_container_falls_back_when_runtime_missing() {
        let dir = TempDir::new().unwrap();
        let settings = SandboxSettings {
            container_runtime: "keel-no-such-runtime".to_string(),
            ..Default::default()
        };
        let sandbox = Sandbox::new(SandboxMode::Container, settings, dir.path()).await;
        assert_eq!(sandbox.mode(), SandboxMode::Basic);
        assert_eq!(sandbox.requested_mode(), SandboxMode::Container);
        assert!(sandbox.fallback_reason().unwrap().contains("keel-no-such-runtime"));
    }

    #[test]
    fn test_container_args() {
        let settings = SandboxSettings::default();
        let args = container_args(&settings, Path::new("/work"), "keel-1", "ls");
        assert_eq!(
            &args[..7],
            &["run", "--rm", "-i", "--name", "keel-1", "--network", "none"]
        );
        assert!(args.contains(&"/work:/workspace".to_string()));
        assert_eq!(args.last().unwrap(), "ls");

        let networked = SandboxSettings {
            network: true,
            ..Default::default()
        };
        assert!(!container_args(&networked, Path::new("/w"), "keel-2", "ls")
            .contains(&"none".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_container_guard_kills_by_name() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in runtime that records its arguments
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("calls.log");
        let runtime = dir.path().join("fake-runtime");
        std::fs::write(
            &runtime,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = runtime.to_string_lossy().to_string();
        ContainerGuard::new(&runtime, "keel-done".to_string()).disarm();
        drop(ContainerGuard::new(&runtime, "keel-cancelled".to_string()));

        let mut calls = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            calls = std::fs::read_to_string(&log).unwrap_or_default();
            if !calls.is_empty() {
                break;
            }
        }
        assert_eq!(calls.trim(), "kill keel-cancelled");
    }

    #[tokio::test]
    async fn test_requested_timeout_is_capped() {
        let dir = TempDir::new().unwrap();
        let sandbox = basic(&dir).await;

        assert_eq!(sandbox.effective_timeout(None), Duration::from_secs(120));
        assert_eq!(
            sandbox.effective_timeout(Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            sandbox.effective_timeout(Some(Duration::from_secs(999_999_999))),
            Duration::from_secs(MAX_COMMAND_TIMEOUT_SECS)
        );

        let patient = Sandbox::new(
            SandboxMode::Basic,
            SandboxSettings {
                timeout_secs: 3600,
                ..Default::default()
            },
            dir.path(),
        )
        .await;
        assert_eq!(
            patient.effective_timeout(Some(Duration::from_secs(999_999_999))),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_run_shell_in_workdir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let sandbox = basic(&dir).await;

        let out = sandbox.run_shell("ls; echo oops >&2; exit 3", None).await.unwrap();
        assert!(out.output.contains("marker.txt"));
        assert!(out.output.contains("oops"));
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_run_shell_timeout() {
        let dir = TempDir::new().unwrap();
        let sandbox = basic(&dir).await;

        let out = sandbox
            .run_shell("sleep 5", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_shell_truncates_output() {
        let dir = TempDir::new().unwrap();
        let sandbox = basic(&dir).await;

        let out = sandbox
            .run_shell("head -c 200000 /dev/zero | tr '\\0' 'a'", None)
            .await
            .unwrap();
        assert!(out.truncated);
        assert!(out.output.contains("[Output truncated"));
        assert!(out.output.len() < MAX_OUTPUT_SIZE + 100);
    }
}
