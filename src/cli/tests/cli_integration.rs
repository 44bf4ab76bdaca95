//! CLI integration tests: run the built `keel` binary against an isolated
//! keel home and a scratch project directory.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

struct Env {
    home: TempDir,
    project: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
            project: TempDir::new().unwrap(),
        }
    }

    fn keel(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_keel"))
            .args(args)
            .current_dir(self.project.path())
            .env("KEEL_HOME", self.home.path())
            .env_remove("RUST_LOG")
            .env_remove("ANTHROPIC_API_KEY")
            .env_remove("OPENAI_API_KEY")
            .env_remove("GOOGLE_API_KEY")
            .env_remove("GEMINI_API_KEY")
            .output()
            .expect("failed to run keel")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn test_project_allow_overrides_default_env_deny() {
    let env = Env::new();

    let out = env.keel(&["config", "permissions", "test", "read", ".env"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).contains("denied"), "{}", stdout(&out));

    let out = env.keel(&["config", "permissions", "allow", "fileRead", ".env", "--project"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(env.project.path().join(".keel/permissions.json").exists());

    let out = env.keel(&["config", "permissions", "test", "read", ".env"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains(": allowed"), "{text}");
    assert!(text.contains("scope: project"), "{text}");

    // Paths are normalised the way the agent normalises them
    let out = env.keel(&["config", "permissions", "test", "read", "./.env"]);
    assert!(stdout(&out).contains(": allowed"), "{}", stdout(&out));
    let out = env.keel(&["config", "permissions", "test", "read", "src/../.env"]);
    assert!(stdout(&out).contains(": allowed"), "{}", stdout(&out));

    let out = env.keel(&["config", "permissions", "reset", "--project"]);
    assert!(out.status.success());
    let out = env.keel(&["config", "permissions", "test", "read", ".env"]);
    assert!(stdout(&out).contains("denied"));
    let out = env.keel(&["config", "permissions", "test", "read", "./.env"]);
    assert!(stdout(&out).contains("denied"));
}

#[test]
fn test_permissions_list_shows_both_scopes() {
    let env = Env::new();
    let out = env.keel(&["config", "permissions", "list"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("global"));
    assert!(text.contains("project"));
    assert!(text.contains("shellExecute"));
}

#[test]
fn test_malformed_permissions_file_fails_fast() {
    let env = Env::new();
    let dir = env.project.path().join(".keel");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("permissions.json"), "{ not json").unwrap();

    let out = env.keel(&["config", "permissions", "test", "read", "src/lib.rs"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Configuration error"), "{}", stderr(&out));
}

#[test]
fn test_session_start_list_delete() {
    let env = Env::new();

    let out = env.keel(&["session", "start", "--name", "refactor parser"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let text = stdout(&out);
    let id = text
        .split_whitespace()
        .nth(2)
        .expect("session id in output")
        .to_string();

    let out = env.keel(&["session", "list"]);
    assert!(stdout(&out).contains("refactor parser"));

    let out = env.keel(&["session", "show", &id[..8]]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).contains(&id));

    let out = env.keel(&["session", "export", &id, "--format", "markdown"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("refactor parser"));

    let out = env.keel(&["session", "delete", &id, "--yes"]);
    assert!(out.status.success(), "{}", stderr(&out));

    let out = env.keel(&["session", "list"]);
    assert!(stdout(&out).contains("No sessions"));
}

#[test]
fn test_session_delete_without_force_needs_terminal() {
    let env = Env::new();
    let out = env.keel(&["session", "start"]);
    let id = stdout(&out).split_whitespace().nth(2).unwrap().to_string();

    // stdin is not a terminal under the test harness, so the prompt declines
    let out = env.keel(&["session", "delete", &id]);
    assert_eq!(out.status.code(), Some(1));
    let out = env.keel(&["session", "list"]);
    assert!(stdout(&out).contains(&id[..8]));
}

#[test]
fn test_unknown_session_fails() {
    let env = Env::new();
    let out = env.keel(&["session", "show", "does-not-exist"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Session not found"));
}

#[test]
fn test_agent_rejects_invalid_config() {
    let env = Env::new();
    let out = env.keel(&["agent", "do something", "--temperature", "5"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("temperature"), "{}", stderr(&out));
}

#[test]
fn test_agent_requires_api_key() {
    let env = Env::new();
    let out = env.keel(&["agent", "do something", "--provider", "openai"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("OPENAI_API_KEY"), "{}", stderr(&out));
}

#[test]
fn test_checkpoint_create_undo_restore() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let env = Env::new();
    let file = env.project.path().join("notes.md");
    std::fs::write(&file, "v1\n").unwrap();

    let out = env.keel(&["checkpoint", "undo"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).contains("Nothing to undo"));

    let out = env.keel(&["checkpoint", "create", "first"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let id = stdout(&out)
        .split_whitespace()
        .nth(2)
        .unwrap()
        .to_string();

    std::fs::write(&file, "v2\n").unwrap();
    let out = env.keel(&["checkpoint", "diff", &id]);
    assert!(stdout(&out).contains("notes.md"));

    // Not a terminal: the confirmation prompt declines
    let out = env.keel(&["checkpoint", "restore", &id]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(read(&file), "v2\n");

    let out = env.keel(&["checkpoint", "restore", &id, "--force"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(read(&file), "v1\n");
    assert!(stderr(&out).contains("include_ignored"), "{}", stderr(&out));

    let out = env.keel(&["checkpoint", "list"]);
    assert!(stdout(&out).contains("first"));
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[test]
fn test_checkpoint_include_ignored_setting() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let env = Env::new();
    std::fs::write(
        env.home.path().join("settings.json"),
        r#"{"checkpoint": {"include_ignored": true}}"#,
    )
    .unwrap();
    std::fs::write(env.project.path().join(".gitignore"), "*.log\n").unwrap();
    let log = env.project.path().join("build.log");
    std::fs::write(&log, "first\n").unwrap();

    let out = env.keel(&["checkpoint", "create", "with logs"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let id = stdout(&out).split_whitespace().nth(2).unwrap().to_string();

    std::fs::write(&log, "second\n").unwrap();
    let out = env.keel(&["checkpoint", "restore", &id, "--force"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(read(&log), "first\n");
    assert!(!stderr(&out).contains("include_ignored"));
}
