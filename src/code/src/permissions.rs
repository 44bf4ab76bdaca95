//! Permission policy for file access and shell execution
//!
//! Rules live in two scopes: the global file in the keel home and an
//! optional project override at `<workdir>/.keel/permissions.json`.
//!
//! ## Evaluation order
//!
//! 1. project deny  → denied
//! 2. project allow → allowed
//! 3. global deny   → denied
//! 4. global allow  → allowed
//! 5. otherwise     → denied (allow-list, default closed)
//!
//! An allowed subject that also matches a `requireApproval` pattern in
//! either scope is returned with `requires_approval = true`.

use crate::sandbox::normalize_lexically;
use crate::store::{self, FileLock};
use glob::{MatchOptions, Pattern};
use keel_core::{KeelError, KeelPaths, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Rule category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionCategory {
    FileRead,
    FileWrite,
    ShellExecute,
}

impl PermissionCategory {
    pub const ALL: [PermissionCategory; 3] = [
        PermissionCategory::FileRead,
        PermissionCategory::FileWrite,
        PermissionCategory::ShellExecute,
    ];
}

impl fmt::Display for PermissionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionCategory::FileRead => write!(f, "fileRead"),
            PermissionCategory::FileWrite => write!(f, "fileWrite"),
            PermissionCategory::ShellExecute => write!(f, "shellExecute"),
        }
    }
}

impl FromStr for PermissionCategory {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fileRead" | "read" => Ok(PermissionCategory::FileRead),
            "fileWrite" | "write" => Ok(PermissionCategory::FileWrite),
            "shellExecute" | "command" | "shell" => Ok(PermissionCategory::ShellExecute),
            other => Err(KeelError::Config(format!(
                "unknown permission category '{other}' (expected fileRead, fileWrite or shellExecute)"
            ))),
        }
    }
}

/// Where a rule lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Global,
    Project,
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionScope::Global => write!(f, "global"),
            PermissionScope::Project => write!(f, "project"),
        }
    }
}

/// Allow and deny patterns of one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleList {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// On-disk rule file shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermissionRuleSet {
    pub file_read: RuleList,
    pub file_write: RuleList,
    pub shell_execute: RuleList,
    pub require_approval: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PermissionRuleSet {
    /// Rules used when no global file exists yet.
    pub fn defaults() -> Self {
        Self {
            file_read: RuleList {
                allow: strings(&["**/*"]),
                deny: strings(&["**/.env*", "**/*.pem", "**/*.key", "**/id_rsa*"]),
            },
            file_write: RuleList {
                allow: strings(&["**/*"]),
                deny: strings(&["**/.env*", "**/.git/**", "**/*.pem", "**/*.key"]),
            },
            shell_execute: RuleList {
                allow: strings(&["*"]),
                deny: strings(&["sudo *", "rm -rf /*", "rm -rf ~*", "mkfs*", "dd if=*"]),
            },
            require_approval: strings(&["rm *", "git push*", "curl *", "wget *"]),
        }
    }

    pub fn rules(&self, category: PermissionCategory) -> &RuleList {
        match category {
            PermissionCategory::FileRead => &self.file_read,
            PermissionCategory::FileWrite => &self.file_write,
            PermissionCategory::ShellExecute => &self.shell_execute,
        }
    }

    pub fn rules_mut(&mut self, category: PermissionCategory) -> &mut RuleList {
        match category {
            PermissionCategory::FileRead => &mut self.file_read,
            PermissionCategory::FileWrite => &mut self.file_write,
            PermissionCategory::ShellExecute => &mut self.shell_execute,
        }
    }

    /// Fail on the first pattern `glob` cannot compile.
    fn validate(&self, origin: &Path) -> Result<()> {
        let all = PermissionCategory::ALL
            .iter()
            .flat_map(|c| {
                let rules = self.rules(*c);
                rules.allow.iter().chain(rules.deny.iter())
            })
            .chain(self.require_approval.iter());
        for pattern in all {
            Pattern::new(pattern).map_err(|e| {
                KeelError::Config(format!(
                    "{}: invalid pattern '{}': {}",
                    origin.display(),
                    pattern,
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requires_approval: bool,
    /// Scope of the rule that decided, `None` for the default deny
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<PermissionScope>,
}

impl PermissionDecision {
    fn allow(scope: PermissionScope, pattern: &str) -> Self {
        Self {
            allowed: true,
            reason: Some(format!("allowed by {scope} rule '{pattern}'")),
            requires_approval: false,
            scope: Some(scope),
        }
    }

    fn deny(scope: PermissionScope, category: PermissionCategory, pattern: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(format!("matches {scope} {category} deny pattern '{pattern}'")),
            requires_approval: false,
            scope: Some(scope),
        }
    }

    fn default_deny(category: PermissionCategory) -> Self {
        Self {
            allowed: false,
            reason: Some(format!("no {category} allow pattern matches")),
            requires_approval: false,
            scope: None,
        }
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Match a subject against a glob. `**/x` also matches `x` at the root.
fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let Ok(compiled) = Pattern::new(pattern) else {
        return false;
    };
    if compiled.matches_with(subject, MATCH_OPTIONS) {
        return true;
    }
    match pattern.strip_prefix("**/") {
        Some(rest) => pattern_matches(rest, subject),
        None => false,
    }
}

fn first_match<'a>(patterns: &'a [String], subject: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| pattern_matches(p, subject))
        .map(String::as_str)
}

/// Evaluates and persists permission rules for one working directory.
#[derive(Debug, Clone)]
pub struct PermissionManager {
    workdir: PathBuf,
    global_path: PathBuf,
    project_path: PathBuf,
    global: PermissionRuleSet,
    project: Option<PermissionRuleSet>,
}

impl PermissionManager {
    /// Load the global and project rule files once.
    pub fn load(paths: &KeelPaths, workdir: &Path) -> Result<Self> {
        let mut manager = Self {
            workdir: workdir.to_path_buf(),
            global_path: paths.global_permissions(),
            project_path: KeelPaths::project_permissions(workdir),
            global: PermissionRuleSet::defaults(),
            project: None,
        };
        manager.reload()?;
        Ok(manager)
    }

    /// Re-read both rule files from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.global = read_rules(&self.global_path)?.unwrap_or_else(PermissionRuleSet::defaults);
        self.project = read_rules(&self.project_path)?;
        tracing::debug!(
            global = %self.global_path.display(),
            project = self.project.is_some(),
            "Loaded permission rules"
        );
        Ok(())
    }

    pub fn global(&self) -> &PermissionRuleSet {
        &self.global
    }

    pub fn project(&self) -> Option<&PermissionRuleSet> {
        self.project.as_ref()
    }

    pub fn path_for(&self, scope: PermissionScope) -> &Path {
        match scope {
            PermissionScope::Global => &self.global_path,
            PermissionScope::Project => &self.project_path,
        }
    }

    pub fn can_read_file(&self, path: &str) -> PermissionDecision {
        self.check(PermissionCategory::FileRead, &self.relative_subject(path))
    }

    pub fn can_write_file(&self, path: &str) -> PermissionDecision {
        self.check(PermissionCategory::FileWrite, &self.relative_subject(path))
    }

    pub fn can_execute_command(&self, command: &str) -> PermissionDecision {
        self.check(PermissionCategory::ShellExecute, command.trim())
    }

    /// Decide a tool action the way the agent does: file paths are
    /// normalised against the working directory first.
    pub fn check_action(&self, category: PermissionCategory, subject: &str) -> PermissionDecision {
        match category {
            PermissionCategory::FileRead => self.can_read_file(subject),
            PermissionCategory::FileWrite => self.can_write_file(subject),
            PermissionCategory::ShellExecute => self.can_execute_command(subject),
        }
    }

    /// Evaluate a subject that is already normalised for its category.
    pub fn check(&self, category: PermissionCategory, subject: &str) -> PermissionDecision {
        let mut decision = self.evaluate(category, subject);
        if decision.allowed {
            let approval = self
                .project
                .iter()
                .chain(std::iter::once(&self.global))
                .find_map(|rules| first_match(&rules.require_approval, subject));
            if let Some(pattern) = approval {
                decision.requires_approval = true;
                decision.reason = Some(format!("requires approval ('{pattern}')"));
            }
        }
        tracing::debug!(%category, subject, allowed = decision.allowed, "Permission check");
        decision
    }

    fn evaluate(&self, category: PermissionCategory, subject: &str) -> PermissionDecision {
        let scopes = self
            .project
            .iter()
            .map(|rules| (PermissionScope::Project, rules))
            .chain(std::iter::once((PermissionScope::Global, &self.global)));

        for (scope, rules) in scopes {
            let list = rules.rules(category);
            if let Some(pattern) = first_match(&list.deny, subject) {
                return PermissionDecision::deny(scope, category, pattern);
            }
            if let Some(pattern) = first_match(&list.allow, subject) {
                return PermissionDecision::allow(scope, pattern);
            }
        }
        PermissionDecision::default_deny(category)
    }

    /// Path relative to the working directory with `.` and `..` folded.
    fn relative_subject(&self, path: &str) -> String {
        let path = Path::new(path);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        };
        let normalized = normalize_lexically(&joined);
        let workdir = normalize_lexically(&self.workdir);
        let relative = normalized
            .strip_prefix(&workdir)
            .map(Path::to_path_buf)
            .unwrap_or(normalized);
        relative.to_string_lossy().replace('\\', "/")
    }

    /// Add `pattern` to the allow list of `category` in `scope`, removing
    /// the same pattern from that scope's deny list.
    pub fn allow(
        &mut self,
        scope: PermissionScope,
        category: PermissionCategory,
        pattern: &str,
    ) -> Result<()> {
        self.mutate(scope, pattern, |rules| {
            let list = rules.rules_mut(category);
            list.deny.retain(|p| p != pattern);
            if !list.allow.iter().any(|p| p == pattern) {
                list.allow.push(pattern.to_string());
            }
        })
    }

    /// Add `pattern` to the deny list of `category` in `scope`, removing
    /// the same pattern from that scope's allow list.
    pub fn deny(
        &mut self,
        scope: PermissionScope,
        category: PermissionCategory,
        pattern: &str,
    ) -> Result<()> {
        self.mutate(scope, pattern, |rules| {
            let list = rules.rules_mut(category);
            list.allow.retain(|p| p != pattern);
            if !list.deny.iter().any(|p| p == pattern) {
                list.deny.push(pattern.to_string());
            }
        })
    }

    /// Global scope returns to the defaults; project scope drops the override file.
    pub fn reset(&mut self, scope: PermissionScope) -> Result<()> {
        let path = self.path_for(scope).to_path_buf();
        let _lock = lock(&path)?;
        match scope {
            PermissionScope::Global => {
                let defaults = PermissionRuleSet::defaults();
                write_rules(&path, &defaults)?;
                self.global = defaults;
            }
            PermissionScope::Project => {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.project = None;
            }
        }
        tracing::info!(%scope, "Reset permission rules");
        Ok(())
    }

    /// Read-modify-write one scope's file under its lock.
    fn mutate<F>(&mut self, scope: PermissionScope, pattern: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut PermissionRuleSet),
    {
        Pattern::new(pattern)
            .map_err(|e| KeelError::Config(format!("invalid pattern '{pattern}': {e}")))?;

        let path = self.path_for(scope).to_path_buf();
        let _lock = lock(&path)?;
        let mut rules = match (scope, read_rules(&path)?) {
            (_, Some(rules)) => rules,
            (PermissionScope::Global, None) => PermissionRuleSet::defaults(),
            (PermissionScope::Project, None) => PermissionRuleSet::default(),
        };
        apply(&mut rules);
        write_rules(&path, &rules)?;
        tracing::info!(%scope, pattern, path = %path.display(), "Updated permission rules");

        match scope {
            PermissionScope::Global => self.global = rules,
            PermissionScope::Project => self.project = Some(rules),
        }
        Ok(())
    }
}

fn read_rules(path: &Path) -> Result<Option<PermissionRuleSet>> {
    let rules: Option<PermissionRuleSet> =
        store::read_json(path).map_err(|e| KeelError::Config(format!("{e:#}")))?;
    if let Some(rules) = &rules {
        rules.validate(path)?;
    }
    Ok(rules)
}

fn write_rules(path: &Path, rules: &PermissionRuleSet) -> Result<()> {
    store::write_json_atomic(path, rules).map_err(|e| KeelError::Config(format!("{e:#}")))
}

fn lock(path: &Path) -> Result<FileLock> {
    FileLock::acquire(&store::lock_path_for(path))
        .map_err(|e| KeelError::Config(format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, TempDir, PermissionManager) {
        let home = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let paths = KeelPaths::new(home.path());
        let manager = PermissionManager::load(&paths, workdir.path()).unwrap();
        (home, workdir, manager)
    }

    #[test]
    fn test_pattern_matches_root_for_double_star() {
        assert!(pattern_matches("**/.env*", ".env"));
        assert!(pattern_matches("**/.env*", "config/.env.local"));
        assert!(pattern_matches("**/*", "src/main.rs"));
        assert!(pattern_matches("**/.git/**", ".git/config"));
        assert!(!pattern_matches("**/*.pem", "src/main.rs"));
    }

    #[test]
    fn test_deny_beats_allow_within_scope() {
        let (_home, _wd, manager) = setup();
        let decision = manager.can_read_file(".env");
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("**/.env*"));

        assert!(manager.can_read_file("src/lib.rs").allowed);
        assert!(!manager.can_write_file("keys/server.pem").allowed);
    }

    #[test]
    fn test_absolute_paths_are_made_relative() {
        let (_home, wd, manager) = setup();
        let abs = wd.path().join("nested").join(".env");
        assert!(!manager.can_read_file(&abs.to_string_lossy()).allowed);
        assert!(!manager.can_read_file("src/../.env").allowed);
    }

    #[test]
    fn test_commands() {
        let (_home, _wd, manager) = setup();
        assert!(manager.can_execute_command("cargo test").allowed);
        assert!(!manager.can_execute_command("sudo apt install x").allowed);
        assert!(!manager.can_execute_command("rm -rf /").allowed);

        let decision = manager.can_execute_command("rm notes.txt");
        assert!(decision.allowed);
        assert!(decision.requires_approval);

        let decision = manager.can_execute_command("git push origin main");
        assert!(decision.requires_approval);
    }

    #[test]
    fn test_default_closed_without_allow() {
        let home = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let rules = PermissionRuleSet {
            file_read: RuleList {
                allow: vec!["src/**".to_string()],
                deny: vec![],
            },
            ..Default::default()
        };
        store::write_json_atomic(&home.path().join("permissions.json"), &rules).unwrap();

        let manager = PermissionManager::load(&KeelPaths::new(home.path()), workdir.path()).unwrap();
        assert!(manager.can_read_file("src/a.rs").allowed);
        let decision = manager.can_read_file("README.md");
        assert!(!decision.allowed);
        assert_eq!(decision.scope, None);
        assert!(!manager.can_execute_command("ls").allowed);
    }

    #[test]
    fn test_project_allow_overrides_global_deny() {
        let (_home, wd, mut manager) = setup();
        assert!(!manager.can_read_file(".env").allowed);

        manager
            .allow(PermissionScope::Project, PermissionCategory::FileRead, ".env")
            .unwrap();
        let decision = manager.can_read_file(".env");
        assert!(decision.allowed);
        assert_eq!(decision.scope, Some(PermissionScope::Project));
        assert!(KeelPaths::project_permissions(wd.path()).exists());

        // Other secrets stay denied by the global scope
        assert!(!manager.can_read_file(".env.production").allowed);
    }

    #[test]
    fn test_check_action_normalizes_paths() {
        let (_home, wd, mut manager) = setup();
        manager
            .allow(PermissionScope::Project, PermissionCategory::FileRead, ".env")
            .unwrap();

        // The raw subject does not match the pattern, the action does
        assert!(!manager.check(PermissionCategory::FileRead, "./.env").allowed);
        assert!(manager.check_action(PermissionCategory::FileRead, "./.env").allowed);
        let abs = wd.path().join(".env");
        assert!(manager
            .check_action(PermissionCategory::FileRead, &abs.to_string_lossy())
            .allowed);
        assert!(manager
            .check_action(PermissionCategory::FileRead, "src/../.env")
            .allowed);
        assert!(manager
            .check_action(PermissionCategory::ShellExecute, "  cargo test ")
            .allowed);
    }

    #[test]
    fn test_project_deny_overrides_global_allow() {
        let (_home, _wd, mut manager) = setup();
        manager
            .deny(PermissionScope::Project, PermissionCategory::ShellExecute, "npm publish*")
            .unwrap();
        let decision = manager.can_execute_command("npm publish --access public");
        assert!(!decision.allowed);
        assert_eq!(decision.scope, Some(PermissionScope::Project));
    }

    #[test]
    fn test_mutations_persist_and_reload() {
        let (home, wd, mut manager) = setup();
        manager
            .deny(PermissionScope::Global, PermissionCategory::FileWrite, "dist/**")
            .unwrap();

        let reloaded = PermissionManager::load(&KeelPaths::new(home.path()), wd.path()).unwrap();
        assert!(!reloaded.can_write_file("dist/app.js").allowed);
        // Defaults were materialised alongside the new rule
        assert!(!reloaded.can_read_file(".env").allowed);
        assert!(reloaded.global().file_write.deny.contains(&"dist/**".to_string()));
    }

    #[test]
    fn test_allow_removes_same_pattern_from_deny() {
        let (_home, _wd, mut manager) = setup();
        manager
            .allow(PermissionScope::Global, PermissionCategory::FileRead, "**/*.pem")
            .unwrap();
        assert!(!manager.global().file_read.deny.contains(&"**/*.pem".to_string()));
        assert!(manager.can_read_file("cert.pem").allowed);
    }

    #[test]
    fn test_reset() {
        let (_home, wd, mut manager) = setup();
        manager
            .allow(PermissionScope::Project, PermissionCategory::FileRead, ".env")
            .unwrap();
        manager.reset(PermissionScope::Project).unwrap();
        assert!(manager.project().is_none());
        assert!(!KeelPaths::project_permissions(wd.path()).exists());
        assert!(!manager.can_read_file(".env").allowed);

        manager
            .allow(PermissionScope::Global, PermissionCategory::FileRead, "**/*.key")
            .unwrap();
        manager.reset(PermissionScope::Global).unwrap();
        assert_eq!(manager.global(), &PermissionRuleSet::defaults());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let home = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        std::fs::write(home.path().join("permissions.json"), "{\"fileRead\": 3}").unwrap();

        let err = PermissionManager::load(&KeelPaths::new(home.path()), workdir.path()).unwrap_err();
        assert!(matches!(err, KeelError::Config(_)));
        assert!(err.to_string().contains("permissions.json"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let (_home, _wd, mut manager) = setup();
        let err = manager
            .allow(PermissionScope::Global, PermissionCategory::FileRead, "[")
            .unwrap_err();
        assert!(matches!(err, KeelError::Config(_)));
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!(
            "read".parse::<PermissionCategory>().unwrap(),
            PermissionCategory::FileRead
        );
        assert_eq!(
            "shellExecute".parse::<PermissionCategory>().unwrap(),
            PermissionCategory::ShellExecute
        );
        assert!("network".parse::<PermissionCategory>().is_err());
    }

    #[test]
    fn test_rule_file_shape() {
        let json = serde_json::to_value(PermissionRuleSet::defaults()).unwrap();
        assert!(json["fileRead"]["deny"].is_array());
        assert!(json["shellExecute"]["allow"].is_array());
        assert!(json["requireApproval"].is_array());
    }
}
