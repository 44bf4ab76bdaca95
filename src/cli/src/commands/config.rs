//! `keel config` subcommands - Inspect and edit permission rules.
//!
//! Rule edits go to the project override (`.keel/permissions.json`) unless
//! `--global` is given.

use clap::{Args, Subcommand};
use keel_code::permissions::{
    PermissionCategory, PermissionDecision, PermissionManager, PermissionRuleSet, PermissionScope,
};

use super::Context;
use crate::output::new_table;

/// Manage configuration.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Manage permission rules
    Permissions(PermissionsArgs),
}

#[derive(Args)]
pub struct PermissionsArgs {
    #[command(subcommand)]
    pub command: PermissionsCommand,
}

/// Permission subcommands.
#[derive(Subcommand)]
pub enum PermissionsCommand {
    /// Show global and project rules
    List,
    /// Allow a pattern (fileRead, fileWrite, shellExecute)
    Allow(RuleArgs),
    /// Deny a pattern (fileRead, fileWrite, shellExecute)
    Deny(RuleArgs),
    /// Check whether an action would be allowed
    Test(TestArgs),
    /// Reset rules of one scope
    Reset(ScopeArgs),
}

#[derive(Args)]
pub struct ScopeArgs {
    /// Apply to the global rules file
    #[arg(long, conflicts_with = "project")]
    pub global: bool,

    /// Apply to this project's override file (default)
    #[arg(long)]
    pub project: bool,
}

impl ScopeArgs {
    fn scope(&self) -> PermissionScope {
        if self.global {
            PermissionScope::Global
        } else {
            PermissionScope::Project
        }
    }
}

#[derive(Args)]
pub struct RuleArgs {
    /// Rule category (fileRead, fileWrite, shellExecute)
    pub category: PermissionCategory,

    /// Glob pattern, e.g. "src/**" or "cargo *"
    pub pattern: String,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

#[derive(Args)]
pub struct TestArgs {
    /// Kind of action (read, write, command)
    pub kind: PermissionCategory,

    /// Path or command to check
    pub value: String,
}

/// Dispatch config subcommands.
pub async fn execute(args: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        ConfigCommand::Permissions(a) => execute_permissions(a),
    }
}

fn execute_permissions(args: PermissionsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load()?;
    let mut manager = PermissionManager::load(&ctx.paths, &ctx.workdir)?;

    match args.command {
        PermissionsCommand::List => {
            print_rules(&manager, PermissionScope::Global, Some(manager.global()));
            println!();
            print_rules(&manager, PermissionScope::Project, manager.project());
        }
        PermissionsCommand::Allow(a) => {
            let scope = a.scope.scope();
            manager.allow(scope, a.category, &a.pattern)?;
            println!("Allowed {} '{}' ({scope})", a.category, a.pattern);
        }
        PermissionsCommand::Deny(a) => {
            let scope = a.scope.scope();
            manager.deny(scope, a.category, &a.pattern)?;
            println!("Denied {} '{}' ({scope})", a.category, a.pattern);
        }
        PermissionsCommand::Test(a) => {
            let decision = manager.check_action(a.kind, &a.value);
            println!("{}", describe(a.kind, &a.value, &decision));
        }
        PermissionsCommand::Reset(a) => {
            let scope = a.scope();
            manager.reset(scope)?;
            println!("Reset {scope} permission rules");
        }
    }
    Ok(())
}

fn print_rules(manager: &PermissionManager, scope: PermissionScope, rules: Option<&PermissionRuleSet>) {
    println!("{scope} ({})", manager.path_for(scope).display());
    let Some(rules) = rules else {
        println!("  no rules");
        return;
    };

    let mut table = new_table(&["CATEGORY", "ALLOW", "DENY"]);
    for category in PermissionCategory::ALL {
        let list = rules.rules(category);
        table.add_row(vec![
            category.to_string(),
            list.allow.join("\n"),
            list.deny.join("\n"),
        ]);
    }
    println!("{table}");
    if !rules.require_approval.is_empty() {
        println!("requireApproval: {}", rules.require_approval.join(", "));
    }
}

fn describe(category: PermissionCategory, value: &str, decision: &PermissionDecision) -> String {
    let verdict = match (decision.allowed, decision.requires_approval) {
        (true, true) => "allowed (requires approval)",
        (true, false) => "allowed",
        (false, _) => "denied",
    };
    let mut out = format!("{category} {value}: {verdict}");
    if let Some(reason) = &decision.reason {
        out.push_str(&format!("\n  reason: {reason}"));
    }
    if let Some(scope) = decision.scope {
        out.push_str(&format!("\n  scope: {scope}"));
    }
    out
}
