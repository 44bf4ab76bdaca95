//! `keel session` subcommands - Manage saved agent sessions.
//!
//! Ids may be abbreviated to any unique prefix.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use keel_code::session::{
    CreateSessionOptions, ExportFormat, Message, Session, SessionContext, SessionManager,
};
use keel_core::AgentConfig;

use super::Context;
use crate::output::{excerpt, format_ago, format_tokens, new_table};
use crate::prompt;

/// Manage sessions.
#[derive(Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub command: SessionCommand,
}

/// Session subcommands.
#[derive(Subcommand)]
pub enum SessionCommand {
    /// List sessions, most recently active first
    List(ListArgs),
    /// Start a new empty session in the current directory
    Start(StartArgs),
    /// Pick up a session (the latest one in this directory by default)
    Resume(ResumeArgs),
    /// Show a session and its recent messages
    Show(ShowArgs),
    /// Delete a session
    Delete(DeleteArgs),
    /// Export a session transcript
    Export(ExportArgs),
    /// Remove old sessions
    Cleanup(CleanupArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Show at most this many sessions
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct StartArgs {
    /// Session name
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct ResumeArgs {
    /// Session id or prefix
    pub id: Option<String>,
}

#[derive(Args)]
pub struct ShowArgs {
    /// Session id or prefix (defaults to the latest in this directory)
    pub id: Option<String>,

    /// Number of most recent messages to print
    #[arg(short, long, default_value_t = 10)]
    pub messages: usize,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Session id or prefix
    pub id: String,

    /// Delete without asking
    #[arg(short, long, visible_alias = "yes", short_alias = 'y')]
    pub force: bool,
}

#[derive(Args)]
pub struct ExportArgs {
    /// Session id or prefix
    pub id: String,

    /// Output format (json, markdown)
    #[arg(long, default_value = "json")]
    pub format: ExportFormat,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Remove sessions idle for more than this many days
    #[arg(long)]
    pub days: Option<u32>,

    /// Keep at most this many sessions
    #[arg(long)]
    pub max: Option<usize>,
}

/// Dispatch session subcommands.
pub async fn execute(args: SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load()?;
    let manager = SessionManager::open(&ctx.paths);

    match args.command {
        SessionCommand::List(a) => execute_list(&manager, a),
        SessionCommand::Start(a) => execute_start(&manager, &ctx, a),
        SessionCommand::Resume(a) => execute_resume(&manager, &ctx, a),
        SessionCommand::Show(a) => execute_show(&manager, &ctx, a),
        SessionCommand::Delete(a) => execute_delete(&manager, a),
        SessionCommand::Export(a) => execute_export(&manager, a),
        SessionCommand::Cleanup(a) => execute_cleanup(&manager, &ctx, a),
    }
}

fn execute_list(manager: &SessionManager, args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = manager.list_sessions(args.limit)?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    let mut table = new_table(&["ID", "NAME", "DIRECTORY", "MESSAGES", "TOKENS", "UPDATED"]);
    for session in &sessions {
        table.add_row(vec![
            session.short_id().to_string(),
            excerpt(&session.name, 40),
            session.working_directory.display().to_string(),
            session.message_count.to_string(),
            format_tokens(session.total_tokens),
            format_ago(&session.updated_at),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn execute_start(
    manager: &SessionManager,
    ctx: &Context,
    args: StartArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::from_settings(&ctx.settings.agent);
    let session = manager.create_session(CreateSessionOptions {
        name: args.name,
        working_directory: ctx.workdir.clone(),
        mode: config.mode,
        provider: config.provider,
        model: config.model,
    })?;
    println!("Started session {} ({})", session.id, session.name);
    println!("Continue it with: keel agent --session {} <prompt>", session.short_id());
    Ok(())
}

fn execute_resume(
    manager: &SessionManager,
    ctx: &Context,
    args: ResumeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = manager.resume(args.id.as_deref(), &ctx.workdir)?;
    let context = manager.get_session_context(&session.id)?;
    print_summary(&context.session, context.total_tokens);
    print_messages(&context, 3);
    println!();
    println!("Continue it with: keel agent --session {} <prompt>", session.short_id());
    Ok(())
}

fn execute_show(
    manager: &SessionManager,
    ctx: &Context,
    args: ShowArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = manager.resume(args.id.as_deref(), &ctx.workdir)?;
    let context = manager.get_session_context(&session.id)?;
    print_summary(&context.session, context.total_tokens);
    print_messages(&context, args.messages);
    Ok(())
}

fn execute_delete(manager: &SessionManager, args: DeleteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = manager.get_session(&args.id)?;
    if !args.force {
        let question = format!(
            "Delete session {} ({}, {} messages)?",
            session.short_id(),
            session.name,
            session.message_count
        );
        if !prompt::confirm(&question)? {
            return Err("delete aborted (use --force to skip this prompt)".into());
        }
    }
    let removed = manager.delete_session(&session.id)?;
    println!("Deleted session {}", removed.id);
    Ok(())
}

fn execute_export(manager: &SessionManager, args: ExportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rendered = manager.export(&args.id, args.format)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, rendered)?;
            println!("Exported session to {}", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn execute_cleanup(
    manager: &SessionManager,
    ctx: &Context,
    args: CleanupArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let days = args.days.unwrap_or(ctx.settings.retention.max_age_days);
    let max = args.max.unwrap_or(ctx.settings.retention.max_sessions);
    let removed = manager.cleanup_old_sessions(days, max)?;
    if removed.is_empty() {
        println!("Nothing to clean up");
    } else {
        println!("Removed {} sessions", removed.len());
    }
    Ok(())
}

fn print_summary(session: &Session, total_tokens: u64) {
    println!("Session:   {}", session.id);
    println!("Name:      {}", session.name);
    println!("Directory: {}", session.working_directory.display());
    if let Some(branch) = &session.git_branch {
        println!("Branch:    {branch}");
    }
    println!(
        "Model:     {} / {} ({})",
        session.provider, session.model, session.mode
    );
    println!("Messages:  {}", session.message_count);
    println!("Tokens:    {}", format_tokens(total_tokens));
    println!("Created:   {}", format_ago(&session.created_at));
    println!("Updated:   {}", format_ago(&session.updated_at));
}

fn print_messages(context: &SessionContext, count: usize) {
    if count == 0 || context.messages.is_empty() {
        return;
    }
    let skip = context.messages.len().saturating_sub(count);
    println!();
    for message in &context.messages[skip..] {
        println!("{}", message_line(message));
    }
}

fn message_line(message: &Message) -> String {
    let mut line = format!("[{}] {}", message.role, excerpt(&message.content, 100));
    if !message.tool_calls.is_empty() {
        let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
        line.push_str(&format!(" (calls: {})", names.join(", ")));
    }
    if message.is_error {
        line.push_str(" (error)");
    }
    line
}
