//! `keel agent` command - Run the coding agent on a task.
//!
//! Flags override `settings.json`; the resulting configuration is validated
//! before any provider client, sandbox or session is created. Streaming text
//! goes to stdout, tool activity and approval prompts to stderr.

use std::io::Write;
use std::sync::Arc;

use clap::Args;
use keel_code::agent::{AgentEvent, AgentLoop, TerminalOutcome};
use keel_code::checkpoint::CheckpointManager;
use keel_code::llm::{self, GenerationOptions, LlmConfig};
use keel_code::permissions::PermissionManager;
use keel_code::sandbox::Sandbox;
use keel_code::session::{CreateSessionOptions, SessionManager};
use keel_code::tools::ToolExecutor;
use keel_core::{AgentConfig, AgentMode, Provider, SandboxMode, Settings};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Context;
use crate::output::{excerpt, format_tokens};
use crate::prompt::ConsoleApproval;

#[derive(Args)]
pub struct AgentArgs {
    /// Task for the agent
    pub prompt: String,

    /// Execution mode (local, hybrid, cloud)
    #[arg(long)]
    pub mode: Option<AgentMode>,

    /// Model provider (anthropic, openai, google)
    #[arg(long)]
    pub provider: Option<Provider>,

    /// Model name (defaults to the provider's default model)
    #[arg(long)]
    pub model: Option<String>,

    /// Skip approval prompts for actions that would require them
    #[arg(long)]
    pub auto_approve: bool,

    /// Maximum model round-trips
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Sampling temperature (0.0 - 2.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum tokens per model response
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Isolation for shell commands (none, basic, container)
    #[arg(long)]
    pub sandbox: Option<SandboxMode>,

    /// Continue an existing session (id or unique prefix)
    #[arg(long)]
    pub session: Option<String>,

    /// Do not snapshot or record operations for this run
    #[arg(long)]
    pub no_checkpoint: bool,
}

/// Merge flags over settings into the configuration for this run.
fn build_config(args: &AgentArgs, settings: &Settings) -> AgentConfig {
    let mut config = AgentConfig::from_settings(&settings.agent);

    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(provider) = args.provider {
        if provider != config.provider {
            // A model configured for another provider would not resolve
            config.model = provider.default_model().to_string();
        }
        config.provider = provider;
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = max_tokens;
    }
    config.auto_approve = args.auto_approve;
    if args.no_checkpoint {
        config.auto_checkpoint = false;
    }
    config
}

pub async fn execute(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load()?;
    let config = build_config(&args, &ctx.settings);
    config.validate()?;

    let llm = llm::create_client(
        LlmConfig::from_env(config.provider, &config.model)?.with_options(GenerationOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }),
    );
    let permissions = Arc::new(PermissionManager::load(&ctx.paths, &ctx.workdir)?);

    let sandbox_mode = args.sandbox.unwrap_or(ctx.settings.sandbox.mode);
    // Falls back to basic isolation with a warning when no container runtime answers
    let sandbox = Sandbox::new(sandbox_mode, ctx.settings.sandbox.clone(), &ctx.workdir).await;
    let executor = Arc::new(ToolExecutor::new(Arc::new(sandbox)));

    let sessions = Arc::new(SessionManager::open(&ctx.paths));
    let session = match &args.session {
        Some(id) => sessions.get_session(id)?,
        None => sessions.create_session(CreateSessionOptions {
            name: Some(excerpt(&args.prompt, 60)),
            working_directory: ctx.workdir.clone(),
            mode: config.mode,
            provider: config.provider,
            model: config.model.clone(),
        })?,
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current step...");
            interrupt.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(rx));

    let mut agent = AgentLoop::new(llm, executor, permissions)
        .with_session(sessions, session.id.clone())
        .with_approval(Arc::new(ConsoleApproval))
        .with_events(tx)
        .with_cancellation(cancel);
    if !args.no_checkpoint {
        agent = agent.with_checkpoints(Arc::new(CheckpointManager::open(
            &ctx.paths,
            &ctx.workdir,
            &ctx.settings.checkpoint,
        )));
    }

    let report = agent.run(&args.prompt, &config).await;
    // Closing the channel lets the printer drain and exit
    drop(agent);
    let _ = printer.await;
    let report = report?;

    eprintln!(
        "session {} | {} iterations | {} tool calls | {} tokens",
        session.short_id(),
        report.iterations,
        report.tool_calls,
        format_tokens(report.usage.total_tokens as u64)
    );

    match report.outcome {
        TerminalOutcome::Done { .. } => Ok(()),
        TerminalOutcome::Failed { reason } => Err(format!("agent run failed: {reason}").into()),
        TerminalOutcome::Cancelled => Err("agent run cancelled".into()),
    }
}

/// Render agent events until the channel closes.
async fn print_events(mut rx: mpsc::Receiver<AgentEvent>) {
    let mut mid_line = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta { text } => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
                mid_line = !text.ends_with('\n');
            }
            AgentEvent::ToolStart { summary, .. } => {
                end_line(&mut mid_line);
                eprintln!("> {summary}");
            }
            AgentEvent::ToolEnd {
                name,
                output,
                success: false,
                ..
            } => {
                eprintln!("  {name} failed: {}", excerpt(&output, 120));
            }
            AgentEvent::PermissionDenied { name, reason, .. } => {
                end_line(&mut mid_line);
                eprintln!("  {name} denied: {reason}");
            }
            AgentEvent::ApprovalResolved {
                approved: false, ..
            } => {
                eprintln!("  declined");
            }
            AgentEvent::CheckpointCreated { id, message } => {
                end_line(&mut mid_line);
                let short = id.get(..8).unwrap_or(&id);
                eprintln!("checkpoint {short}: {message}");
            }
            AgentEvent::End { outcome, .. } => {
                end_line(&mut mid_line);
                if let TerminalOutcome::Failed { reason } = outcome {
                    tracing::debug!("Run ended with failure: {}", reason);
                }
            }
            _ => {}
        }
    }
}

fn end_line(mid_line: &mut bool) {
    if *mid_line {
        println!();
        *mid_line = false;
    }
}
