//! CLI command definitions and dispatch.

mod agent;
mod checkpoint;
mod config;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel_core::{KeelPaths, Settings};

/// Keel - a local coding agent with permissions, sandboxing and checkpoints.
#[derive(Parser)]
#[command(name = "keel", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the agent on a task in the current directory
    Agent(agent::AgentArgs),
    /// Create, list and restore checkpoints of the current directory
    Checkpoint(checkpoint::CheckpointArgs),
    /// Manage saved agent sessions
    Session(session::SessionArgs),
    /// Inspect and edit configuration
    Config(config::ConfigArgs),
}

/// Everything a command needs to know about where it runs.
pub(crate) struct Context {
    pub paths: KeelPaths,
    pub settings: Settings,
    /// Canonical current working directory
    pub workdir: PathBuf,
}

impl Context {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let paths = KeelPaths::from_env();
        let settings = Settings::load(&paths.settings_file())?;
        let workdir = std::env::current_dir()?.canonicalize()?;
        tracing::debug!(home = %paths.home().display(), workdir = %workdir.display(), "Loaded context");
        Ok(Self {
            paths,
            settings,
            workdir,
        })
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Agent(args) => agent::execute(args).await,
        Command::Checkpoint(args) => checkpoint::execute(args).await,
        Command::Session(args) => session::execute(args).await,
        Command::Config(args) => config::execute(args).await,
    }
}
