//! Keel CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keel_cli::commands::{dispatch, Cli};
use keel_core::KeelError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // --verbose wins over RUST_LOG; "keel" prefixes every crate target
    let filter = if cli.verbose {
        EnvFilter::new("keel=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        let code = match e.downcast_ref::<KeelError>() {
            Some(err) => {
                if let Some(hint) = err.hint() {
                    eprintln!("Hint: {hint}");
                }
                err.exit_code()
            }
            None => 1,
        };
        std::process::exit(code);
    }
}
