//! runloop CLI, the main entry point.
//!
//! Commands:
//! - `run`     Execute one run over a conversation against the offline model
//! - `config`  Show or locate the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod offline;

#[derive(Parser)]
#[command(
    name = "runloop",
    about = "runloop: a streaming run execution engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run and print its event stream
    Run {
        /// Single user message to start the conversation with
        #[arg(short, long, conflicts_with = "conversation")]
        message: Option<String>,

        /// JSON file holding the conversation as `[{"role", "content"}]`
        #[arg(short, long)]
        conversation: Option<PathBuf>,

        /// Override the model name
        #[arg(long)]
        model: Option<String>,

        /// System instructions for the run
        #[arg(long)]
        instructions: Option<String>,

        /// Override the step budget
        #[arg(long)]
        max_steps: Option<u32>,

        /// Disable context-window truncation
        #[arg(long)]
        no_truncation: bool,

        /// Print only the streamed answer text
        #[arg(long)]
        text: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so the event stream on stdout stays machine-readable
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            message,
            conversation,
            model,
            instructions,
            max_steps,
            no_truncation,
            text,
        } => {
            commands::run::run(commands::run::RunOptions {
                message,
                conversation,
                model,
                instructions,
                max_steps,
                no_truncation,
                text,
            })
            .await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
