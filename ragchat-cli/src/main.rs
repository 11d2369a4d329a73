//! Ragchat CLI: terminal client for a retrieval-augmented documentation chat.
//!
//! Provides both single-question and interactive REPL modes.

mod commands;
mod repl;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ragchat: ask questions, get answers grounded in your documentation
#[derive(Parser, Debug)]
#[command(name = "ragchat", version, about, long_about = None)]
struct Cli {
    /// Question to ask (starts interactive mode if omitted)
    question: Option<String>,

    /// Base URL of the chat server
    #[arg(short, long)]
    base_url: Option<String>,

    /// Named prompt to fetch from the server instead of the built-in one
    #[arg(short, long)]
    prompt: Option<String>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Session storage file
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Neither restore nor save the conversation
    #[arg(long)]
    no_persist: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,
    /// Print the saved conversation
    History {
        /// Print raw JSON instead of a transcript
        #[arg(long)]
        json: bool,
    },
    /// Delete the saved conversation
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "ragchat", "ragchat")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ragchat.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // Load configuration
    let mut config = ragchat_core::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Apply CLI overrides
    if let Some(base_url) = &cli.base_url {
        config.endpoint.base_url = base_url.clone();
    }
    if let Some(prompt) = &cli.prompt {
        config.prompt.name = Some(prompt.clone());
    }
    if let Some(storage) = &cli.storage {
        config.storage.path = Some(storage.clone());
    }

    config.ensure_valid()?;

    if let Some(command) = cli.command {
        return commands::handle_command(command, &config);
    }

    if let Some(question) = cli.question {
        repl::run_single_question(&question, config, !cli.no_persist).await
    } else {
        repl::run_interactive(config, !cli.no_persist).await
    }
}
