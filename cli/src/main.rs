//! `swarm` - drive language servers from the command line.
//!
//! Each document command opens the file in its workspace session, issues one
//! request, prints the result as JSON, and shuts the sessions down.

mod commands;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use swarm_lsp::SwarmConfig;

#[derive(Parser)]
#[command(name = "swarm")]
#[command(about = "Install and query language servers for a workspace")]
struct Cli {
    /// Config file (default: ~/.swarm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

/// A document and a zero-based position in it.
#[derive(Args, Debug, Clone)]
struct DocumentArgs {
    file: PathBuf,
    /// Language id (inferred from the file extension when omitted)
    #[arg(long)]
    language: Option<String>,
}

#[derive(Args, Debug, Clone, Copy)]
struct PositionArgs {
    /// Zero-based line
    #[arg(long)]
    line: u32,
    /// Zero-based UTF-16 column
    #[arg(long)]
    character: u32,
}

#[derive(Subcommand)]
enum Command {
    /// List catalog entries and whether they are installed
    Servers,
    /// Print this host's platform key
    Platform,
    /// Download and extract the server for a language
    Install { language: String },
    /// Hover information at a position
    Hover {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
    },
    /// Completion items at a position
    Completion {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
    },
    /// Go to definition
    Definition {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
    },
    /// Signature help at a call site
    SignatureHelp {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
    },
    /// Find references
    References {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
        /// Include the declaration itself
        #[arg(long)]
        include_declaration: bool,
    },
    /// Document symbols
    Symbols {
        #[command(flatten)]
        doc: DocumentArgs,
    },
    /// Code actions for a range
    CodeActions {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
        #[arg(long)]
        end_line: Option<u32>,
        #[arg(long)]
        end_character: Option<u32>,
    },
    /// Rename the symbol at a position
    Rename {
        #[command(flatten)]
        doc: DocumentArgs,
        #[command(flatten)]
        pos: PositionArgs,
        new_name: String,
    },
    /// Search symbols across the workspace that contains FILE
    WorkspaceSymbols {
        #[command(flatten)]
        doc: DocumentArgs,
        query: String,
    },
    /// Print the diagnostics the server publishes for a file
    Diagnostics {
        #[command(flatten)]
        doc: DocumentArgs,
        /// Seconds to wait for the first publish
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<SwarmConfig> {
    let loaded = match path {
        Some(path) => SwarmConfig::load_from(path),
        None => SwarmConfig::load(),
    }
    .context("loading configuration")?;
    Ok(loaded.unwrap_or_default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_ref())?;
    let config = load_config(cli.config.as_ref())?;

    commands::run(cli.command, &config.lsp).await
}
