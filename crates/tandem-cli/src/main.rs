//! Tandem CLI - one process of a lockstep shard pool
//!
//! Rank 0 runs the chat console and disseminates each request; every other
//! rank waits for requests and generates in lockstep.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use tracing::{debug, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

mod backend;
mod commands;
mod config;
mod utils;

use commands::{info::InfoCommand, init::InitCommand, serve::ServeCommand, Command};
use tandem_core::config::TandemConfig;

#[derive(Parser)]
#[command(
    name = "tandem",
    version = env!("CARGO_PKG_VERSION"),
    about = "Lockstep chat generation over a pool of model shards",
    long_about = "Starts one rank of a shard pool. Rank 0 reads chat messages and streams replies; the other ranks follow its broadcasts and generate in lockstep."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start this rank of the pool
    #[command(name = "serve", alias = "s")]
    Serve(ServeCommand),

    /// Show the resolved configuration and shard layout
    #[command(name = "info", alias = "i")]
    Info(InfoCommand),

    /// Write a configuration file with default settings
    #[command(name = "init")]
    Init(InitCommand),
}

impl Commands {
    fn as_command(&self) -> &dyn Command {
        match self {
            Commands::Serve(cmd) => cmd,
            Commands::Info(cmd) => cmd,
            Commands::Init(cmd) => cmd,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let command = cli.command.as_command();

    let mut config = if command.needs_config() {
        config::load(cli.config.as_deref())?
    } else {
        TandemConfig::default()
    };
    command.apply_overrides(&mut config);

    init_logging(&cli, &config)?;
    debug!("Tandem CLI v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Configuration loaded: {:?}", config);

    let span = info_span!("tandem", rank = config.cluster.rank);
    command
        .execute(&config, cli.json)
        .instrument(span)
        .await?;

    if !cli.quiet {
        info!("Command completed successfully");
    }
    Ok(())
}

/// Flags win, then `RUST_LOG`, then `[logging].level` from the config file
fn init_logging(cli: &Cli, config: &TandemConfig) -> Result<()> {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()))
    };

    // stdout belongs to the chat console
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;
    Ok(())
}
