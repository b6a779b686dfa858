use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod config;
mod simulation;

#[derive(Parser)]
#[command(
    name = "arbiter",
    about = "Adaptive ensemble weighting with delayed-feedback learning"
)]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against a simulated transaction stream
    Run(commands::run::RunArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(if cli.verbose { "debug" } else { "info" }, cli.log_format)?;

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Config(args) => commands::config::run(args),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }

    Ok(())
}
