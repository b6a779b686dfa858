use std::path::PathBuf;

use crate::config::ConfigLoader;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show {
        /// Extra config file layered on top
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Show configuration file paths
    Path,
    /// Check a single config file against the defaults
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

pub fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { config } => show_config(config),
        ConfigCommands::Path => show_paths(),
        ConfigCommands::Validate { file } => validate_config(file),
    }
}

fn show_config(explicit: Option<PathBuf>) -> Result<()> {
    let config = ConfigLoader::load_with(explicit.as_deref())?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths() -> Result<()> {
    println!("User config:    {:?}", ConfigLoader::user_config_path());
    println!("Project config: {:?}", ConfigLoader::project_config_path());
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    anyhow::ensure!(file.exists(), "Config file not found: {}", file.display());
    ConfigLoader::load_from_path(&file)?;
    println!("{} is valid", file.display());
    Ok(())
}
