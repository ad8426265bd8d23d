use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imbridge_core::config::Config;
use imbridge_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use imbridge_core::state::{FileStateStore, StateStore};
use tracing::{info, warn};

mod demo;

#[derive(Parser, Debug)]
#[command(name = "imbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); environment variables are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the effective settings
    CheckConfig,
    /// Print the persisted session state
    ShowState {
        /// State file; defaults to the configured path
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Run a scripted session against the in-memory protocol engine
    Demo {
        /// Text sent to the demo contact
        #[arg(default_value = "Hello from imbridge!")]
        message: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env().context("reading IMBRIDGE_* environment")?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    let log_config = LogConfig::try_from(&config.logging).unwrap_or_else(|e| {
        eprintln!("{}, using 'info'", e);
        LogConfig::new(LogLevel::Info).json_format(config.logging.json_format)
    });
    init_logging_with_config(log_config)?;
    imbridge_core::metrics::init_metrics();

    match args.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            info!("Configuration is valid");
        }
        Command::ShowState { path } => {
            let Some(path) = path.or_else(|| config.state.path.clone()) else {
                anyhow::bail!("no state path given and none configured");
            };
            match FileStateStore::new(&path).load() {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => {
                    warn!(path = %path.display(), "No usable state");
                    println!("no persisted state (fresh session)");
                }
            }
        }
        Command::Demo { message } => {
            let summary = demo::run(config, &message).await?;
            println!("{}", summary);
        }
    }

    Ok(())
}
