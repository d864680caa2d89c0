mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use stratus_controller::config::ControllerConfig;

#[derive(Parser)]
#[command(
    name = "stratusd",
    version,
    about = "Control plane for a multi-tenant VM/container compute cluster"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Run {
        /// Path to the controller TOML config
        #[arg(long)]
        config: PathBuf,
        /// Log output format: human or json
        #[arg(long, default_value = "human")]
        log_format: String,
    },
    /// Validate a config file and exit
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_format } => {
            logging::init(logging::LogFormat::from_flag(&log_format));
            let config = ControllerConfig::from_file(&config)?;
            stratus_controller::server::serve(config).await
        }
        Commands::CheckConfig { config } => {
            ControllerConfig::from_file(&config)?;
            println!("[stratusd] Config OK: {}", config.display());
            Ok(())
        }
    }
}
