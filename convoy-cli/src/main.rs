use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convoy_core::{DockerCli, EngineConfig, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

mod commands;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Minimal multi-container orchestration engine", long_about = None)]
struct Cli {
    /// Compose file (defaults to compose.yaml or docker-compose.yml in the current directory)
    #[arg(short, long, global = true, env = "CONVOY_FILE")]
    file: Option<PathBuf>,

    /// Project name (defaults to the compose file's directory name)
    #[arg(short, long, global = true, env = "CONVOY_PROJECT_NAME")]
    project_name: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start every service in dependency order
    Up {
        /// Build images before starting, even if they exist
        #[arg(long)]
        build: bool,

        /// Run in background
        #[arg(short, long)]
        detach: bool,
    },

    /// Stop running services without removing them
    Stop,

    /// Stop and remove containers and networks
    Down {
        /// Also remove named volumes
        #[arg(short, long)]
        volumes: bool,
    },

    /// List services and their state
    Ps,

    /// Print the resolved compose file
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            commands::report_error(&e);
            ExitCode::from(commands::exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;

    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    convoy_core::observability::init(level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let manifest =
        commands::compose::load_manifest(cli.file.as_deref(), cli.project_name.as_deref())?;
    let runtime = Arc::new(DockerCli::new(config.runtime_binary.clone()));
    let orchestrator = Orchestrator::new(manifest, runtime, &config);

    match cli.command {
        Commands::Up { build, detach } => {
            commands::compose::up(&orchestrator, detach, build).await?;
        }

        Commands::Stop => {
            commands::compose::stop(&orchestrator).await?;
        }

        Commands::Down { volumes } => {
            commands::compose::down(&orchestrator, volumes).await?;
        }

        Commands::Ps => {
            commands::compose::ps(&orchestrator).await?;
        }

        Commands::Config => {
            commands::compose::config(&orchestrator)?;
        }
    }

    Ok(())
}
