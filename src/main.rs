//! core-agent main entry point
//!
//! This binary serves as the main entry point for the proxy core agent.
//! It handles CLI parsing, logging setup, and running the controller.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use core_agent::config::{AgentConfig, SetupMode, StartRequest};
use core_agent::{logging, Controller, APP_NAME, VERSION};

/// Lifecycle controller for an embedded network-proxy engine
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/core-agent/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up the core and serve the control API until interrupted
    Serve,

    /// Start an engine from a profile and keep it running until interrupted
    Run {
        /// Profile path
        profile: PathBuf,

        /// Disable the engine's memory limiter
        #[arg(long)]
        disable_memory_limit: bool,
    },

    /// Validate and normalize a profile
    Parse {
        /// Profile to read
        input: PathBuf,

        /// Where to write the normalized profile
        output: PathBuf,
    },

    /// Print the full configuration generated from a profile
    Generate {
        /// Profile path
        profile: PathBuf,

        /// Settings document (JSON) to apply
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    logging::init(cli.verbose);

    info!("Starting {} v{}", APP_NAME, VERSION);

    // Execute command
    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Run the CLI command
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => {
            info!("Starting agent with config: {:?}", cli.config);
            let config = AgentConfig::from_file(&cli.config)?;
            let mode = config.setup.mode;

            let controller = Controller::builder()
                .options(config.controller)
                .settings(config.settings)
                .build();
            controller.setup(config.setup).await?;

            match controller.control_server_addr().await {
                Some(addr) => info!("Control server ready on {}", addr),
                None => warn!("Setup mode {} runs no control server", mode),
            }

            shutdown_signal().await;
            info!("Shutting down agent");
            controller.close(mode).await?;
            Ok(())
        }
        Commands::Run {
            profile,
            disable_memory_limit,
        } => {
            let controller = Controller::default();
            let status = controller
                .start(StartRequest {
                    config_path: profile,
                    enable_old_command_server: false,
                    disable_memory_limit,
                })
                .await?;
            info!("Engine is {}", status.core_state);

            for group in controller.groups().await {
                info!(
                    "Group '{}' ({}): {} members, selected {:?}",
                    group.tag,
                    group.kind,
                    group.members.len(),
                    group.selected
                );
            }

            shutdown_signal().await;
            controller.stop().await?;
            controller.close(SetupMode::Embedded).await?;
            Ok(())
        }
        Commands::Parse { input, output } => {
            let controller = Controller::default();
            controller.parse(&output, Some(&input)).await?;
            println!("Wrote normalized profile to {}", output.display());
            Ok(())
        }
        Commands::Generate { profile, settings } => {
            let controller = Controller::default();
            if let Some(path) = settings {
                let json = tokio::fs::read_to_string(&path).await?;
                controller.change_settings(&json)?;
            }
            println!("{}", controller.generate_config(&profile).await?);
            Ok(())
        }
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            Ok(())
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
