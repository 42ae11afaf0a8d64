//! Tiller CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tiller_cycle::modules::builtin_registry;
use tiller_process::{check_config, send_directive, ControllerOptions, Directive, ProcessController};

#[derive(Parser)]
#[command(name = "tiller")]
#[command(about = "Generational control-plane runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master process
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "tiller.yaml")]
        config: PathBuf,

        /// Inline configuration fragment, applied after the file
        #[arg(short = 'g', long, default_value = "")]
        param: String,

        /// Installation prefix
        #[arg(short, long, default_value = ".")]
        prefix: PathBuf,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Validate the configuration file and exit
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "tiller.yaml")]
        config: PathBuf,

        /// Installation prefix
        #[arg(short, long, default_value = ".")]
        prefix: PathBuf,
    },

    /// Send a control directive to a running master
    Signal {
        /// Directive: reload, quit, stop, reopen, upgrade
        directive: Directive,

        /// Path to the master's pid file
        #[arg(long, default_value = "tiller.pid")]
        pid_file: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            param,
            prefix,
            log_level,
        } => {
            init_tracing(&log_level)?;

            tracing::info!(config = %config.display(), "starting tiller");

            let registry = Arc::new(builtin_registry()?);
            let mut options = ControllerOptions::new(config, prefix);
            options.conf_param = param;
            options.args = std::env::args().skip(1).collect();

            let controller = ProcessController::start(registry, options)?;
            controller.run().await?;

            tracing::info!("stopped");
            Ok(())
        }

        Commands::Check { config, prefix } => {
            tracing_subscriber::fmt().with_target(false).init();

            let registry = Arc::new(builtin_registry()?);
            let options = ControllerOptions::new(&config, prefix);

            match check_config(registry, &options) {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::error!(config = %config.display(), error = %e, "configuration test failed");
                    std::process::exit(1);
                }
            }
        }

        Commands::Signal {
            directive,
            pid_file,
        } => {
            tracing_subscriber::fmt().with_target(false).init();
            send_directive(pid_file, directive)?;
            Ok(())
        }

        Commands::Version => {
            println!("tiller {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("TILLER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    Ok(())
}
