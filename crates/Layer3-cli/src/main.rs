//! Webpilot CLI - Main entry point

mod cli;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webpilot_foundation::{ConfigScope, Error, WebpilotConfig};

/// Webpilot - run AI browser automation tasks
#[derive(Parser, Debug)]
#[command(name = "webpilot")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task per instruction and wait for all of them
    Run(cli::RunArgs),
    /// Inspect or create configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Write the project file (.webpilot/config.json) instead of the global one
        #[arg(short, long)]
        project: bool,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match args.command {
        Command::Run(run) => {
            let config = WebpilotConfig::load()?;
            let failed = cli::run(config, run).await?;
            if failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let config = WebpilotConfig::load()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Init { project, force } => init_config(project, force)?,
        },
    }

    Ok(())
}

/// Write the default configuration
fn init_config(project: bool, force: bool) -> anyhow::Result<()> {
    let scope = if project {
        ConfigScope::Project
    } else {
        ConfigScope::Global
    };

    match WebpilotConfig::default().save(scope, force) {
        Ok(path) => {
            println!("✓ Wrote {}", path.display());
            Ok(())
        }
        Err(Error::InvalidState(message)) => {
            anyhow::bail!("{} (use --force to overwrite)", message)
        }
        Err(e) => Err(e.into()),
    }
}
