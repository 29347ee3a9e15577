//! lodectl CLI - Recover and control interrupted bulk loads.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use lodectl::models::{BackendKind, SwitchMode, EXAMPLE_CONFIG};
use lodectl::recovery::{fail, LiveConnector, ProcessExit};
use lodectl::{execute, Action, CommandContext, Config, LodeError, TableScope};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "lodectl.toml";

#[derive(Parser)]
#[command(name = "lodectl")]
#[command(version)]
#[command(about = "Recovery and control plane for interrupted bulk loads")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file [default: lodectl.toml if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compact every storage node at all levels
    Compact,

    /// Switch every storage node to import or normal mode
    SwitchMode {
        /// import | normal
        mode: String,
    },

    /// Print the current mode of every storage node
    FetchMode,

    /// Force-close an engine and import it
    ImportEngine {
        /// `db`.`table`:engine_id or engine UUID
        engine: String,
    },

    /// Force-close an engine and clean it up
    CleanupEngine {
        /// `db`.`table`:engine_id or engine UUID
        engine: String,
    },

    /// Remove checkpoints
    CheckpointRemove {
        /// "all" or `db`.`table`
        table: String,
    },

    /// Clear recorded errors so a resumed load retries the tables
    CheckpointErrorIgnore {
        /// "all" or `db`.`table`
        table: String,
    },

    /// Drop errored tables with their checkpoints and engines
    CheckpointErrorDestroy {
        /// "all" or `db`.`table`
        table: String,
    },

    /// Dump checkpoints as CSV into a directory
    CheckpointDump {
        /// Output directory
        dir: PathBuf,
    },

    /// List tables whose data exists only in local intermediate files
    CheckLocalStorage,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

impl Commands {
    fn into_action(self) -> std::result::Result<Action, LodeError> {
        Ok(match self {
            Commands::Compact => Action::Compact,
            Commands::SwitchMode { mode } => Action::SwitchMode(mode.parse::<SwitchMode>()?),
            Commands::FetchMode => Action::FetchMode,
            Commands::ImportEngine { engine } => Action::ImportEngine(engine),
            Commands::CleanupEngine { engine } => Action::CleanupEngine(engine),
            Commands::CheckpointRemove { table } => {
                Action::CheckpointRemove(table.parse::<TableScope>()?)
            }
            Commands::CheckpointErrorIgnore { table } => {
                Action::CheckpointErrorIgnore(table.parse::<TableScope>()?)
            }
            Commands::CheckpointErrorDestroy { table } => {
                Action::CheckpointErrorDestroy(table.parse::<TableScope>()?)
            }
            Commands::CheckpointDump { dir } => Action::CheckpointDump(dir),
            Commands::CheckLocalStorage => Action::CheckLocalStorage,
            Commands::Validate | Commands::Example => {
                return Err(LodeError::Internal(
                    "command does not map to a recovery action".to_string(),
                ));
            }
        })
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {e}");
    }
}

/// Load the explicit config, else `lodectl.toml` if present, else defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => {
            info!("No configuration file, using defaults");
            return Ok(Config::default());
        }
    };
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Example => {
            println!("{EXAMPLE_CONFIG}");
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            info!("Configuration is valid");
            info!("  Backend: {}", config.importer.backend);
            if config.importer.backend == BackendKind::Local {
                info!("  Sorted KV dir: {}", config.importer.sorted_kv_dir.display());
            } else {
                info!("  Importer: {}", config.importer.addr);
            }
            info!("  Placement driver: {}", config.cluster.pd_addr);
            info!(
                "  Checkpoints: {} ({})",
                if config.checkpoint.enable { "enabled" } else { "disabled" },
                config.checkpoint.path.display()
            );
            return Ok(());
        }

        command => {
            let config = load_config(cli.config.as_deref())?;
            let ctx = CommandContext::new(
                config,
                Arc::new(LiveConnector),
                Arc::new(ProcessExit),
                Box::new(std::io::stderr()),
            )
            .with_progress(true);

            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling");
                    cancel.cancel();
                }
            });

            match command.into_action() {
                Ok(action) => execute(&ctx, &action).await,
                Err(e) => fail(&ctx, &e),
            };
        }
    }

    Ok(())
}
