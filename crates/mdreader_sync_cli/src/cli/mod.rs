/// Clap argument definitions
mod args;

/// `doc show`, `doc append`
mod doc;

/// `env` command
mod env;

/// Folder commands
mod folders;

/// Offline queue inspection and replay
mod queue;

use clap::Parser;

use mdreader_sync::{SyncConfig, SyncSession};

pub use args::Cli;
use args::Commands;

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(config) = load_config(&cli) else {
        std::process::exit(1);
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let success = runtime.block_on(async move {
        let session = match SyncSession::start(config).await {
            Ok(session) => session,
            Err(e) => {
                eprintln!("✗ Could not start the sync engine: {}", e);
                return false;
            }
        };

        let success = match cli.command {
            Commands::Env => env::handle_env(&session).await,
            Commands::Queue { command } => queue::handle_queue_command(&session, command).await,
            Commands::Folders { command } => {
                folders::handle_folder_command(&session, command).await
            }
            Commands::Doc { command } => doc::handle_doc_command(&session, command).await,
        };

        session.shutdown().await;
        success
    });

    if !success {
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

/// Load the config file and apply command-line overrides.
fn load_config(cli: &Cli) -> Option<SyncConfig> {
    let loaded = match &cli.config {
        Some(path) => SyncConfig::load_from(path),
        None => SyncConfig::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Error loading config: {}", e);
            return None;
        }
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if cli.offline {
        config.enable_cloud_sync = false;
    }
    log::debug!(
        "[CLI] Data directory {:?}, cloud sync {}",
        config.resolved_data_dir(),
        config.enable_cloud_sync
    );
    Some(config)
}
