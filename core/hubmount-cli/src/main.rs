//! hubmount: mount a remote repository as a local folder.
//!
//! ## Subcommands
//!
//! - `mount`: attach a repository and hold it until interrupted
//! - `unmount`: end the session holding a folder (possibly in another process)
//! - `list`: show registered sessions
//! - `cleanup`: reclaim sessions whose owner died
//!
//! Exit codes: 0 success, 1 internal, 2 invalid input, 3 already mounted,
//! 4 mount failure.

mod cleanup;
mod list;
mod logging;
mod mount;
mod unmount;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use hubmount_core::{
    CommandMountProvider, HubRemote, MountConfig, Result, SessionController, StorageConfig,
};

#[derive(Parser)]
#[command(name = "hubmount")]
#[command(about = "Mount hub repositories as local folders with a RAM write cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a repository and keep it mounted until interrupted
    Mount {
        /// Repository in owner/name form
        #[arg(value_name = "REPO")]
        repo: String,

        /// Target folder name (defaults to the repository name)
        #[arg(value_name = "FOLDER")]
        folder: Option<String>,
    },

    /// Unmount the session holding a folder
    Unmount {
        #[arg(value_name = "FOLDER")]
        folder: String,
    },

    /// List registered sessions
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Reclaim sessions whose owning process is gone
    Cleanup,
}

fn main() {
    let storage = StorageConfig::from_home();
    let logging_guard = logging::init(storage.as_ref().ok().map(|s| s.logs_dir()).as_deref());
    let cli = Cli::parse();

    let code = match storage.and_then(|storage| run(cli.command, storage)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "hubmount failed");
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };
    drop(logging_guard);
    std::process::exit(code);
}

fn run(command: Commands, storage: StorageConfig) -> Result<i32> {
    let controller = build_controller(storage);
    match command {
        Commands::Mount { repo, folder } => mount::run(&controller, &repo, folder.as_deref()),
        Commands::Unmount { folder } => unmount::run(&controller, &folder),
        Commands::List { json } => list::run(&controller, json),
        Commands::Cleanup => cleanup::run(&controller),
    }
}

fn build_controller(storage: StorageConfig) -> SessionController {
    let config = MountConfig::load(&storage.config_file());
    let remote = Arc::new(HubRemote::new(config.require_token));
    let mounter = Arc::new(CommandMountProvider::from_config(&config));
    SessionController::new(storage, config, remote, mounter)
}
