use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

mod cgroups;
mod config;
mod dispatcher;
mod ipc;
mod sandbox;

use cgroups::CgroupContext;
use config::TuneConfig;
use dispatcher::Dispatcher;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root path of the cgroup virtual filesystem
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    /// Lock the daemon's own memory resident
    #[arg(long)]
    lock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the memory governor daemon
    Daemon,

    /// Ask a running daemon to launch a command under management
    Run {
        /// Command line to launch
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Forward one focus-change event to the daemon (for focus watchers)
    Focus {
        /// Process id of the newly focused window, 0 for none
        pid: i32,
        /// Focus-change identifier from the window system
        change_id: u64,
    },

    /// Check that a daemon is running
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(TuneConfig::default_path);
    let mut config = TuneConfig::load(&config_path)?;
    if let Some(root) = cli.cgroup_root {
        config.cgroup_mount = root;
    }
    if cli.lock {
        config.memory_lock = true;
    }

    match cli.command {
        Commands::Daemon => run_daemon(config).await,

        Commands::Run { command } => {
            let cmdline = command.join(" ");
            let socket = config.socket_path();
            if ipc::ping(&socket).await.is_err() {
                anyhow::bail!("no daemon is listening; start `swapsched daemon` first");
            }
            ipc::request_run(&socket, &cmdline).await
        }

        Commands::Focus { pid, change_id } => {
            ipc::send_focus(&config.socket_path(), pid, change_id).await
        }

        Commands::Ping => {
            ipc::ping(&config.socket_path()).await?;
            println!("pong");
            Ok(())
        }
    }
}

async fn run_daemon(config: TuneConfig) -> Result<()> {
    let cg = CgroupContext::new(config.cgroup_mount.clone(), config.root_cgroup.clone());
    cg.check_prepared()?;

    if config.memory_lock {
        nix::sys::mman::mlockall(nix::sys::mman::MlockAllFlags::MCL_CURRENT)
            .context("failed to lock daemon memory")?;
        info!("daemon memory locked resident");
    }

    let dispatcher = Dispatcher::new(cg, config.freeze_duration());
    info!(
        "governing cgroup {} (freeze window {}ms)",
        config.root_cgroup, config.freeze_duration_ms
    );

    {
        let dispatcher = dispatcher.clone();
        std::thread::spawn(move || dispatcher.balance_loop());
    }

    ipc::serve(dispatcher, &config.socket_path()).await
}

fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
