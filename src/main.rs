//! # Main — CLI Entry Point
//!
//! Routes subcommands to the daemon, the central controller, or the local
//! command socket. Shared concerns handled here: environment loading,
//! structured logging (`LOG_FORMAT=json` for fleet log collectors,
//! human-readable stderr otherwise), and the tokio runtime.

mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "mctl", version, about = "Supervise fleet workloads across nodes")]
struct Cli {
    /// Path to the daemon command socket (defaults to a per-user temp path)
    #[arg(long, env = "MCTL_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the per-node supervisor daemon
    Daemon {
        /// Directory of workload definition files
        #[arg(long, default_value = "configs", env = "MCTL_CONFIG_DIR")]
        config_dir: PathBuf,
        /// Node state database path
        #[arg(long, default_value = "mctl.db", env = "MCTL_DB_PATH")]
        db_path: PathBuf,
        /// Directory for per-workload log files
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Run the central fleet controller
    Central {
        /// Directory holding daemon.yaml (central section) and inventory
        #[arg(long, default_value = "configs", env = "MCTL_CONFIG_DIR")]
        config_dir: PathBuf,
    },
    /// List workloads on the local daemon
    List,
    /// Show one workload's status
    Status { name: String },
    /// Start a workload
    Start { name: String },
    /// Stop a workload
    Stop { name: String },
    /// Restart a workload
    Restart { name: String },
    /// Re-read config files and reconcile running workloads
    Reload,
    /// Stop the local daemon
    Shutdown,
    /// Internal worker launcher invoked by the supervisor
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        module: String,
        #[arg(long, default_value = "run")]
        entry_point: String,
        #[arg(long, default_value = "{}")]
        params_json: String,
        #[arg(long, default_value = "worker")]
        workload_name: String,
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let args = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match args.command {
        Commands::Daemon {
            config_dir,
            db_path,
            log_dir,
        } => rt.block_on(cli::run_daemon(config_dir, db_path, log_dir, args.socket)),
        Commands::Central { config_dir } => rt.block_on(cli::run_central(config_dir)),
        Commands::List => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("list", None),
        )),
        Commands::Status { name } => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("status", Some(&name)),
        )),
        Commands::Start { name } => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("start", Some(&name)),
        )),
        Commands::Stop { name } => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("stop", Some(&name)),
        )),
        Commands::Restart { name } => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("restart", Some(&name)),
        )),
        Commands::Reload => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("reload", None),
        )),
        Commands::Shutdown => rt.block_on(cli::run_socket_command(
            args.socket,
            cli::command_value("shutdown", None),
        )),
        Commands::Worker {
            module,
            entry_point,
            params_json,
            workload_name,
            log_file,
        } => cli::run_worker(
            &module,
            &entry_point,
            &params_json,
            &workload_name,
            log_file.as_ref(),
        ),
    }
}
