//! hpcaas per-node agent daemon.
//!
//! Runs inside each compute container. It owns the node's view of the user's
//! code: starts it on request, adopts it when an MPI launcher starts it over
//! SSH, and survives its own restarts by rehydrating the last state snapshot.
//!
//! ## Subcommands
//!
//! - `run` (default): start the agent and block
//! - `state`: print the last persisted state
//! - `config`: print the resolved configuration

mod logging;

use clap::{Parser, Subcommand};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use agent_core::{load_config, load_snapshot, resolve_config_path, Agent, AgentConfig};

const AUTHORIZATION_ENV: &str = "AUTHORIZATION";

#[derive(Parser)]
#[command(name = "hpcaas-daemon")]
#[command(about = "Per-node agent that runs and supervises HPC code")]
#[command(version)]
struct Cli {
    /// Path to agent.toml (defaults to $HPCAAS_AGENT_CONFIG, then /hpcaas/daemon/agent.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent and supervise the code until terminated
    Run {
        /// Launch the code once at startup
        #[arg(long)]
        execute: bool,
    },

    /// Print the last persisted state snapshot as JSON
    State,

    /// Print the resolved configuration as TOML
    Config,
}

fn main() {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);
    let (config, config_error) = match load_config(&config_path) {
        Ok(config) => (config, None),
        Err(err) => (AgentConfig::default(), Some(err)),
    };

    match cli.command.unwrap_or(Commands::Run { execute: false }) {
        Commands::Run { execute } => {
            let _logging_guard = logging::init(&config.logging);
            if let Some(err) = config_error {
                warn!(error = %err, "Failed to load agent config; using defaults");
            }
            if let Err(err) = run(&config, &config_path, execute) {
                error!(error = %err, "Agent failed to start");
                std::process::exit(1);
            }
        }
        Commands::State => print_state(&config),
        Commands::Config => {
            if let Some(err) = config_error {
                eprintln!("warning: {}; showing defaults", err);
            }
            print_config(&config);
        }
    }
}

fn run(config: &AgentConfig, config_path: &Path, execute: bool) -> std::io::Result<()> {
    info!(
        config = %config_path.display(),
        code_root = %config.code_root.display(),
        daemon_dir = %config.daemon_dir.display(),
        "Starting hpcaas agent"
    );

    let agent = Agent::start(config)?;

    if let Ok(key) = env::var(AUTHORIZATION_ENV) {
        if !key.is_empty() {
            agent.store().set_authorization_key(key);
            info!("Authorization key loaded from environment");
        }
    }

    if execute {
        match agent.supervisor().execute_code() {
            Ok(pid) => info!(pid, "Code launched at startup"),
            Err(err) => warn!(error = %err, "Startup launch failed"),
        }
    }

    agent.wait();
    Ok(())
}

fn print_state(config: &AgentConfig) {
    let path = config.paths().snapshot_file();
    let state = match load_snapshot(&path) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("Failed to read state snapshot: {}", err);
            std::process::exit(1);
        }
    };
    match serde_json::to_string_pretty(&state) {
        Ok(json) => println!("{}", json),
        Err(err) => {
            eprintln!("Failed to encode state: {}", err);
            std::process::exit(1);
        }
    }
}

fn print_config(config: &AgentConfig) {
    match toml::to_string_pretty(config) {
        Ok(text) => print!("{}", text),
        Err(err) => {
            eprintln!("Failed to encode config: {}", err);
            std::process::exit(1);
        }
    }
}
