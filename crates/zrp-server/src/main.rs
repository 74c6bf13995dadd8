//! zrp-server binary: accepts client and worker connections on the control
//! port and brokers public visitors to the tcp shares clients announce.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use zrp_server::{Server, ServerConfig};

/// zrp-server — reverse TCP tunnel server
#[derive(Parser, Debug)]
#[command(name = "zrp-server", version, about = "zrp reverse TCP tunnel server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default if no subcommand is given)
    Run {
        /// Config file path
        #[arg(default_value = "zrp-server.json")]
        config: Option<PathBuf>,
    },
    /// Print an example config file and exit
    DumpConfig {
        /// Print every field at its default value instead of the minimal example
        #[arg(long)]
        full: bool,
    },
    /// Print usage information and exit
    Help,
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command.unwrap_or(Command::Run { config: None }) {
        Command::DumpConfig { full } => {
            println!("{}", serde_json::to_string_pretty(&ServerConfig::example(full)).unwrap());
            ExitCode::SUCCESS
        }
        Command::Run { config } => {
            let path = config.unwrap_or_else(|| PathBuf::from("zrp-server.json"));
            run(&path).await
        }
        Command::Help => {
            let _ = Cli::command().print_help();
            println!();
            ExitCode::SUCCESS
        }
    }
}

async fn run(config_path: &PathBuf) -> ExitCode {
    let cfg = match ServerConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = zrp_core::try_set_rlimit_nofile(cfg.rlimit_nofile) {
        info!(error = %e, "could not raise file descriptor limit, continuing anyway");
    }

    let server = Server::new(cfg);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server failed");
                return ExitCode::FAILURE;
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            server.try_stop().await;
        }
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
