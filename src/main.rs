use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use rainsd::{Config, Server, ServerError};

#[derive(Parser, Debug)]
#[command(name = "rainsd")]
#[command(author, version, about = "RAINS server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server with the given configuration.
    Start {
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,

        /// Verbosity: 0-1 error, 2 warn, 3 info, 4 debug, 5 trace.
        #[arg(short, long, default_value_t = 3)]
        log_level: u8,
    },
    /// Signal a running server to shut down.
    Shutdown {
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
}

fn init_logging(log_level: u8) {
    let default = match log_level {
        0 | 1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}

/// The pidfile the `shutdown` subcommand signals.
fn pid_file(config: &Config) -> PathBuf {
    if config.check_point_path.is_empty() {
        std::env::temp_dir().join("rainsd.pid")
    } else {
        Path::new(&config.check_point_path).join("rainsd.pid")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { config, log_level } => {
            init_logging(log_level);
            start(&config).await
        }
        Command::Shutdown { config } => {
            init_logging(2);
            shutdown(&config)
        }
    }
}

async fn start(config_path: &Path) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not load configuration");
            return ExitCode::from(1);
        }
    };
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "could not initialize server");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = server.start().await {
        error!(error = %e, "could not start server");
        return match e {
            ServerError::Bind(_) => ExitCode::from(2),
            ServerError::Config(_) => ExitCode::from(1),
        };
    }

    let pid_path = pid_file(server.config());
    if let Some(parent) = pid_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        info!(error = %e, "could not write pidfile");
    }

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "could not install SIGTERM handler");
            return ExitCode::from(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, exiting gracefully");
        }
        _ = sigterm.recv() => {
            info!("received terminate, exiting gracefully");
        }
    }

    server.shutdown();
    server.join().await;
    let _ = std::fs::remove_file(&pid_path);
    ExitCode::SUCCESS
}

fn shutdown(config_path: &Path) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not load configuration");
            return ExitCode::from(1);
        }
    };
    let pid_path = pid_file(&config);
    let pid = match std::fs::read_to_string(&pid_path)
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok())
    {
        Some(pid) => pid,
        None => {
            error!(path = %pid_path.display(), "no running server found");
            return ExitCode::from(1);
        }
    };
    match nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    ) {
        Ok(()) => {
            info!(pid, "shutdown signal sent");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(pid, error = %e, "could not signal server");
            ExitCode::from(1)
        }
    }
}
