//! sessionward - keep an API session alive from a terminal.
//!
//! Logs in, shows the session, renews it on demand or in the background,
//! and logs out. All session behavior lives in `sessionward-core`; this binary
//! is a thin front end over `SessionManager` and `ApiClient`.

mod commands;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sessionward", version, about = "Client-side session lifecycle manager")]
pub struct Cli {
    /// API base URL (overrides the config file)
    #[arg(long, env = "SESSIONWARD_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Log in and persist the session
    Login {
        /// Account identifier (defaults to the last one used)
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Show the current session
    Status,
    /// Renew the credential now
    Refresh,
    /// Log out locally and end the server session
    Logout,
    /// Materialize a session after a third-party identity provider redirect
    OauthCallback {
        /// Identity provider name
        provider: String,
    },
    /// Keep the session alive and print every state change until Ctrl-C
    Watch,
    /// GET a resource through the request gate and print the JSON body
    Fetch {
        /// Path relative to the API base URL
        path: String,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sessionward.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());
    info!("sessionward starting");

    commands::run(cli).await
}
