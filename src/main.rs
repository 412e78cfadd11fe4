//! # Logger Link
//!
//! Monitor and control a WiFi field data logger from the command line.
//!
//! The logger serves a line protocol on a fixed TCP port. This tool polls
//! its status, starts and stops logging sessions, formats its storage and
//! downloads every stored file as CSV.
//!
//! # Examples
//!
//! ```bash
//! logger-link monitor
//! logger-link start transect-3
//! logger-link download ./data/2025-03-09
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use logger_link::client::LoggerClient;
use logger_link::config::Config;
use logger_link::link::transport::TcpConnector;
use logger_link::link::ConnectionManager;
use logger_link::poller::StatusPoller;
use logger_link::protocol::types::StatusUpdate;

#[derive(Parser)]
#[command(name = "logger-link", version, about = "Monitor and control a WiFi field data logger")]
struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll and print the logger status until Ctrl+C
    Monitor {
        /// Print each update as one JSON line
        #[arg(long)]
        json: bool,
    },
    /// Print the logger status once
    Status {
        /// Print the update as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start logging to a named file on the logger
    Start {
        /// File name; defaults to save-YYYY-MM-DD
        name: Option<String>,
    },
    /// Stop the active logging session
    Stop,
    /// Erase every file on the logger
    Format {
        /// Confirm erasing all stored data
        #[arg(long)]
        yes: bool,
    },
    /// Download every stored file as CSV into a directory
    Download {
        /// Target directory (created if missing)
        dir: PathBuf,
    },
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    match &config.logging.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "logger-link.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Human-readable status, one fact per line
fn render_status(update: &StatusUpdate) -> String {
    let t = &update.telemetry;
    let mut lines = vec![
        if update.taking_data { "Taking Data" } else { "Not Taking Data" }.to_string(),
        String::new(),
        t.timestamp.clone(),
        format!("{}C at {}% humidity", t.temperature, t.humidity),
        format!("Location {:.5},{:.5}, altitude {}", t.latitude, t.longitude, t.altitude),
        format!("Fix type: {} ({} satellites)", t.fix_type, t.satellites),
    ];
    if !update.manifest.is_empty() {
        lines.push(String::new());
        lines.push("Saved files:".to_string());
        lines.extend(update.manifest.iter().map(ToString::to_string));
    }
    if update.corrupted_file_count > 0 {
        lines.push(format!("{} file(s) corrupted", update.corrupted_file_count));
    }
    lines.join("\n")
}

fn print_status(update: &StatusUpdate, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(update)?);
    } else {
        println!("{}\n", render_status(update));
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<LoggerClient<TcpConnector>> {
    let manager = ConnectionManager::from_config(config);
    info!("Connecting to data logger at {}...", manager.peer());
    manager
        .acquire()
        .await
        .with_context(|| format!("cannot reach data logger at {}", manager.peer()))?;
    Ok(LoggerClient::new(manager))
}

async fn monitor(config: &Config, json: bool) -> Result<()> {
    let manager = ConnectionManager::from_config(config);
    manager.connect_in_background();

    let poller = StatusPoller::new(LoggerClient::new(manager.clone()), config.poll.interval());
    let mut updates = poller.subscribe();
    let mut states = manager.subscribe();

    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let update = updates.borrow_and_update().clone();
                    if let Some(update) = update {
                        if let Err(e) = print_status(&update, json) {
                            tracing::warn!("Cannot print status: {}", e);
                        }
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = states.borrow_and_update().is_connected();
                    info!("Logger {}", if connected { "connected" } else { "disconnected" });
                }
            }
        }
    });

    info!("Press Ctrl+C to exit");
    poller
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        })
        .await;

    manager.shutdown();
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    let _log_guard = init_logging(&config);

    info!("Logger Link v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Monitor { json } => monitor(&config, json).await?,
        Command::Status { json } => {
            let client = connect(&config).await?;
            let update = client.status().await?;
            print_status(&update, json)?;
        }
        Command::Start { name } => {
            let name = name.unwrap_or_else(|| chrono::Local::now().format("save-%Y-%m-%d").to_string());
            let client = connect(&config).await?;
            client.start_logging(&name).await?;
            println!("Logging to {}", name.trim());
        }
        Command::Stop => {
            let client = connect(&config).await?;
            client.stop_logging().await?;
            println!("Logging stopped");
        }
        Command::Format { yes } => {
            if !yes {
                bail!("formatting erases every file on the logger; pass --yes to confirm");
            }
            let client = connect(&config).await?;
            if client.status().await?.taking_data {
                bail!("the logger is taking data; stop logging before formatting");
            }
            client.format_storage().await?;
            println!("Storage formatted");
        }
        Command::Download { dir } => {
            let client = connect(&config).await?;
            let saved = client.download_to(&dir).await?;
            println!("{} downloaded", saved);
        }
    }

    Ok(())
}
