use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use beacon_client::{ClientConfig, ConnectionManager, ConnectionStatus};
use beacon_core::{Envelope, MessageKind};
use beacon_server::{load_config, ServerConfig};
use beacon_store::Database;
use beacon_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use clap::{Parser, Subcommand};

/// How long `send` waits for the hub before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time left for the close handshake before the process exits.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "beacon", version, about = "Real-time WebSocket broadcast hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub and its HTTP API.
    Serve {
        /// JSON config file, merged over the defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// SQLite file. In-memory when omitted outside production.
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Connect and print every inbound envelope as a JSON line.
    Watch {
        #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,
        /// Only print this wire type (e.g. `sensor_update`).
        #[arg(long)]
        kind: Option<MessageKind>,
    },
    /// Connect, send one envelope, disconnect.
    Send {
        #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,
        /// Wire type tag. Unknown tags are sent as-is.
        #[arg(long)]
        kind: String,
        /// JSON payload for `data`.
        #[arg(long)]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            host,
            port,
            database,
        } => serve(config, host, port, database).await,
        Command::Watch { url, kind } => watch(url, kind).await,
        Command::Send { url, kind, data } => send(url, &kind, &data).await,
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref()).context("loading config")?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if database.is_some() {
        config.database_path = database;
    }
    config.validate().context("invalid config")?;

    init_telemetry(&config.telemetry())?;
    tracing::info!(name = %config.name, environment = %config.environment, "starting beacon");

    let db = open_database(&config)?;
    let handle = beacon_server::start(config, db)
        .await
        .context("starting server")?;
    tracing::info!(addr = %handle.addr, "beacon ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn open_database(config: &ServerConfig) -> Result<Database> {
    match &config.database_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            let db = Database::open(path)
                .with_context(|| format!("opening database {}", path.display()))?;
            tracing::info!(path = %path.display(), "database opened");
            Ok(db)
        }
        None => {
            tracing::warn!("no database path configured, using in-memory storage");
            Ok(Database::in_memory()?)
        }
    }
}

fn client_telemetry() -> Result<()> {
    let config = TelemetryConfig {
        format: LogFormat::Pretty,
        ..TelemetryConfig::default()
    }
    .with_level_name("warn");
    init_telemetry(&config)?;
    Ok(())
}

async fn watch(url: String, kind: Option<MessageKind>) -> Result<()> {
    client_telemetry()?;
    let manager = ConnectionManager::new(ClientConfig::new(url));

    let print = |envelope: &Envelope| match envelope.encode() {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "could not re-encode envelope"),
    };
    let _subscription = match kind {
        Some(kind) => manager.subscribe(kind, print),
        None => manager.subscribe_all(print),
    };

    manager.connect();
    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    manager.disconnect();
    tokio::time::sleep(CLOSE_GRACE).await;
    Ok(())
}

async fn send(url: String, kind: &str, data: &str) -> Result<()> {
    client_telemetry()?;
    let data: serde_json::Value = serde_json::from_str(data).context("--data is not JSON")?;
    let manager = ConnectionManager::new(ClientConfig {
        max_reconnect_attempts: 0,
        ..ClientConfig::new(url)
    });

    let mut status = manager.watch_status();
    manager.connect();
    let timed_out = tokio::time::timeout(
        CONNECT_TIMEOUT,
        status.wait_for(|s| *s != ConnectionStatus::Connecting),
    )
    .await
    .is_err();
    if !manager.is_connected() {
        let reason = manager.last_error().unwrap_or_else(|| {
            if timed_out { "timed out" } else { "connection failed" }.to_string()
        });
        bail!("could not connect to {}: {reason}", manager.config().url);
    }

    manager.send_raw(kind, data)?;
    manager.disconnect();
    tokio::time::sleep(CLOSE_GRACE).await;
    Ok(())
}
