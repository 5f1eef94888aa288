use std::process::ExitCode;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use central_hub::config::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PORT,
    DEFAULT_QUEUE_CAPACITY,
};
use central_hub::{send_update, Hub, HubConfig};

/// Shared state hub for cooperating processes.
///
/// Without a subcommand, runs the hub until interrupted.
#[derive(Parser, Debug)]
#[command(name = "central-hub", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone, PartialEq)]
struct ServeArgs {
    #[arg(long, env = "BB_HUB_HOST", default_value = DEFAULT_HOST, help = "Interface to bind to.")]
    host: String,

    #[arg(long, env = "BB_HUB_PORT", default_value_t = DEFAULT_PORT, help = "Port to bind to; 0 picks a free port.")]
    port: u16,

    #[arg(long, env = "BB_HUB_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY, help = "Outbound messages buffered per client before new ones are dropped.")]
    queue_capacity: usize,

    #[arg(long, env = "BB_HUB_HEARTBEAT_SECS", default_value_t = DEFAULT_HEARTBEAT_SECS, help = "Seconds between WebSocket pings to each client.")]
    heartbeat_secs: u64,

    #[arg(long, env = "BB_HUB_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, help = "Seconds of client silence before disconnecting it.")]
    idle_timeout_secs: u64,

    #[arg(long, env = "BB_LOG_ALL_MESSAGES", value_parser = BoolishValueParser::new(), help = "Log every frame except heartbeats.")]
    log_all_messages: bool,
}

impl ServeArgs {
    fn into_config(self) -> HubConfig {
        HubConfig {
            host: self.host,
            port: self.port,
            queue_capacity: self.queue_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            log_all_messages: self.log_all_messages,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write one key on a running hub and print the committed version
    Send {
        key: String,
        /// JSON value; anything that is not valid JSON is sent as a string
        value: String,
        #[arg(long, default_value_t = format!("ws://127.0.0.1:{DEFAULT_PORT}/ws"))]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        None => serve(cli.serve.into_config()).await,
        Some(Commands::Send { key, value, url }) => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            match send_update(&url, key.as_str(), value).await {
                Ok(version) => {
                    println!("{key} -> version {version}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!("update failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn serve(config: HubConfig) -> ExitCode {
    let hub = match Hub::start(config).await {
        Ok(hub) => hub,
        Err(e) => {
            log::error!("failed to start hub: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = shutdown_signal().await {
        log::error!("failed to listen for shutdown signal: {e}");
    }
    hub.stop().await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
