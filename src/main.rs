use std::time::Duration;

use bayeux_rs::config::{
    BayeuxConfigBuilder, DEFAULT_BACKLOG_CAPACITY, DEFAULT_LONG_POLL_TIMEOUT_MILLIS,
    DEFAULT_SESSION_TIMEOUT_MILLIS, DEFAULT_SWEEP_INTERVAL_MILLIS,
};
use bayeux_rs::server::{ServerBuilder, DEFAULT_ADDRESS};
use clap::Parser;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "bayeux-server", version, about = "Long-polling pub/sub server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BAYEUX_ADDRESS", default_value = DEFAULT_ADDRESS)]
    address: String,

    /// How long a connect is held, in milliseconds
    #[arg(long, env = "BAYEUX_LONG_POLL_TIMEOUT_MS", default_value_t = DEFAULT_LONG_POLL_TIMEOUT_MILLIS)]
    long_poll_timeout_ms: u64,

    /// Inactivity after which a session is dropped, in milliseconds
    #[arg(long, env = "BAYEUX_SESSION_TIMEOUT_MS", default_value_t = DEFAULT_SESSION_TIMEOUT_MILLIS)]
    session_timeout_ms: u64,

    /// Messages kept per session between connects
    #[arg(long, env = "BAYEUX_BACKLOG_CAPACITY", default_value_t = DEFAULT_BACKLOG_CAPACITY)]
    backlog_capacity: usize,

    /// How often expired sessions are swept, in milliseconds
    #[arg(long, env = "BAYEUX_SWEEP_INTERVAL_MS", default_value_t = DEFAULT_SWEEP_INTERVAL_MILLIS)]
    sweep_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = BayeuxConfigBuilder::default()
        .long_poll_timeout(Duration::from_millis(args.long_poll_timeout_ms))
        .session_timeout(Duration::from_millis(args.session_timeout_ms))
        .backlog_capacity(args.backlog_capacity)
        .sweep_interval(Duration::from_millis(args.sweep_interval_ms))
        .build()?;

    let mut server = ServerBuilder::new()
        .address(args.address)
        .config(config)
        .build()?;
    let listener = server.bind().await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.cancel();
        }
    });

    server.run(listener).await?;
    Ok(())
}
