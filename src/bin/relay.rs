use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use spoke_relay::config::{Cli, Config};
use spoke_relay::logging;
use spoke_relay::push::LogPushProvider;
use spoke_relay::relay::{app, RelayState};
use spoke_relay::storage::{MemoryStore, SqliteStore};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("spoke-relay: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli_and_env(Cli::parse())?;
    logging::init(&config.log_filter);

    info!(
        bind = %config.bind_addr,
        ack_timeout_ms = config.relay.ack_timeout.as_millis() as u64,
        replay_policy = ?config.relay.replay_policy,
        "spoke-relay starting"
    );

    let state = match &config.database {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path)?);
            info!(database = %path.display(), "using sqlite store");
            RelayState::new(
                config.relay.clone(),
                store.clone(),
                store.clone(),
                store,
                Arc::new(LogPushProvider),
            )
        }
        None => {
            warn!("no database configured, queued messages will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            RelayState::new(
                config.relay.clone(),
                store.clone(),
                store.clone(),
                store,
                Arc::new(LogPushProvider),
            )
        }
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
