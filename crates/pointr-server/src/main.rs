// pointr server entry point.
//
// Startup sequence:
// 1. Load config
// 2. Initialize tracing (RUST_LOG, else the configured filter)
// 3. Open the session store and its change feed
// 4. Bind the WebSocket listener and serve until Ctrl+C

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use pointr_core::{ChangeFeed, SessionStore};
use pointr_server::config;
use pointr_server::ws_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = config::load_config().context("failed to load configuration")?;

    // 2. Initialize tracing
    init_tracing(&config.logging.filter)?;
    info!("pointr starting up");

    // 3. Open the store
    let feed = Arc::new(ChangeFeed::new(config.feed.capacity));
    let store = SessionStore::open(&config.database.path, feed)
        .with_context(|| format!("failed to open database at {}", config.database.path))?;
    let store = Arc::new(store);

    // 4. Serve
    let address = config.server.address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tokio::select! {
        result = ws_server::serve(listener, store.clone()) => {
            if let Err(e) = &result {
                error!("WebSocket server error: {e:#}");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    let stats = store.feed().stats();
    info!(
        "pointr shut down cleanly ({} events published, {} unobserved)",
        stats.events_published, stats.events_unobserved
    );
    Ok(())
}

/// Log to stderr. `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
