use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use price_feed::{
    FeedClient, FeedConfig, config,
    store::PriceStore,
    transport::WsConnector,
    utils,
};
use tokio::sync::broadcast::error::RecvError;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::init_logging();

    // Configuration
    let config = FeedConfig::from_env()?;
    let symbols = config::load_watchlist()?;
    tracing::info!(
        url = %config.ws_url,
        symbols = symbols.len(),
        interval_ms = config.price_update_interval.as_millis() as u64,
        "[INIT] price-feed starting"
    );

    let connector = Arc::new(WsConnector::from_config(&config));
    let client = Arc::new(FeedClient::new(config, connector));
    let max_attempts = client.max_reconnect_attempts();
    let store = PriceStore::new(client.clone(), symbols);

    // State consumer --------------------------------------------------------
    let mut states = client.subscribe_state();
    let state_task = tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(state) => tracing::info!(status = %state.label(max_attempts), "[FEED] status"),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "[FEED] status lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Price consumer --------------------------------------------------------
    let mut prices = client.subscribe_prices();
    let price_task = tokio::spawn(async move {
        loop {
            match prices.recv().await {
                Ok(update) => tracing::debug!(
                    symbol = %update.symbol,
                    price = %update.formatted_price(),
                    change = %update.formatted_change(),
                    "[SIM] price"
                ),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "[SIM] prices lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    store.start_streaming();

    // Summary of the projected state every 10 seconds -----------------------
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let snapshot = store.state();
                let selected = &snapshot.selected.ticker;
                let price = snapshot
                    .price(selected)
                    .map(|u| u.formatted_price())
                    .unwrap_or_else(|| "-".into());
                tracing::info!(
                    status = %snapshot.connection.label(max_attempts),
                    symbol = %selected,
                    price = %price,
                    tracked = snapshot.prices.len(),
                    "[HEARTBEAT] feed summary"
                );
            }
        }
    }

    tracing::info!("[INIT] shutting down");
    store.stop_streaming();
    // the socket task writes the going-away frame asynchronously
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    state_task.abort();
    price_task.abort();
    Ok(())
}
