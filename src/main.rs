use std::sync::Arc;

use spot_agent::agent::Agent;
use spot_agent::exchange::{KucoinClient, SpotExchange};
use spot_agent::signals::cross_exchange::CrossExchangeLead;
use spot_agent::signals::onchain::OnchainMonitor;
use spot_agent::signals::sentiment::SentimentAggregator;
use spot_agent::signals::SignalSource;
use spot_agent::Config;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Spot Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Unrecoverable configuration error");
            std::process::exit(1);
        }
    };

    info!(
        paper_trading = config.trading.paper_trading,
        quote = %config.trading.quote_currency,
        max_positions = config.trading.max_total_positions,
        scan_interval = config.scan.interval_secs,
        "Configuration loaded"
    );

    // Paper trading still consumes live market data; only order placement
    // is simulated (inside the execution engine)
    let exchange: Arc<dyn SpotExchange> = match KucoinClient::new(&config.kucoin) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to build exchange client");
            std::process::exit(1);
        }
    };

    // External signal feeds; both degrade to neutral until data arrives
    let intelligence: Vec<Arc<dyn SignalSource>> = vec![
        Arc::new(OnchainMonitor::new()),
        Arc::new(CrossExchangeLead::new()),
    ];
    let sentiment = SentimentAggregator::disabled();

    let mut agent = match Agent::new(config, exchange, sentiment, intelligence) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Failed to initialize agent");
            std::process::exit(1);
        }
    };

    match agent.run().await {
        Ok(cause) => {
            info!(?cause, "Agent stopped");
            std::process::exit(cause.exit_code());
        }
        Err(e) => {
            error!(error = %e, "Agent failed");
            std::process::exit(1);
        }
    }
}
