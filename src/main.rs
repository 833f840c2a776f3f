use std::sync::Arc;

use anyhow::{bail, Result};
use funding_harvester::config::Config;
use funding_harvester::exchange::{BinanceGateway, ExchangeGateway, PaperGateway};
use funding_harvester::persistence::PositionStore;
use funding_harvester::strategy::Supervisor;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Funding Harvester v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!(
        exchange = %config.exchange.name,
        quote = %config.trading.quote_currency,
        notional_per_entry = %config.trading.notional_per_entry,
        max_open_positions = config.trading.max_open_positions,
        dry_run = config.trading.dry_run,
        "Configuration loaded"
    );

    let gateway: Arc<dyn ExchangeGateway> = match config.exchange.name.as_str() {
        "binance" => {
            let binance = BinanceGateway::new(&config.exchange)?;
            if config.trading.dry_run {
                info!("dry-run mode: orders are simulated");
                Arc::new(PaperGateway::new(
                    binance,
                    &config.trading.quote_currency,
                    config.trading.notional_per_entry
                        * rust_decimal::Decimal::from(config.trading.max_open_positions),
                ))
            } else {
                Arc::new(binance)
            }
        }
        other => bail!("unsupported exchange '{other}'"),
    };

    let store = PositionStore::new(&config.database_path)?;
    let supervisor = Supervisor::start(config, gateway, store).await?;
    let exit_code = supervisor.run().await?;

    info!(code = exit_code.code(), "Funding Harvester stopped");
    std::process::exit(exit_code.code());
}
