//! Dry-run gateway: live market data, simulated execution.
//!
//! Wraps a real gateway and delegates every query to it, while writes are
//! filled synthetically at the current touch price plus a fixed impact.
//! Downstream logic (registry, persistence, guardian, telemetry) operates
//! identically to live mode.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::info;

use crate::exchange::{
    AccountState, ExchangeGateway, GatewayError, InstrumentRules, OrderFill, OrderSide, Symbol,
    Ticker, Venue, Wallet,
};
use crate::utils::decimal::conforms_to_step;

/// Price impact applied to every simulated fill.
const SIM_IMPACT: Decimal = dec!(0.001);
/// Simulated taker fee.
const SIM_TAKER_FEE: Decimal = dec!(0.00025);

#[derive(Default)]
struct PaperBook {
    spot_balances: HashMap<String, Decimal>,
    perp_positions: HashMap<String, Decimal>,
    quote_balance: Decimal,
    fees_paid: Decimal,
}

/// Gateway wrapper that simulates all account mutations in memory.
pub struct PaperGateway<G> {
    inner: G,
    book: Arc<RwLock<PaperBook>>,
    quote_asset: String,
}

impl<G: ExchangeGateway> PaperGateway<G> {
    pub fn new(inner: G, quote_asset: &str, starting_quote: Decimal) -> Self {
        let book = PaperBook {
            quote_balance: starting_quote,
            ..Default::default()
        };
        Self {
            inner,
            book: Arc::new(RwLock::new(book)),
            quote_asset: quote_asset.to_string(),
        }
    }
}

#[async_trait]
impl<G: ExchangeGateway> ExchangeGateway for PaperGateway<G> {
    async fn list_perp_symbols(&self, quote: &str) -> Result<Vec<Symbol>, GatewayError> {
        self.inner.list_perp_symbols(quote).await
    }

    async fn fetch_funding_rate(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        self.inner.fetch_funding_rate(symbol).await
    }

    async fn fetch_ticker(&self, venue: Venue, symbol: &Symbol) -> Result<Ticker, GatewayError> {
        self.inner.fetch_ticker(venue, symbol).await
    }

    async fn fetch_24h_volume(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        self.inner.fetch_24h_volume(symbol).await
    }

    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &Symbol,
    ) -> Result<InstrumentRules, GatewayError> {
        self.inner.fetch_instrument_rules(venue, symbol).await
    }

    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError> {
        let rules = self.inner.fetch_instrument_rules(venue, symbol).await?;
        if !conforms_to_step(quantity, rules.step_size) {
            return Err(GatewayError::InvalidQuantity {
                quantity,
                step: rules.step_size,
            });
        }

        let ticker = self.inner.fetch_ticker(venue, symbol).await?;
        let touch = match side {
            OrderSide::Buy => ticker.ask,
            OrderSide::Sell => ticker.bid,
        };
        let fill_price = match side {
            OrderSide::Buy => touch * (Decimal::ONE + SIM_IMPACT),
            OrderSide::Sell => touch * (Decimal::ONE - SIM_IMPACT),
        };
        let notional = quantity * fill_price;
        let fee = notional * SIM_TAKER_FEE;

        let mut book = self.book.write().await;
        match venue {
            Venue::Spot => {
                let base = book
                    .spot_balances
                    .entry(symbol.base().to_string())
                    .or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *base += quantity,
                    OrderSide::Sell => *base -= quantity,
                }
                match side {
                    OrderSide::Buy => book.quote_balance -= notional,
                    OrderSide::Sell => book.quote_balance += notional,
                }
            }
            Venue::Perp => {
                let position = book
                    .perp_positions
                    .entry(symbol.market_name())
                    .or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *position += quantity,
                    OrderSide::Sell => *position -= quantity,
                }
            }
        }
        book.fees_paid += fee;

        info!(
            %symbol,
            %venue,
            ?side,
            %quantity,
            fill_price = %fill_price,
            notional = %notional,
            fee = %fee,
            "dry-run simulated fill"
        );

        Ok(OrderFill {
            quantity,
            avg_price: fill_price,
            fee,
        })
    }

    async fn transfer(
        &self,
        _from: Wallet,
        _to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError> {
        info!(asset, %amount, "dry-run simulated transfer");
        Ok(())
    }

    async fn fetch_account(&self) -> Result<AccountState, GatewayError> {
        // Paper account carries no leverage; report fully healthy margin so
        // the guardian never rebalances against phantom balances.
        let book = self.book.read().await;
        Ok(AccountState::new(
            book.quote_balance,
            Decimal::ZERO,
            book.quote_balance.max(Decimal::ONE),
        ))
    }

    async fn fetch_perp_position(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        Ok(self
            .book
            .read()
            .await
            .perp_positions
            .get(&symbol.market_name())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn fetch_spot_balance(&self, asset: &str) -> Result<Decimal, GatewayError> {
        let book = self.book.read().await;
        if asset == self.quote_asset {
            return Ok(book.quote_balance);
        }
        Ok(book
            .spot_balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}
