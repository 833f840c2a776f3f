//! In-memory gateway for tests.
//!
//! Market data, account state, and per-order behaviors are scripted up
//! front; orders mutate the simulated balances so reconciliation probes
//! (`fetch_perp_position`, `fetch_spot_balance`) observe the same state a
//! real venue would report.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;

use crate::exchange::{
    AccountState, ExchangeGateway, GatewayError, InstrumentRules, OrderFill, OrderSide, Symbol,
    Ticker, Venue, Wallet,
};
use crate::utils::decimal::conforms_to_step;

/// Scripted outcome for one `place_market_order` call.
#[derive(Debug, Clone, Copy)]
pub enum OrderBehavior {
    /// Fill at the touch price.
    Fill,
    /// Venue refuses before placement.
    RejectPrePlace,
    /// Network outcome unknown. When `lands` is true the order actually
    /// executed and the simulated balances reflect it.
    Ambiguous { lands: bool },
}

/// Record of an accepted (or landed-ambiguous) order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub venue: Venue,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

#[derive(Default)]
struct MockState {
    funding_rates: HashMap<String, Decimal>,
    tickers: HashMap<(Venue, String), Ticker>,
    volumes: HashMap<String, Decimal>,
    rules: HashMap<(Venue, String), InstrumentRules>,
    perp_symbols: Vec<Symbol>,
    spot_balances: HashMap<String, Decimal>,
    perp_positions: HashMap<String, Decimal>,
    account: Option<AccountState>,
    order_script: HashMap<(Venue, String), VecDeque<OrderBehavior>>,
    orders: Vec<PlacedOrder>,
    transfers: Vec<(Wallet, Wallet, String, Decimal)>,
}

const MOCK_TAKER_FEE: Decimal = dec!(0.0004);

/// Simulated exchange shared across tasks under test.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<RwLock<MockState>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol with identical spot/perp rules and touch prices
    /// derived from the given mids (1 bp half-spread).
    pub async fn add_market(
        &self,
        symbol: &Symbol,
        funding_rate: Decimal,
        spot_mid: Decimal,
        perp_mid: Decimal,
        volume_24h: Decimal,
        rules: InstrumentRules,
    ) {
        let half = dec!(0.0001);
        let mut state = self.state.write().await;
        let name = symbol.market_name();
        state.funding_rates.insert(name.clone(), funding_rate);
        state.volumes.insert(name.clone(), volume_24h);
        state.tickers.insert(
            (Venue::Spot, name.clone()),
            Ticker {
                bid: spot_mid * (Decimal::ONE - half),
                ask: spot_mid * (Decimal::ONE + half),
            },
        );
        state.tickers.insert(
            (Venue::Perp, name.clone()),
            Ticker {
                bid: perp_mid * (Decimal::ONE - half),
                ask: perp_mid * (Decimal::ONE + half),
            },
        );
        state.rules.insert((Venue::Spot, name.clone()), rules.clone());
        state.rules.insert((Venue::Perp, name), rules);
        state.perp_symbols.push(symbol.clone());
    }

    pub async fn set_funding_rate(&self, symbol: &Symbol, rate: Decimal) {
        self.state
            .write()
            .await
            .funding_rates
            .insert(symbol.market_name(), rate);
    }

    pub async fn set_perp_mid(&self, symbol: &Symbol, mid: Decimal) {
        let half = dec!(0.0001);
        self.state.write().await.tickers.insert(
            (Venue::Perp, symbol.market_name()),
            Ticker {
                bid: mid * (Decimal::ONE - half),
                ask: mid * (Decimal::ONE + half),
            },
        );
    }

    pub async fn remove_ticker(&self, venue: Venue, symbol: &Symbol) {
        self.state
            .write()
            .await
            .tickers
            .remove(&(venue, symbol.market_name()));
    }

    pub async fn set_account(&self, account: AccountState) {
        self.state.write().await.account = Some(account);
    }

    pub async fn set_spot_balance(&self, asset: &str, free: Decimal) {
        self.state
            .write()
            .await
            .spot_balances
            .insert(asset.to_string(), free);
    }

    pub async fn set_perp_position(&self, symbol: &Symbol, amount: Decimal) {
        self.state
            .write()
            .await
            .perp_positions
            .insert(symbol.market_name(), amount);
    }

    /// Queue a behavior for the next order on `(venue, symbol)`. Unscripted
    /// orders fill normally.
    pub async fn script_order(&self, venue: Venue, symbol: &Symbol, behavior: OrderBehavior) {
        self.state
            .write()
            .await
            .order_script
            .entry((venue, symbol.market_name()))
            .or_default()
            .push_back(behavior);
    }

    pub async fn orders_placed(&self) -> Vec<PlacedOrder> {
        self.state.read().await.orders.clone()
    }

    pub async fn transfers_made(&self) -> Vec<(Wallet, Wallet, String, Decimal)> {
        self.state.read().await.transfers.clone()
    }

    pub async fn spot_balance_of(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .spot_balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn perp_position_of(&self, symbol: &Symbol) -> Decimal {
        self.state
            .read()
            .await
            .perp_positions
            .get(&symbol.market_name())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn apply_fill(
        state: &mut MockState,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) {
        let notional = quantity * price;
        match venue {
            Venue::Spot => {
                let base = state
                    .spot_balances
                    .entry(symbol.base().to_string())
                    .or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *base += quantity,
                    OrderSide::Sell => *base -= quantity,
                }
                let quote = state
                    .spot_balances
                    .entry(symbol.quote().to_string())
                    .or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *quote -= notional,
                    OrderSide::Sell => *quote += notional,
                }
            }
            Venue::Perp => {
                let position = state
                    .perp_positions
                    .entry(symbol.market_name())
                    .or_insert(Decimal::ZERO);
                match side {
                    OrderSide::Buy => *position += quantity,
                    OrderSide::Sell => *position -= quantity,
                }
            }
        }
        state.orders.push(PlacedOrder {
            venue,
            symbol: symbol.market_name(),
            side,
            quantity,
        });
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn list_perp_symbols(&self, quote: &str) -> Result<Vec<Symbol>, GatewayError> {
        Ok(self
            .state
            .read()
            .await
            .perp_symbols
            .iter()
            .filter(|s| s.quote() == quote)
            .cloned()
            .collect())
    }

    async fn fetch_funding_rate(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        self.state
            .read()
            .await
            .funding_rates
            .get(&symbol.market_name())
            .copied()
            .ok_or_else(|| GatewayError::Validation(format!("no funding data for {symbol}")))
    }

    async fn fetch_ticker(&self, venue: Venue, symbol: &Symbol) -> Result<Ticker, GatewayError> {
        self.state
            .read()
            .await
            .tickers
            .get(&(venue, symbol.market_name()))
            .cloned()
            .ok_or_else(|| GatewayError::Validation(format!("no {venue} ticker for {symbol}")))
    }

    async fn fetch_24h_volume(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        self.state
            .read()
            .await
            .volumes
            .get(&symbol.market_name())
            .copied()
            .ok_or_else(|| GatewayError::Validation(format!("no volume data for {symbol}")))
    }

    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &Symbol,
    ) -> Result<InstrumentRules, GatewayError> {
        self.state
            .read()
            .await
            .rules
            .get(&(venue, symbol.market_name()))
            .cloned()
            .ok_or_else(|| GatewayError::Validation(format!("no {venue} rules for {symbol}")))
    }

    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError> {
        let mut state = self.state.write().await;

        if let Some(rules) = state.rules.get(&(venue, symbol.market_name())) {
            if !conforms_to_step(quantity, rules.step_size) {
                return Err(GatewayError::InvalidQuantity {
                    quantity,
                    step: rules.step_size,
                });
            }
        }

        let behavior = state
            .order_script
            .get_mut(&(venue, symbol.market_name()))
            .and_then(|q| q.pop_front())
            .unwrap_or(OrderBehavior::Fill);

        let ticker = state
            .tickers
            .get(&(venue, symbol.market_name()))
            .cloned()
            .ok_or_else(|| GatewayError::Validation(format!("no {venue} ticker for {symbol}")))?;
        let price = match side {
            OrderSide::Buy => ticker.ask,
            OrderSide::Sell => ticker.bid,
        };

        debug!(%symbol, %venue, ?side, %quantity, ?behavior, "mock order");

        match behavior {
            OrderBehavior::Fill => {
                Self::apply_fill(&mut state, venue, symbol, side, quantity, price);
                Ok(OrderFill {
                    quantity,
                    avg_price: price,
                    fee: quantity * price * MOCK_TAKER_FEE,
                })
            }
            OrderBehavior::RejectPrePlace => Err(GatewayError::RejectedPrePlace(
                "scripted rejection".to_string(),
            )),
            OrderBehavior::Ambiguous { lands } => {
                if lands {
                    Self::apply_fill(&mut state, venue, symbol, side, quantity, price);
                }
                Err(GatewayError::AmbiguousWrite(
                    "scripted ambiguous outcome".to_string(),
                ))
            }
        }
    }

    async fn transfer(
        &self,
        from: Wallet,
        to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        if from == Wallet::Spot {
            let free = state
                .spot_balances
                .entry(asset.to_string())
                .or_insert(Decimal::ZERO);
            if *free < amount {
                return Err(GatewayError::RejectedPrePlace(format!(
                    "insufficient {asset} to transfer"
                )));
            }
            *free -= amount;
        }
        state
            .transfers
            .push((from, to, asset.to_string(), amount));
        Ok(())
    }

    async fn fetch_account(&self) -> Result<AccountState, GatewayError> {
        self.state
            .read()
            .await
            .account
            .clone()
            .ok_or_else(|| GatewayError::Validation("no account state configured".to_string()))
    }

    async fn fetch_perp_position(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        Ok(self.perp_position_of(symbol).await)
    }

    async fn fetch_spot_balance(&self, asset: &str) -> Result<Decimal, GatewayError> {
        Ok(self.spot_balance_of(asset).await)
    }
}
