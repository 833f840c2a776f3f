//! Venue-agnostic gateway trait.
//!
//! A capability-typed facade over one exchange's spot and perpetual
//! endpoints. Implementations own rate limiting and query retries; writes
//! are never retried on unknown outcome — they surface
//! [`GatewayError::AmbiguousWrite`] so the order manager can reconcile.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::exchange::{
    AccountState, GatewayError, InstrumentRules, OrderFill, OrderSide, Symbol, Ticker, Venue,
    Wallet,
};

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// All perpetual symbols currently tradable against the given quote.
    async fn list_perp_symbols(&self, quote: &str) -> Result<Vec<Symbol>, GatewayError>;

    /// Predicted funding rate for the next interval.
    async fn fetch_funding_rate(&self, symbol: &Symbol) -> Result<Decimal, GatewayError>;

    /// Best bid/ask on the given venue.
    async fn fetch_ticker(&self, venue: Venue, symbol: &Symbol) -> Result<Ticker, GatewayError>;

    /// 24-hour quote-denominated volume on the perpetual.
    async fn fetch_24h_volume(&self, symbol: &Symbol) -> Result<Decimal, GatewayError>;

    /// Minimum size, step size, and tick size for one instrument.
    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &Symbol,
    ) -> Result<InstrumentRules, GatewayError>;

    /// Place a taker order. The quantity must already conform to the
    /// instrument's step size; non-conforming input is rejected with
    /// [`GatewayError::InvalidQuantity`], never rounded.
    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError>;

    /// Move an asset between the spot and perpetual wallets.
    async fn transfer(
        &self,
        from: Wallet,
        to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError>;

    /// Full margin-account snapshot.
    async fn fetch_account(&self) -> Result<AccountState, GatewayError>;

    /// Signed perpetual position amount (negative = short). Used by the
    /// executor's ambiguity reconciliation.
    async fn fetch_perp_position(&self, symbol: &Symbol) -> Result<Decimal, GatewayError>;

    /// Free spot balance of one asset. Used by the executor's ambiguity
    /// reconciliation.
    async fn fetch_spot_balance(&self, asset: &str) -> Result<Decimal, GatewayError>;
}
