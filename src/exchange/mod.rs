//! Exchange gateway layer.
//!
//! A uniform, rate-limited, retrying facade over one exchange's spot and
//! perpetual endpoints. Queries retry transient failures internally; writes
//! surface unknown outcomes as [`GatewayError::AmbiguousWrite`] so the order
//! manager decides how to reconcile.

mod binance;
mod error;
mod gateway;
pub mod limiter;
pub mod mock;
mod paper;
mod types;

pub use binance::BinanceGateway;
pub use error::GatewayError;
pub use gateway::ExchangeGateway;
pub use paper::PaperGateway;
pub use types::{
    AccountState, InstrumentRules, OrderFill, OrderSide, Symbol, Ticker, Venue, Wallet,
};
