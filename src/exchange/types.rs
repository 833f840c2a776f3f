//! Core exchange-facing types shared by every gateway implementation.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::GatewayError;

/// A tradable spot/perpetual pair on one exchange.
///
/// Immutable once discovered. The same base/quote pair names both the spot
/// instrument and the matching perpetual; gateway calls take a [`Venue`] to
/// select which book the call targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Build a symbol, rejecting empty or non-uppercase asset codes.
    pub fn new(base: &str, quote: &str) -> Result<Self, GatewayError> {
        if base.is_empty() || quote.is_empty() {
            return Err(GatewayError::Validation(format!(
                "empty asset in symbol '{base}/{quote}'"
            )));
        }
        if base.chars().any(|c| c.is_ascii_lowercase())
            || quote.chars().any(|c| c.is_ascii_lowercase())
        {
            return Err(GatewayError::Validation(format!(
                "asset codes must be uppercase: '{base}/{quote}'"
            )));
        }
        Ok(Self {
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Concatenated market name, e.g. "DOGEUSDT".
    pub fn market_name(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Which book an order or query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Spot,
    Perp,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Spot => write!(f, "spot"),
            Venue::Perp => write!(f, "perp"),
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Wallet for internal transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wallet {
    Spot,
    Perp,
}

/// Best bid/ask snapshot for one instrument.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Ticker {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Trading rules for one instrument on one venue.
#[derive(Debug, Clone)]
pub struct InstrumentRules {
    /// Minimum tradable quantity.
    pub min_qty: Decimal,
    /// Quantity increment.
    pub step_size: Decimal,
    /// Price increment.
    pub tick_size: Decimal,
}

/// Result of a filled market order.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub quantity: Decimal,
    pub avg_price: Decimal,
    /// Taker fee in quote currency.
    pub fee: Decimal,
}

impl OrderFill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.avg_price
    }
}

/// Full snapshot of the account's margin standing. Sampled, not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AccountState {
    pub withdrawable: Decimal,
    pub margin_used: Decimal,
    pub margin_usage_pct: Decimal,
    pub account_value: Decimal,
}

impl AccountState {
    /// Derives the usage percentage; zero equity reads as fully used.
    pub fn new(withdrawable: Decimal, margin_used: Decimal, account_value: Decimal) -> Self {
        let margin_usage_pct = if account_value > Decimal::ZERO {
            margin_used / account_value
        } else {
            Decimal::ONE
        };
        Self {
            withdrawable,
            margin_used,
            margin_usage_pct,
            account_value,
        }
    }
}
