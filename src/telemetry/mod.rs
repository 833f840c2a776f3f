//! Telemetry events for the external sink.
//!
//! Events serialize to JSON and go through `tracing` under a dedicated
//! target so a collector can route them without parsing free-form log
//! lines.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::exchange::AccountState;

pub const TELEMETRY_TARGET: &str = "telemetry";

fn emit(kind: &str, payload: &impl Serialize) {
    let json = serde_json::to_string(payload).unwrap_or_default();
    info!(target: TELEMETRY_TARGET, "{kind}: {json}");
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    Full,
    Rebalance,
}

/// One executed entry or exit (full or partial).
#[derive(Debug, Serialize)]
pub struct TradeEvent {
    pub kind: TradeKind,
    pub symbol: String,
    /// Volume-weighted price across both legs.
    pub entry_price: Decimal,
    pub size: Decimal,
    pub notional_quote: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_type: Option<ExitType>,
}

impl TradeEvent {
    pub fn emit(&self) {
        emit("trade", self);
    }
}

/// Account margin snapshot.
#[derive(Debug, Serialize)]
pub struct WalletEvent {
    pub withdrawable: Decimal,
    pub margin_used: Decimal,
    pub margin_usage_pct: Decimal,
    pub account_value: Decimal,
}

impl WalletEvent {
    pub fn emit(&self) {
        emit("wallet", self);
    }
}

impl From<&AccountState> for WalletEvent {
    fn from(account: &AccountState) -> Self {
        Self {
            withdrawable: account.withdrawable,
            margin_used: account.margin_used,
            margin_usage_pct: account.margin_usage_pct,
            account_value: account.account_value,
        }
    }
}

/// Guardian exit triggers.
#[derive(Debug, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum GuardianEvent {
    TriggerExitNegativeFr {
        symbol: String,
        consecutive_negative_fr: u32,
    },
    TriggerExitBackwardation {
        symbol: String,
        spread: Decimal,
    },
}

impl GuardianEvent {
    pub fn emit(&self) {
        emit("guardian", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_event_serialization() {
        let event = TradeEvent {
            kind: TradeKind::Exit,
            symbol: "DOGEUSDT".to_string(),
            entry_price: dec!(0.1001),
            size: dec!(10000),
            notional_quote: dec!(1001),
            exit_type: Some(ExitType::Full),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"exit\""));
        assert!(json.contains("\"exit_type\":\"full\""));
    }

    #[test]
    fn test_entry_event_omits_exit_type() {
        let event = TradeEvent {
            kind: TradeKind::Entry,
            symbol: "DOGEUSDT".to_string(),
            entry_price: dec!(0.1001),
            size: dec!(10000),
            notional_quote: dec!(1001),
            exit_type: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("exit_type"));
    }

    #[test]
    fn test_guardian_event_tagging() {
        let event = GuardianEvent::TriggerExitNegativeFr {
            symbol: "DOGEUSDT".to_string(),
            consecutive_negative_fr: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"trigger\":\"trigger_exit_negative_fr\""));
        assert!(json.contains("\"consecutive_negative_fr\":3"));
    }
}
