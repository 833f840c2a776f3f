//! Durable record of an entered cash-and-carry leg pair.

use anyhow::{bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exchange::Symbol;

/// Lifecycle state. Transitions are monotonic; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSING" => Ok(PositionStatus::Closing),
            "CLOSED" => Ok(PositionStatus::Closed),
            other => bail!("unknown position status '{other}'"),
        }
    }
}

/// One delta-neutral position: long spot, short perpetual, equal quantity
/// within step rounding.
#[derive(Debug, Clone)]
pub struct ActivePosition {
    pub id: String,
    pub symbol: Symbol,
    /// Unix seconds.
    pub entry_timestamp: i64,
    pub spot_qty: Decimal,
    pub perp_qty: Decimal,
    /// Quantity-weighted average entry spread.
    pub entry_spread: Decimal,
    /// Cumulative fees in quote currency, both legs.
    pub total_fees: Decimal,
    /// Funding accrued while the position has been open (estimate).
    pub accumulated_funding: Decimal,
    pub status: PositionStatus,
}

impl ActivePosition {
    /// Open a new position. Rejects empty or mismatched legs beyond one
    /// step; the executor nets leg imbalance before constructing this.
    pub fn open(
        symbol: Symbol,
        spot_qty: Decimal,
        perp_qty: Decimal,
        entry_spread: Decimal,
        total_fees: Decimal,
        step_size: Decimal,
    ) -> Result<Self> {
        if spot_qty <= Decimal::ZERO || perp_qty <= Decimal::ZERO {
            bail!("position legs must be positive: spot={spot_qty} perp={perp_qty}");
        }
        if (spot_qty - perp_qty).abs() > step_size {
            bail!(
                "legs differ beyond one step: spot={spot_qty} perp={perp_qty} step={step_size}"
            );
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            symbol,
            entry_timestamp: Utc::now().timestamp(),
            spot_qty,
            perp_qty,
            entry_spread,
            total_fees,
            accumulated_funding: Decimal::ZERO,
            status: PositionStatus::Open,
        })
    }

    /// Advance the lifecycle. Only `Open -> Closing` and
    /// `Closing -> Closed` are legal.
    pub fn transition(&mut self, next: PositionStatus) -> Result<()> {
        let legal = matches!(
            (self.status, next),
            (PositionStatus::Open, PositionStatus::Closing)
                | (PositionStatus::Closing, PositionStatus::Closed)
        );
        if !legal {
            bail!(
                "illegal transition {} -> {} for position {}",
                self.status.as_str(),
                next.as_str(),
                self.id
            );
        }
        self.status = next;
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.status != PositionStatus::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn doge() -> Symbol {
        Symbol::new("DOGE", "USDT").unwrap()
    }

    fn open_position() -> ActivePosition {
        ActivePosition::open(
            doge(),
            dec!(10000),
            dec!(10000),
            dec!(0.003),
            dec!(0.8),
            dec!(1),
        )
        .unwrap()
    }

    #[test]
    fn test_open_assigns_id_and_status() {
        let p = open_position();
        assert!(!p.id.is_empty());
        assert_eq!(p.status, PositionStatus::Open);
        assert!(p.is_live());
        assert_eq!(p.accumulated_funding, Decimal::ZERO);
    }

    #[test]
    fn test_open_rejects_imbalanced_legs() {
        let err = ActivePosition::open(
            doge(),
            dec!(10000),
            dec!(9998),
            dec!(0.003),
            dec!(0.8),
            dec!(1),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_legs_within_one_step_accepted() {
        let p = ActivePosition::open(
            doge(),
            dec!(10000),
            dec!(9999),
            dec!(0.003),
            dec!(0.8),
            dec!(1),
        );
        assert!(p.is_ok());
    }

    #[test]
    fn test_open_rejects_zero_quantity() {
        assert!(ActivePosition::open(
            doge(),
            Decimal::ZERO,
            Decimal::ZERO,
            dec!(0.003),
            Decimal::ZERO,
            dec!(1),
        )
        .is_err());
    }

    #[test]
    fn test_lifecycle_is_monotonic() {
        let mut p = open_position();
        assert!(p.transition(PositionStatus::Closed).is_err());
        p.transition(PositionStatus::Closing).unwrap();
        assert!(p.transition(PositionStatus::Open).is_err());
        p.transition(PositionStatus::Closed).unwrap();
        assert!(!p.is_live());
        // Terminal state.
        assert!(p.transition(PositionStatus::Closing).is_err());
        assert!(p.transition(PositionStatus::Closed).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PositionStatus::Open,
            PositionStatus::Closing,
            PositionStatus::Closed,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PositionStatus::parse("LIMBO").is_err());
    }
}
