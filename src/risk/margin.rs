//! Margin-usage policy: when and how to rebalance.

use rust_decimal::Decimal;
use tracing::debug;

use crate::config::MarginConfig;
use crate::exchange::AccountState;

/// What the guardian should do about margin on this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceAction {
    None,
    /// Move quote from the spot wallet into the perpetual wallet.
    TransferMargin { amount: Decimal },
    /// No spare quote: shrink both legs by this fraction.
    ShrinkPosition { ratio: Decimal },
}

/// Pure decision layer over the account snapshot. Margin usage here is
/// `margin_used / account_value` as reported by the gateway; the
/// venue-specific formula lives behind that mapping.
pub struct MarginPolicy {
    high: Decimal,
    target: Decimal,
}

impl MarginPolicy {
    pub fn new(config: &MarginConfig) -> Self {
        Self {
            high: config.margin_usage_high,
            target: config.margin_usage_target,
        }
    }

    pub fn usage_is_high(&self, account: &AccountState) -> bool {
        account.margin_usage_pct >= self.high
    }

    /// Decide the rebalance for a high-usage account. Prefers topping up
    /// margin from the spot wallet; shrinks the position only when no free
    /// quote remains.
    pub fn evaluate(&self, account: &AccountState, spot_free_quote: Decimal) -> RebalanceAction {
        if !self.usage_is_high(account) {
            return RebalanceAction::None;
        }

        debug!(
            usage = %account.margin_usage_pct,
            high = %self.high,
            %spot_free_quote,
            "margin usage high"
        );

        if spot_free_quote > Decimal::ZERO {
            // usage = used / (value + x) = target  =>  x = used/target - value
            let needed = account.margin_used / self.target - account.account_value;
            let amount = needed.min(spot_free_quote);
            if amount > Decimal::ZERO {
                return RebalanceAction::TransferMargin { amount };
            }
        }

        if account.margin_used > Decimal::ZERO {
            // usage' = used*(1-r) / value = target  =>  r = 1 - target*value/used
            let ratio = Decimal::ONE - (self.target * account.account_value) / account.margin_used;
            let ratio = ratio.clamp(Decimal::ZERO, Decimal::ONE);
            if ratio > Decimal::ZERO {
                return RebalanceAction::ShrinkPosition { ratio };
            }
        }

        RebalanceAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn policy() -> MarginPolicy {
        MarginPolicy::new(&MarginConfig {
            margin_usage_high: dec!(0.80),
            margin_usage_target: dec!(0.50),
        })
    }

    fn account(margin_used: Decimal, account_value: Decimal) -> AccountState {
        AccountState::new(Decimal::ZERO, margin_used, account_value)
    }

    #[test]
    fn test_healthy_usage_no_action() {
        let action = policy().evaluate(&account(dec!(500), dec!(1000)), dec!(1000));
        assert_eq!(action, RebalanceAction::None);
    }

    #[test]
    fn test_high_threshold_is_inclusive() {
        // Exactly 80% usage triggers.
        let a = account(dec!(800), dec!(1000));
        assert!(policy().usage_is_high(&a));
        assert_ne!(policy().evaluate(&a, dec!(100)), RebalanceAction::None);
    }

    #[test]
    fn test_transfer_sized_to_reach_target() {
        // used 800 / value 1000 = 80%. To reach 50%: 800/0.5 - 1000 = 600.
        let action = policy().evaluate(&account(dec!(800), dec!(1000)), dec!(10_000));
        assert_eq!(
            action,
            RebalanceAction::TransferMargin { amount: dec!(600) }
        );
    }

    #[test]
    fn test_transfer_capped_by_available() {
        let action = policy().evaluate(&account(dec!(800), dec!(1000)), dec!(250));
        assert_eq!(
            action,
            RebalanceAction::TransferMargin { amount: dec!(250) }
        );
    }

    #[test]
    fn test_shrink_when_no_free_quote() {
        // r = 1 - 0.5*1000/800 = 0.375
        let action = policy().evaluate(&account(dec!(800), dec!(1000)), Decimal::ZERO);
        match action {
            RebalanceAction::ShrinkPosition { ratio } => {
                assert_eq!(ratio, dec!(0.375));
            }
            other => panic!("expected shrink, got {other:?}"),
        }
    }

    #[test]
    fn test_shrink_ratio_restores_target_usage() {
        let a = account(dec!(850), dec!(1000));
        let action = policy().evaluate(&a, Decimal::ZERO);
        let RebalanceAction::ShrinkPosition { ratio } = action else {
            panic!("expected shrink");
        };
        // Post-shrink usage: used*(1-r)/value comes back to the target,
        // within division rounding.
        let post = a.margin_used * (Decimal::ONE - ratio) / a.account_value;
        assert!((post - dec!(0.50)).abs() < dec!(0.0000001));
    }
}
