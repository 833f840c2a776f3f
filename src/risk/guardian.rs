//! Per-position guardian: exit triggers, margin rebalancing, funding accrual.
//!
//! One guardian task runs per OPEN position. Each tick samples the funding
//! rate, the perp/spot spread, and the account's margin usage. Exit
//! triggers are evaluated before rebalancing: a closed position needs no
//! rebalance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{ExitConfig, MarginConfig};
use crate::exchange::{ExchangeGateway, Symbol, Venue, Wallet};
use crate::position::{ActivePosition, PositionStatus};
use crate::risk::margin::{MarginPolicy, RebalanceAction};
use crate::strategy::executor::OrderManager;
use crate::strategy::registry::RegistryHandle;
use crate::telemetry::{ExitType, GuardianEvent, TradeEvent, TradeKind};
use crate::utils::decimal::{floor_to_step, perp_spot_spread, weighted_average};

/// A tick exceeding this budget logs and proceeds; it never kills the loop.
const TICK_BUDGET: Duration = Duration::from_secs(8);
/// Funding settles every 8 hours; accrual is pro-rated per tick.
const FUNDING_INTERVAL_SECS: u64 = 8 * 3600;

/// Decision from one observed sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Hold,
    ExitNegativeFr { consecutive: u32 },
    ExitBackwardation { spread: Decimal },
}

/// Pure exit-trigger state machine. Trigger order matters: the debounced
/// funding-rate exit is evaluated first, the single-sample backwardation
/// profit-take second.
#[derive(Debug)]
pub struct GuardianState {
    exit_funding_rate: Decimal,
    exit_spread: Decimal,
    debounce: u32,
    consecutive_negative_fr: u32,
}

impl GuardianState {
    pub fn new(config: &ExitConfig) -> Self {
        Self {
            exit_funding_rate: config.exit_funding_rate,
            exit_spread: config.exit_spread,
            debounce: config.negative_fr_debounce,
            consecutive_negative_fr: 0,
        }
    }

    pub fn consecutive_negative_fr(&self) -> u32 {
        self.consecutive_negative_fr
    }

    /// Feed one sample; first matching trigger wins.
    pub fn observe(&mut self, funding_rate: Decimal, spread: Decimal) -> Verdict {
        if funding_rate <= self.exit_funding_rate {
            self.consecutive_negative_fr += 1;
            if self.consecutive_negative_fr >= self.debounce {
                return Verdict::ExitNegativeFr {
                    consecutive: self.consecutive_negative_fr,
                };
            }
        } else {
            self.consecutive_negative_fr = 0;
        }

        if spread <= self.exit_spread {
            return Verdict::ExitBackwardation { spread };
        }

        Verdict::Hold
    }
}

enum TickOutcome {
    Continue,
    Exited,
}

/// Async loop wrapping [`GuardianState`] for one live position.
pub struct PositionGuardian {
    gateway: Arc<dyn ExchangeGateway>,
    order_manager: Arc<OrderManager>,
    registry: RegistryHandle,
    state: GuardianState,
    policy: MarginPolicy,
    period: Duration,
    period_secs: u64,
    position_id: String,
    symbol: Symbol,
}

impl PositionGuardian {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        order_manager: Arc<OrderManager>,
        registry: RegistryHandle,
        exit_config: &ExitConfig,
        margin_config: &MarginConfig,
        period_secs: u64,
        position: &ActivePosition,
    ) -> Self {
        Self {
            gateway,
            order_manager,
            registry,
            state: GuardianState::new(exit_config),
            policy: MarginPolicy::new(margin_config),
            period: Duration::from_secs(period_secs),
            period_secs,
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
        }
    }

    /// Run until the position leaves the registry or an exit completes.
    pub async fn run(mut self) {
        info!(symbol = %self.symbol, id = %self.position_id, "guardian started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let position = match self.registry.get(&self.position_id).await {
                Ok(Some(p)) if p.status == PositionStatus::Open => p,
                Ok(Some(p)) if p.status == PositionStatus::Closing => {
                    // An earlier exit attempt died partway; finish it.
                    match self.finish_closing(&p).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(symbol = %self.symbol, error = %e, "resumed close failed");
                            continue;
                        }
                    }
                }
                Ok(_) => break, // closed or taken over by the drain
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "registry unavailable");
                    break;
                }
            };

            match timeout(TICK_BUDGET, self.tick(&position)).await {
                Ok(Ok(TickOutcome::Continue)) => {}
                Ok(Ok(TickOutcome::Exited)) => break,
                Ok(Err(e)) => {
                    warn!(symbol = %self.symbol, error = %e, "guardian tick failed");
                }
                Err(_) => {
                    warn!(symbol = %self.symbol, budget_s = TICK_BUDGET.as_secs(), "guardian tick over budget");
                }
            }
        }
        info!(symbol = %self.symbol, id = %self.position_id, "guardian terminated");
    }

    async fn tick(&mut self, position: &ActivePosition) -> Result<TickOutcome> {
        let symbol = &self.symbol;
        let (funding_rate, spot, perp) = tokio::try_join!(
            self.gateway.fetch_funding_rate(symbol),
            self.gateway.fetch_ticker(Venue::Spot, symbol),
            self.gateway.fetch_ticker(Venue::Perp, symbol),
        )?;
        let spread = perp_spot_spread(perp.mid(), spot.mid());

        match self.state.observe(funding_rate, spread) {
            Verdict::ExitNegativeFr { consecutive } => {
                GuardianEvent::TriggerExitNegativeFr {
                    symbol: symbol.market_name(),
                    consecutive_negative_fr: consecutive,
                }
                .emit();
                warn!(%symbol, %funding_rate, consecutive, "funding edge gone, exiting");
                self.close_position().await?;
                return Ok(TickOutcome::Exited);
            }
            Verdict::ExitBackwardation { spread } => {
                GuardianEvent::TriggerExitBackwardation {
                    symbol: symbol.market_name(),
                    spread,
                }
                .emit();
                info!(%symbol, %spread, "backwardation profit-take");
                self.close_position().await?;
                return Ok(TickOutcome::Exited);
            }
            Verdict::Hold => {}
        }

        self.maybe_rebalance(position).await?;

        if funding_rate > Decimal::ZERO {
            let notional = position.perp_qty * perp.mid();
            let accrued = funding_rate * notional * Decimal::from(self.period_secs)
                / Decimal::from(FUNDING_INTERVAL_SECS);
            self.registry
                .accrue_funding(&self.position_id, accrued)
                .await?;
        }

        Ok(TickOutcome::Continue)
    }

    async fn maybe_rebalance(&self, position: &ActivePosition) -> Result<()> {
        let account = self.gateway.fetch_account().await?;
        if !self.policy.usage_is_high(&account) {
            return Ok(());
        }

        let spot_free = self
            .gateway
            .fetch_spot_balance(self.symbol.quote())
            .await?;
        let plan = self.policy.evaluate(&account, spot_free);

        // Margin can recover between the sample and the operation (price
        // moved, another guardian already rebalanced). Skip, don't retry.
        let fresh = self.gateway.fetch_account().await?;
        if !self.policy.usage_is_high(&fresh) {
            info!(symbol = %self.symbol, "margin recovered, skipping rebalance");
            return Ok(());
        }

        match plan {
            RebalanceAction::None => Ok(()),
            RebalanceAction::TransferMargin { amount } => {
                info!(symbol = %self.symbol, %amount, "topping up perp margin from spot wallet");
                self.gateway
                    .transfer(Wallet::Spot, Wallet::Perp, self.symbol.quote(), amount)
                    .await
                    .context("margin transfer failed")?;
                Ok(())
            }
            RebalanceAction::ShrinkPosition { ratio } => self.shrink(position, ratio).await,
        }
    }

    async fn shrink(&self, position: &ActivePosition, ratio: Decimal) -> Result<()> {
        let (spot_rules, perp_rules) = tokio::try_join!(
            self.gateway
                .fetch_instrument_rules(Venue::Spot, &self.symbol),
            self.gateway
                .fetch_instrument_rules(Venue::Perp, &self.symbol),
        )?;
        let step = spot_rules.step_size.max(perp_rules.step_size);

        let quantity = floor_to_step(ratio * position.spot_qty, step)
            .min(position.spot_qty)
            .min(position.perp_qty);
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        info!(symbol = %self.symbol, %ratio, %quantity, "shrinking position to relieve margin");
        let fills = self
            .order_manager
            .execute_partial_close(position, quantity, quantity)
            .await?;

        self.registry
            .apply_rebalance(
                &self.position_id,
                position.spot_qty - fills.spot.quantity,
                position.perp_qty - fills.perp.quantity,
                fills.total_fees(),
            )
            .await?;

        let price = weighted_average(&[
            (fills.spot.avg_price, fills.spot.quantity),
            (fills.perp.avg_price, fills.perp.quantity),
        ]);
        TradeEvent {
            kind: TradeKind::Exit,
            symbol: self.symbol.market_name(),
            entry_price: price,
            size: quantity,
            notional_quote: quantity * price,
            exit_type: Some(ExitType::Rebalance),
        }
        .emit();
        Ok(())
    }

    /// Full exit: CLOSING before dispatch, CLOSED only when both legs
    /// filled. A failure leaves the record in CLOSING for the next tick to
    /// resume.
    async fn close_position(&self) -> Result<()> {
        let closing = self
            .registry
            .transition(&self.position_id, PositionStatus::Closing)
            .await?;
        self.finish_closing(&closing).await
    }

    async fn finish_closing(&self, closing: &ActivePosition) -> Result<()> {
        let fills = self.order_manager.execute_exit(closing).await?;
        self.registry
            .transition(&self.position_id, PositionStatus::Closed)
            .await?;

        let price = weighted_average(&[
            (fills.spot.avg_price, fills.spot.quantity),
            (fills.perp.avg_price, fills.perp.quantity),
        ]);
        TradeEvent {
            kind: TradeKind::Exit,
            symbol: closing.symbol.market_name(),
            entry_price: price,
            size: fills.spot.quantity,
            notional_quote: fills.spot.quantity * price,
            exit_type: Some(ExitType::Full),
        }
        .emit();

        info!(
            symbol = %closing.symbol,
            fees = %fills.total_fees(),
            funding = %closing.accumulated_funding,
            "position closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn state(debounce: u32) -> GuardianState {
        GuardianState::new(&ExitConfig {
            exit_funding_rate: dec!(0.00005),
            exit_spread: dec!(-0.01),
            negative_fr_debounce: debounce,
        })
    }

    #[test]
    fn test_debounce_requires_consecutive_samples() {
        let mut s = state(3);
        assert_eq!(s.observe(dec!(0.0000), dec!(0.003)), Verdict::Hold);
        assert_eq!(s.observe(dec!(0.0000), dec!(0.003)), Verdict::Hold);
        assert_eq!(
            s.observe(dec!(0.0000), dec!(0.003)),
            Verdict::ExitNegativeFr { consecutive: 3 }
        );
    }

    #[test]
    fn test_non_qualifying_sample_resets_counter() {
        // The literal sequence from the strategy definition: exit must fire
        // on the seventh sample (index 6), not before.
        let samples = [
            dec!(0.0001),
            dec!(0.0000),
            dec!(-0.0001),
            dec!(0.0002),
            dec!(0.0000),
            dec!(0.0000),
            dec!(0.0000),
        ];
        let mut s = state(3);
        let mut fired_at = None;
        for (i, fr) in samples.iter().enumerate() {
            if let Verdict::ExitNegativeFr { .. } = s.observe(*fr, dec!(0.003)) {
                fired_at = Some(i);
                break;
            }
        }
        assert_eq!(fired_at, Some(6));
    }

    #[test]
    fn test_funding_rate_boundary_qualifies() {
        // Exactly at the exit threshold counts toward the debounce.
        let mut s = state(3);
        s.observe(dec!(0.00005), dec!(0.003));
        assert_eq!(s.consecutive_negative_fr(), 1);

        // Just above does not, and resets.
        s.observe(dec!(0.000051), dec!(0.003));
        assert_eq!(s.consecutive_negative_fr(), 0);
    }

    #[test]
    fn test_backwardation_fires_on_single_sample() {
        let mut s = state(3);
        assert_eq!(
            s.observe(dec!(0.0004), dec!(-0.012)),
            Verdict::ExitBackwardation {
                spread: dec!(-0.012)
            }
        );
    }

    #[test]
    fn test_backwardation_boundary_is_inclusive() {
        let mut s = state(3);
        assert_eq!(
            s.observe(dec!(0.0004), dec!(-0.01)),
            Verdict::ExitBackwardation { spread: dec!(-0.01) }
        );
        assert_eq!(s.observe(dec!(0.0004), dec!(-0.0099)), Verdict::Hold);
    }

    #[test]
    fn test_negative_fr_trigger_takes_precedence() {
        // Both triggers true on the same sample: the funding-rate exit is
        // evaluated first once debounced.
        let mut s = state(1);
        assert_eq!(
            s.observe(dec!(-0.0001), dec!(-0.02)),
            Verdict::ExitNegativeFr { consecutive: 1 }
        );
    }

    #[test]
    fn test_qualifying_but_undebounced_sample_still_checks_spread() {
        let mut s = state(3);
        // FR qualifies (count 1 of 3) but backwardation fires immediately.
        assert_eq!(
            s.observe(dec!(0.0000), dec!(-0.02)),
            Verdict::ExitBackwardation {
                spread: dec!(-0.02)
            }
        );
    }

    // =========================================================================
    // Guardian loop tests
    // =========================================================================

    use crate::exchange::mock::MockGateway;
    use crate::exchange::{AccountState, InstrumentRules};
    use crate::persistence::PositionStore;
    use crate::strategy::executor::ExecutionOutcome;
    use crate::strategy::registry::spawn_registry;
    use std::sync::atomic::AtomicBool;

    fn doge() -> Symbol {
        Symbol::new("DOGE", "USDT").unwrap()
    }

    async fn open_live_position(
        gateway: &MockGateway,
    ) -> (Arc<OrderManager>, RegistryHandle, ActivePosition) {
        gateway
            .add_market(
                &doge(),
                dec!(0.0004),
                dec!(0.10),
                dec!(0.1003),
                dec!(20_000_000),
                InstrumentRules {
                    min_qty: dec!(1),
                    step_size: dec!(1),
                    tick_size: dec!(0.00001),
                },
            )
            .await;
        gateway
            .set_account(AccountState::new(dec!(5000), dec!(1000), dec!(10000)))
            .await;

        let order_manager = Arc::new(OrderManager::new(
            Arc::new(gateway.clone()),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        ));
        let position = match order_manager
            .execute_entry(&doge(), dec!(1000))
            .await
            .unwrap()
        {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("unexpected {other:?}"),
        };

        let (registry, _task) = spawn_registry(PositionStore::in_memory().unwrap(), Vec::new(), 3);
        registry.insert(position.clone()).await.unwrap();
        (order_manager, registry, position)
    }

    fn guardian_for(
        gateway: &MockGateway,
        order_manager: Arc<OrderManager>,
        registry: RegistryHandle,
        position: &ActivePosition,
    ) -> PositionGuardian {
        PositionGuardian::new(
            Arc::new(gateway.clone()),
            order_manager,
            registry,
            &ExitConfig {
                exit_funding_rate: dec!(0.00005),
                exit_spread: dec!(-0.01),
                negative_fr_debounce: 3,
            },
            &MarginConfig {
                margin_usage_high: dec!(0.80),
                margin_usage_target: dec!(0.50),
            },
            10,
            position,
        )
    }

    async fn wait_until_empty(registry: &RegistryHandle) {
        for _ in 0..200 {
            if registry.snapshot().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("position never closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backwardation_exit_flattens_both_venues() {
        let gateway = MockGateway::new();
        let (order_manager, registry, position) = open_live_position(&gateway).await;

        // Push the perp well below spot: spread -1.5%.
        gateway.set_perp_mid(&doge(), dec!(0.0985)).await;

        let guardian = guardian_for(&gateway, order_manager, registry.clone(), &position);
        let handle = tokio::spawn(guardian.run());

        wait_until_empty(&registry).await;
        handle.await.unwrap();

        assert_eq!(gateway.spot_balance_of("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_fr_exit_waits_for_debounce() {
        let gateway = MockGateway::new();
        let (order_manager, registry, position) = open_live_position(&gateway).await;

        // Funding collapses to zero; three consecutive samples required.
        gateway.set_funding_rate(&doge(), Decimal::ZERO).await;

        let guardian = guardian_for(&gateway, order_manager, registry.clone(), &position);
        let handle = tokio::spawn(guardian.run());

        wait_until_empty(&registry).await;
        handle.await.unwrap();

        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_position_accrues_funding_and_stays_open() {
        let gateway = MockGateway::new();
        let (order_manager, registry, position) = open_live_position(&gateway).await;

        let guardian = guardian_for(&gateway, order_manager, registry.clone(), &position);
        let handle = tokio::spawn(guardian.run());

        // Let a few ticks pass.
        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.abort();

        let live = registry.snapshot().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, PositionStatus::Open);
        assert!(live[0].accumulated_funding > Decimal::ZERO);
    }
}
