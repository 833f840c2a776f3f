//! Atomic two-leg order execution.
//!
//! Every path through entry and exit preserves one invariant: on return,
//! either a balanced delta-neutral position exists, or no exchange-side
//! position attributable to the call exists. Partial failures are recovered
//! by reversing the surviving leg; unknown outcomes are resolved by polling
//! the venue; anything unresolvable halts entries and escalates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::exchange::{
    ExchangeGateway, GatewayError, OrderFill, OrderSide, Symbol, Venue,
};
use crate::position::ActivePosition;
use crate::telemetry::{TradeEvent, TradeKind};
use crate::utils::decimal::{floor_to_step, perp_spot_spread, weighted_average};

/// Wall-clock budget for one leg's dispatch.
const LEG_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to watch for an ambiguous order to appear on the venue.
const OBSERVE_WINDOW: Duration = Duration::from_secs(5);
/// Poll cadence during reconciliation.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Past this, an unresolved leg becomes a manual-intervention case.
const RESOLVE_HARD_CAP: Duration = Duration::from_secs(30);
/// Exit retry budget before escalating.
const MAX_EXIT_ATTEMPTS: u32 = 3;
/// Fee estimate for fills only observed through reconciliation.
const ESTIMATED_TAKER_FEE: Decimal = dec!(0.0004);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("quantity {quantity} below venue minimum {min_qty}")]
    InsufficientNotional {
        quantity: Decimal,
        min_qty: Decimal,
    },
    #[error("entries are halted")]
    Halted,
    #[error("manual intervention required: {0}")]
    ManualIntervention(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// One side of the compound trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Spot,
    Perp,
}

/// Joint result of a two-leg entry attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    BothFilled { position: ActivePosition },
    OneLegOrphaned { leg: Leg, recovered: bool },
    BothFailed,
}

/// Fills from closing both legs.
#[derive(Debug)]
pub struct LegFills {
    pub spot: OrderFill,
    pub perp: OrderFill,
}

impl LegFills {
    pub fn total_fees(&self) -> Decimal {
        self.spot.fee + self.perp.fee
    }
}

/// Resolved outcome of one leg after ambiguity reconciliation.
#[derive(Debug)]
enum LegState {
    Filled(OrderFill),
    Rejected,
}

/// Raw outcome of one leg before reconciliation.
#[derive(Debug)]
enum RawLeg {
    Filled(OrderFill),
    Rejected(String),
    Ambiguous,
}

/// Executes delta-neutral entries and exits. Owns no position state between
/// calls; within one symbol at most one operation is in flight at a time.
pub struct OrderManager {
    gateway: Arc<dyn ExchangeGateway>,
    kill: Arc<AtomicBool>,
    entry_halt: Arc<AtomicBool>,
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OrderManager {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        kill: Arc<AtomicBool>,
        entry_halt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            kill,
            entry_halt,
            symbol_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, symbol: &Symbol) -> Arc<Mutex<()>> {
        let mut locks = self.symbol_locks.lock().await;
        locks
            .entry(symbol.market_name())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn halt_entries(&self, reason: &str) {
        error!(reason, "halting entries globally");
        self.entry_halt.store(true, Ordering::SeqCst);
    }

    // ==================== Entry ====================

    /// Open a delta-neutral position: concurrent market buy on spot and
    /// market sell on the perpetual, sized off the current spot mid.
    pub async fn execute_entry(
        &self,
        symbol: &Symbol,
        notional: Decimal,
    ) -> Result<ExecutionOutcome, ExecError> {
        let lock = self.lock_for(symbol).await;
        let _guard = lock.lock().await;

        // Cancellation is observed here, before dispatch. Once the legs are
        // in flight the operation always runs to joint resolution.
        if self.kill.load(Ordering::SeqCst) || self.entry_halt.load(Ordering::SeqCst) {
            return Err(ExecError::Halted);
        }

        let (spot_rules, perp_rules) = tokio::try_join!(
            self.gateway.fetch_instrument_rules(Venue::Spot, symbol),
            self.gateway.fetch_instrument_rules(Venue::Perp, symbol),
        )?;
        // Both legs must round identically: take the coarser step.
        let step = spot_rules.step_size.max(perp_rules.step_size);
        let min_qty = spot_rules.min_qty.max(perp_rules.min_qty);

        let reference = self.gateway.fetch_ticker(Venue::Spot, symbol).await?.mid();
        if reference <= Decimal::ZERO {
            return Err(ExecError::Gateway(GatewayError::Validation(format!(
                "no usable spot price for {symbol}"
            ))));
        }
        let quantity = floor_to_step(notional / reference, step);
        if quantity < min_qty || quantity.is_zero() {
            return Err(ExecError::InsufficientNotional { quantity, min_qty });
        }

        // Baselines let reconciliation attribute venue-side changes to this
        // call alone.
        let (spot_before, perp_before) = tokio::try_join!(
            self.gateway.fetch_spot_balance(symbol.base()),
            self.gateway.fetch_perp_position(symbol),
        )?;

        info!(%symbol, %quantity, %notional, %reference, "dispatching entry legs");

        let (spot_raw, perp_raw) = tokio::join!(
            self.dispatch_leg(Venue::Spot, symbol, OrderSide::Buy, quantity),
            self.dispatch_leg(Venue::Perp, symbol, OrderSide::Sell, quantity),
        );

        let (spot_state, perp_state) = self
            .resolve_legs(
                symbol,
                step,
                spot_raw,
                spot_before,
                quantity, // spot base balance grows by qty on a buy
                perp_raw,
                perp_before,
                -quantity, // perp position falls by qty on a sell
            )
            .await?;

        match (spot_state, perp_state) {
            (LegState::Filled(spot_fill), LegState::Filled(perp_fill)) => {
                let position = self
                    .finish_entry(symbol, step, spot_fill, perp_fill)
                    .await?;
                Ok(ExecutionOutcome::BothFilled { position })
            }
            (LegState::Filled(spot_fill), LegState::Rejected) => {
                warn!(%symbol, qty = %spot_fill.quantity, "perp leg failed, recovering spot");
                self.recover_leg(Venue::Spot, symbol, OrderSide::Sell, spot_fill.quantity)
                    .await?;
                warn!(%symbol, event = "ENTRY_ABORTED_LEG_RECOVERED", "entry aborted");
                Ok(ExecutionOutcome::OneLegOrphaned {
                    leg: Leg::Spot,
                    recovered: true,
                })
            }
            (LegState::Rejected, LegState::Filled(perp_fill)) => {
                warn!(%symbol, qty = %perp_fill.quantity, "spot leg failed, covering perp");
                self.recover_leg(Venue::Perp, symbol, OrderSide::Buy, perp_fill.quantity)
                    .await?;
                warn!(%symbol, event = "ENTRY_ABORTED_LEG_RECOVERED", "entry aborted");
                Ok(ExecutionOutcome::OneLegOrphaned {
                    leg: Leg::Perp,
                    recovered: true,
                })
            }
            (LegState::Rejected, LegState::Rejected) => {
                info!(%symbol, event = "ENTRY_ABORTED_CLEAN", "both legs rejected, no position exists");
                Ok(ExecutionOutcome::BothFailed)
            }
        }
    }

    /// Step 5 of the entry algorithm: net any fill imbalance beyond one
    /// step, then record the position at the common quantity.
    async fn finish_entry(
        &self,
        symbol: &Symbol,
        step: Decimal,
        spot_fill: OrderFill,
        perp_fill: OrderFill,
    ) -> Result<ActivePosition, ExecError> {
        let mut total_fees = spot_fill.fee + perp_fill.fee;
        let common = spot_fill.quantity.min(perp_fill.quantity);
        let imbalance = (spot_fill.quantity - perp_fill.quantity).abs();

        if imbalance > step {
            let excess = floor_to_step(imbalance, step);
            if excess > Decimal::ZERO {
                let (venue, side) = if spot_fill.quantity > perp_fill.quantity {
                    (Venue::Spot, OrderSide::Sell)
                } else {
                    (Venue::Perp, OrderSide::Buy)
                };
                warn!(%symbol, %excess, %venue, "netting partially orphaned excess");
                let net_fill = self.recover_leg(venue, symbol, side, excess).await?;
                total_fees += net_fill.fee;
            }
        }

        let entry_spread = perp_spot_spread(perp_fill.avg_price, spot_fill.avg_price);
        let position = ActivePosition::open(
            symbol.clone(),
            common,
            common,
            entry_spread,
            total_fees,
            step,
        )
        .map_err(|e| ExecError::ManualIntervention(e.to_string()))?;

        let entry_price = weighted_average(&[
            (spot_fill.avg_price, spot_fill.quantity),
            (perp_fill.avg_price, perp_fill.quantity),
        ]);
        TradeEvent {
            kind: TradeKind::Entry,
            symbol: symbol.market_name(),
            entry_price,
            size: common,
            notional_quote: common * entry_price,
            exit_type: None,
        }
        .emit();

        info!(
            %symbol,
            id = %position.id,
            qty = %common,
            spread = %entry_spread,
            fees = %total_fees,
            "entry complete"
        );
        Ok(position)
    }

    // ==================== Exit / partial close ====================

    /// Close both legs of a position in full. The caller transitions the
    /// record to CLOSING before invoking this and to CLOSED only after it
    /// returns fills for both legs.
    pub async fn execute_exit(&self, position: &ActivePosition) -> Result<LegFills, ExecError> {
        let lock = self.lock_for(&position.symbol).await;
        let _guard = lock.lock().await;
        // Exits run even under the kill switch: draining the registry is
        // exactly what the kill switch asks for.
        self.close_legs(&position.symbol, position.spot_qty, position.perp_qty)
            .await
    }

    /// Coordinated partial close of both legs (margin rebalancing). Same
    /// machinery as a full exit at a reduced quantity.
    pub async fn execute_partial_close(
        &self,
        position: &ActivePosition,
        spot_qty: Decimal,
        perp_qty: Decimal,
    ) -> Result<LegFills, ExecError> {
        let lock = self.lock_for(&position.symbol).await;
        let _guard = lock.lock().await;
        self.close_legs(&position.symbol, spot_qty, perp_qty).await
    }

    /// Sell spot / buy-to-cover perp, retrying failed legs with backoff up
    /// to the attempt budget; anything still open afterwards escalates.
    async fn close_legs(
        &self,
        symbol: &Symbol,
        spot_qty: Decimal,
        perp_qty: Decimal,
    ) -> Result<LegFills, ExecError> {
        let step = {
            let (spot_rules, perp_rules) = tokio::try_join!(
                self.gateway.fetch_instrument_rules(Venue::Spot, symbol),
                self.gateway.fetch_instrument_rules(Venue::Perp, symbol),
            )?;
            spot_rules.step_size.max(perp_rules.step_size)
        };

        let mut spot_fill: Option<OrderFill> = None;
        let mut perp_fill: Option<OrderFill> = None;

        for attempt in 0..MAX_EXIT_ATTEMPTS {
            if attempt > 0 {
                let delay = crate::exchange::limiter::backoff_delay(attempt - 1);
                warn!(%symbol, attempt, delay_ms = delay.as_millis() as u64, "retrying close");
                tokio::time::sleep(delay).await;
            }

            let (spot_before, perp_before) = tokio::try_join!(
                self.gateway.fetch_spot_balance(symbol.base()),
                self.gateway.fetch_perp_position(symbol),
            )?;

            // Only dispatch legs still open; joint await, no ordering.
            let spot_needed = spot_fill.is_none();
            let perp_needed = perp_fill.is_none();
            let (spot_raw, perp_raw) = tokio::join!(
                async {
                    if spot_needed {
                        Some(
                            self.dispatch_leg(Venue::Spot, symbol, OrderSide::Sell, spot_qty)
                                .await,
                        )
                    } else {
                        None
                    }
                },
                async {
                    if perp_needed {
                        Some(
                            self.dispatch_leg(Venue::Perp, symbol, OrderSide::Buy, perp_qty)
                                .await,
                        )
                    } else {
                        None
                    }
                },
            );

            if let Some(raw) = spot_raw {
                match self
                    .resolve_leg(raw, symbol, Leg::Spot, spot_before, -spot_qty, step)
                    .await?
                {
                    LegState::Filled(fill) => spot_fill = Some(fill),
                    LegState::Rejected => {}
                }
            }
            if let Some(raw) = perp_raw {
                match self
                    .resolve_leg(raw, symbol, Leg::Perp, perp_before, perp_qty, step)
                    .await?
                {
                    LegState::Filled(fill) => perp_fill = Some(fill),
                    LegState::Rejected => {}
                }
            }

            if let (Some(spot), Some(perp)) = (&spot_fill, &perp_fill) {
                info!(%symbol, spot_qty = %spot.quantity, perp_qty = %perp.quantity, "close complete");
                return Ok(LegFills {
                    spot: spot.clone(),
                    perp: perp.clone(),
                });
            }
        }

        self.halt_entries("close retry budget exhausted");
        Err(ExecError::ManualIntervention(format!(
            "failed to close both legs of {symbol} after {MAX_EXIT_ATTEMPTS} attempts \
             (spot closed: {}, perp closed: {})",
            spot_fill.is_some(),
            perp_fill.is_some()
        )))
    }

    // ==================== Leg plumbing ====================

    /// Fire one leg and classify the raw result. Timeouts and unknown
    /// network outcomes are ambiguous; proven rejections are clean.
    async fn dispatch_leg(
        &self,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> RawLeg {
        match timeout(
            LEG_TIMEOUT,
            self.gateway.place_market_order(venue, symbol, side, quantity),
        )
        .await
        {
            Ok(Ok(fill)) => RawLeg::Filled(fill),
            Ok(Err(e)) if e.proves_not_placed() => RawLeg::Rejected(e.to_string()),
            Ok(Err(GatewayError::Auth(msg))) => RawLeg::Rejected(msg),
            Ok(Err(_)) => RawLeg::Ambiguous,
            Err(_elapsed) => {
                warn!(%symbol, %venue, "leg dispatch timed out, outcome unknown");
                RawLeg::Ambiguous
            }
        }
    }

    /// Reduce both raw legs to definite states, polling the venue where the
    /// outcome is unknown. Both ambiguous legs reconcile concurrently.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_legs(
        &self,
        symbol: &Symbol,
        step: Decimal,
        spot_raw: RawLeg,
        spot_before: Decimal,
        spot_expected_delta: Decimal,
        perp_raw: RawLeg,
        perp_before: Decimal,
        perp_expected_delta: Decimal,
    ) -> Result<(LegState, LegState), ExecError> {
        if matches!(spot_raw, RawLeg::Ambiguous) && matches!(perp_raw, RawLeg::Ambiguous) {
            let (spot, perp) = tokio::join!(
                self.reconcile(symbol, Leg::Spot, spot_before, spot_expected_delta, step),
                self.reconcile(symbol, Leg::Perp, perp_before, perp_expected_delta, step),
            );
            return Ok((spot?, perp?));
        }

        let spot = self
            .resolve_leg(spot_raw, symbol, Leg::Spot, spot_before, spot_expected_delta, step)
            .await?;
        let perp = self
            .resolve_leg(perp_raw, symbol, Leg::Perp, perp_before, perp_expected_delta, step)
            .await?;
        Ok((spot, perp))
    }

    async fn resolve_leg(
        &self,
        raw: RawLeg,
        symbol: &Symbol,
        leg: Leg,
        baseline: Decimal,
        expected_delta: Decimal,
        step: Decimal,
    ) -> Result<LegState, ExecError> {
        match raw {
            RawLeg::Filled(fill) => Ok(LegState::Filled(fill)),
            RawLeg::Rejected(reason) => {
                info!(%symbol, ?leg, %reason, "leg rejected before placement");
                Ok(LegState::Rejected)
            }
            RawLeg::Ambiguous => self.reconcile(symbol, leg, baseline, expected_delta, step).await,
        }
    }

    /// Poll the venue to decide whether an ambiguous order landed. Observes
    /// for [`OBSERVE_WINDOW`]; persistent query failures past
    /// [`RESOLVE_HARD_CAP`] halt entries and escalate.
    async fn reconcile(
        &self,
        symbol: &Symbol,
        leg: Leg,
        baseline: Decimal,
        expected_delta: Decimal,
        step: Decimal,
    ) -> Result<LegState, ExecError> {
        let start = Instant::now();
        warn!(%symbol, ?leg, "reconciling ambiguous leg by polling");

        loop {
            let observed = match leg {
                Leg::Spot => self.gateway.fetch_spot_balance(symbol.base()).await,
                Leg::Perp => self.gateway.fetch_perp_position(symbol).await,
            };

            match observed {
                Ok(observed) => {
                    let drift_if_landed = (observed - baseline - expected_delta).abs();
                    let drift_if_absent = (observed - baseline).abs();
                    if drift_if_landed < drift_if_absent || drift_if_landed <= step {
                        info!(%symbol, ?leg, %observed, "ambiguous leg landed");
                        return Ok(LegState::Filled(
                            self.synthesize_fill(symbol, leg, expected_delta.abs()).await?,
                        ));
                    }
                    if start.elapsed() >= OBSERVE_WINDOW {
                        info!(%symbol, ?leg, "no venue-side change observed, leg did not land");
                        return Ok(LegState::Rejected);
                    }
                }
                Err(e) => {
                    warn!(%symbol, ?leg, error = %e, "reconciliation poll failed");
                    if start.elapsed() >= RESOLVE_HARD_CAP {
                        self.halt_entries("unresolvable ambiguous leg");
                        return Err(ExecError::ManualIntervention(format!(
                            "cannot resolve {leg:?} leg of {symbol} within {}s",
                            RESOLVE_HARD_CAP.as_secs()
                        )));
                    }
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Build a fill record for an order only observed through polling; the
    /// venue reported no execution details, so price and fee are estimated
    /// from the current touch.
    async fn synthesize_fill(
        &self,
        symbol: &Symbol,
        leg: Leg,
        quantity: Decimal,
    ) -> Result<OrderFill, ExecError> {
        let venue = match leg {
            Leg::Spot => Venue::Spot,
            Leg::Perp => Venue::Perp,
        };
        let price = self.gateway.fetch_ticker(venue, symbol).await?.mid();
        Ok(OrderFill {
            quantity,
            avg_price: price,
            fee: quantity * price * ESTIMATED_TAKER_FEE,
        })
    }

    /// Reverse a surviving leg at market. Failure here leaves naked
    /// exposure, so it escalates rather than returning partial success.
    async fn recover_leg(
        &self,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExecError> {
        match self
            .gateway
            .place_market_order(venue, symbol, side, quantity)
            .await
        {
            Ok(fill) => Ok(fill),
            Err(e) => {
                self.halt_entries("leg recovery failed");
                error!(%symbol, %venue, error = %e, "leg recovery failed, naked exposure remains");
                Err(ExecError::ManualIntervention(format!(
                    "failed to recover {venue} leg of {symbol}: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockGateway, OrderBehavior};
    use crate::exchange::InstrumentRules;
    use crate::position::PositionStatus;

    fn doge() -> Symbol {
        Symbol::new("DOGE", "USDT").unwrap()
    }

    fn unit_rules() -> InstrumentRules {
        InstrumentRules {
            min_qty: dec!(1),
            step_size: dec!(1),
            tick_size: dec!(0.00001),
        }
    }

    async fn setup() -> (MockGateway, OrderManager) {
        let gateway = MockGateway::new();
        gateway
            .add_market(
                &doge(),
                dec!(0.0004),
                dec!(0.10),
                dec!(0.1003),
                dec!(20_000_000),
                unit_rules(),
            )
            .await;
        let manager = OrderManager::new(
            Arc::new(gateway.clone()),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        (gateway, manager)
    }

    // ==================== Entry ====================

    #[tokio::test]
    async fn test_happy_entry_opens_balanced_position() {
        let (gateway, manager) = setup().await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        let position = match outcome {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("expected BothFilled, got {other:?}"),
        };

        // notional 1000 / spot mid 0.10 = 10000, floored to step 1.
        assert_eq!(position.spot_qty, dec!(10000));
        assert_eq!(position.perp_qty, dec!(10000));
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.entry_spread > dec!(0.002));
        assert!(position.total_fees > Decimal::ZERO);

        assert_eq!(gateway.spot_balance_of("DOGE").await, dec!(10000));
        assert_eq!(gateway.perp_position_of(&doge()).await, dec!(-10000));
    }

    #[tokio::test]
    async fn test_insufficient_notional_rejected() {
        let (_gateway, manager) = setup().await;
        // 0.05 quote / 0.10 price = 0.5 units, floors to zero at step 1.
        let err = manager.execute_entry(&doge(), dec!(0.05)).await.unwrap_err();
        assert!(matches!(err, ExecError::InsufficientNotional { .. }));
    }

    #[tokio::test]
    async fn test_perp_rejection_recovers_spot() {
        let (gateway, manager) = setup().await;
        gateway
            .script_order(Venue::Perp, &doge(), OrderBehavior::RejectPrePlace)
            .await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::OneLegOrphaned {
                leg: Leg::Spot,
                recovered: true
            }
        ));

        // Spot bought then sold back: flat. No perp position.
        assert_eq!(gateway.spot_balance_of("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_spot_rejection_covers_perp() {
        let (gateway, manager) = setup().await;
        gateway
            .script_order(Venue::Spot, &doge(), OrderBehavior::RejectPrePlace)
            .await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::OneLegOrphaned {
                leg: Leg::Perp,
                recovered: true
            }
        ));
        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_both_rejected_is_clean() {
        let (gateway, manager) = setup().await;
        gateway
            .script_order(Venue::Spot, &doge(), OrderBehavior::RejectPrePlace)
            .await;
        gateway
            .script_order(Venue::Perp, &doge(), OrderBehavior::RejectPrePlace)
            .await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::BothFailed));
        assert!(gateway.orders_placed().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_perp_that_landed_completes_entry() {
        let (gateway, manager) = setup().await;
        gateway
            .script_order(Venue::Perp, &doge(), OrderBehavior::Ambiguous { lands: true })
            .await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        let position = match outcome {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("expected BothFilled, got {other:?}"),
        };
        assert_eq!(position.spot_qty, dec!(10000));
        assert_eq!(gateway.perp_position_of(&doge()).await, dec!(-10000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_perp_that_vanished_recovers_spot() {
        let (gateway, manager) = setup().await;
        gateway
            .script_order(Venue::Perp, &doge(), OrderBehavior::Ambiguous { lands: false })
            .await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::OneLegOrphaned {
                leg: Leg::Spot,
                recovered: true
            }
        ));
        assert_eq!(gateway.spot_balance_of("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_ambiguous_both_landed() {
        let (gateway, manager) = setup().await;
        gateway
            .script_order(Venue::Spot, &doge(), OrderBehavior::Ambiguous { lands: true })
            .await;
        gateway
            .script_order(Venue::Perp, &doge(), OrderBehavior::Ambiguous { lands: true })
            .await;

        let outcome = manager.execute_entry(&doge(), dec!(1000)).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::BothFilled { .. }));
        assert_eq!(gateway.spot_balance_of("DOGE").await, dec!(10000));
        assert_eq!(gateway.perp_position_of(&doge()).await, dec!(-10000));
    }

    #[tokio::test]
    async fn test_entry_rejected_when_kill_switch_engaged() {
        let gateway = MockGateway::new();
        gateway
            .add_market(&doge(), dec!(0.0004), dec!(0.10), dec!(0.1003), dec!(20_000_000), unit_rules())
            .await;
        let kill = Arc::new(AtomicBool::new(true));
        let manager = OrderManager::new(
            Arc::new(gateway.clone()),
            kill,
            Arc::new(AtomicBool::new(false)),
        );

        let err = manager.execute_entry(&doge(), dec!(1000)).await.unwrap_err();
        assert!(matches!(err, ExecError::Halted));
        assert!(gateway.orders_placed().await.is_empty());
    }

    // ==================== Exit ====================

    #[tokio::test]
    async fn test_exit_reverses_entry() {
        let (gateway, manager) = setup().await;

        let position = match manager.execute_entry(&doge(), dec!(1000)).await.unwrap() {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("unexpected {other:?}"),
        };

        let fills = manager.execute_exit(&position).await.unwrap();
        assert!(fills.total_fees() > Decimal::ZERO);

        // Net inventory change on both venues is zero.
        assert_eq!(gateway.spot_balance_of("DOGE").await, Decimal::ZERO);
        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_retries_failed_leg() {
        let (gateway, manager) = setup().await;
        let position = match manager.execute_entry(&doge(), dec!(1000)).await.unwrap() {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("unexpected {other:?}"),
        };

        // First perp cover attempt rejects; second succeeds.
        gateway
            .script_order(Venue::Perp, &doge(), OrderBehavior::RejectPrePlace)
            .await;

        let fills = manager.execute_exit(&position).await.unwrap();
        assert_eq!(fills.perp.quantity, dec!(10000));
        assert_eq!(gateway.perp_position_of(&doge()).await, Decimal::ZERO);
        assert_eq!(gateway.spot_balance_of("DOGE").await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_escalates_after_retry_budget() {
        let (gateway, manager) = setup().await;
        let position = match manager.execute_entry(&doge(), dec!(1000)).await.unwrap() {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("unexpected {other:?}"),
        };

        for _ in 0..MAX_EXIT_ATTEMPTS {
            gateway
                .script_order(Venue::Perp, &doge(), OrderBehavior::RejectPrePlace)
                .await;
        }

        let err = manager.execute_exit(&position).await.unwrap_err();
        assert!(matches!(err, ExecError::ManualIntervention(_)));
    }

    #[tokio::test]
    async fn test_partial_close_shrinks_both_legs() {
        let (gateway, manager) = setup().await;
        let position = match manager.execute_entry(&doge(), dec!(1000)).await.unwrap() {
            ExecutionOutcome::BothFilled { position } => position,
            other => panic!("unexpected {other:?}"),
        };

        let fills = manager
            .execute_partial_close(&position, dec!(5000), dec!(5000))
            .await
            .unwrap();
        assert_eq!(fills.spot.quantity, dec!(5000));
        assert_eq!(gateway.spot_balance_of("DOGE").await, dec!(5000));
        assert_eq!(gateway.perp_position_of(&doge()).await, dec!(-5000));
    }
}
