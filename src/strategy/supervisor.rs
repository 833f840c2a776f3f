//! Supervisor: global limits, kill switch, and the main tick.
//!
//! Owns the position registry, drives the scanner, opens positions through
//! the order manager, and spawns one guardian per open position. The kill
//! switch is a process-wide flag observed at tick boundaries; engaging it
//! rejects new entries, drains every live position, and ends the process
//! with a distinguishable exit code.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{self, Config};
use crate::exchange::{ExchangeGateway, GatewayError, Venue};
use crate::persistence::PositionStore;
use crate::position::{ActivePosition, PositionStatus};
use crate::risk::guardian::PositionGuardian;
use crate::strategy::executor::{ExecError, ExecutionOutcome, OrderManager};
use crate::strategy::registry::{spawn_registry, RegistryHandle};
use crate::strategy::scanner::MarketScanner;
use crate::telemetry::{ExitType, TradeEvent, TradeKind, WalletEvent};
use crate::utils::decimal::weighted_average;

/// Registry drain budget once the kill switch engages.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Kill switch with an empty registry.
    CleanShutdown,
    /// Unrecoverable gateway authentication failure.
    AuthFailure,
    /// A state the system cannot resolve within bounded time.
    ManualIntervention,
    /// Drain exceeded its budget with positions still live.
    DrainTimeout,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::CleanShutdown => 0,
            ExitCode::AuthFailure => 1,
            ExitCode::ManualIntervention => 2,
            ExitCode::DrainTimeout => 3,
        }
    }
}

/// Process-wide cooperative cancellation flag.
#[derive(Clone)]
pub struct KillSwitch {
    flag: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engage(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Supervisor {
    config: Config,
    gateway: Arc<dyn ExchangeGateway>,
    order_manager: Arc<OrderManager>,
    scanner: MarketScanner,
    registry: RegistryHandle,
    kill_switch: KillSwitch,
    entry_halt: Arc<AtomicBool>,
    guardians: JoinSet<()>,
}

impl Supervisor {
    /// Load persisted positions, reconcile them against the venue, and
    /// assemble the control plane. A reconciliation discrepancy is a
    /// manual-intervention case surfaced from [`Supervisor::run`].
    pub async fn start(
        config: Config,
        gateway: Arc<dyn ExchangeGateway>,
        store: PositionStore,
    ) -> Result<Self> {
        let kill_switch = KillSwitch::new();
        let entry_halt = Arc::new(AtomicBool::new(false));

        let persisted = store
            .load_live(&config.trading.quote_currency)
            .context("failed to load persisted positions")?;
        if !persisted.is_empty() {
            info!(count = persisted.len(), "resuming persisted positions");
            if let Err(e) = Self::reconcile(gateway.as_ref(), &persisted).await {
                error!(error = %e, "persisted positions do not match the venue");
                entry_halt.store(true, Ordering::SeqCst);
            }
        }

        let order_manager = Arc::new(OrderManager::new(
            gateway.clone(),
            kill_switch.flag(),
            entry_halt.clone(),
        ));
        let scanner = MarketScanner::new(
            config.scanner.clone(),
            &config.trading.quote_currency,
        );
        let (registry, _registry_task) = spawn_registry(
            store,
            persisted.clone(),
            config.trading.max_open_positions,
        );

        let mut supervisor = Self {
            config,
            gateway,
            order_manager,
            scanner,
            registry,
            kill_switch,
            entry_halt,
            guardians: JoinSet::new(),
        };

        for position in &persisted {
            match position.status {
                PositionStatus::Open => supervisor.spawn_guardian(position),
                // A CLOSING row crashed mid-exit; finish the close first.
                PositionStatus::Closing => supervisor.spawn_exit_finisher(position.clone()),
                PositionStatus::Closed => {}
            }
        }

        Ok(supervisor)
    }

    /// Main loop. Returns the process exit status.
    pub async fn run(mut self) -> Result<ExitCode> {
        // Auth probe before anything else: a credential failure is fatal.
        match self.gateway.fetch_account().await {
            Ok(account) => WalletEvent::from(&account).emit(),
            Err(GatewayError::Auth(msg)) => {
                error!(error = %msg, "gateway authentication failed");
                return Ok(ExitCode::AuthFailure);
            }
            Err(e) => return Err(e).context("gateway unreachable at startup"),
        }

        if config::emergency_stop_engaged() {
            warn!("EMERGENCY_STOP set at startup");
            self.kill_switch.engage();
        }

        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.timing.supervisor_period_s));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let scan_period = Duration::from_secs(self.config.timing.scanner_period_s);
        let mut last_scan: Option<Instant> = None;

        loop {
            tick.tick().await;

            if config::emergency_stop_engaged() {
                self.kill_switch.engage();
            }

            if self.entry_halt.load(Ordering::SeqCst) {
                // Raised by the executor (or startup reconciliation) for a
                // state it could not resolve. No automatic closure: acting
                // on an unknown position could make it worse.
                error!("manual intervention raised, exiting");
                return Ok(ExitCode::ManualIntervention);
            }

            if self.kill_switch.is_engaged() {
                return Ok(self.drain().await);
            }

            let scan_due = match last_scan {
                None => true,
                Some(at) => at.elapsed() >= scan_period,
            };
            if scan_due {
                last_scan = Some(Instant::now());
                if let Err(e) = self.scan_and_enter().await {
                    warn!(error = %e, "scan tick failed");
                }
            }
        }
    }

    /// One scanner tick: rank candidates and walk them until the position
    /// cap, skipping symbols already held. Candidates above the cap are
    /// dropped, not queued.
    async fn scan_and_enter(&mut self) -> Result<()> {
        let candidates = self.scanner.scan(self.gateway.as_ref()).await?;

        if let Ok(account) = self.gateway.fetch_account().await {
            WalletEvent::from(&account).emit();
        }

        let live = self.registry.snapshot().await?;
        let held: HashSet<String> = live.iter().map(|p| p.symbol.market_name()).collect();
        let mut slots = self
            .config
            .trading
            .max_open_positions
            .saturating_sub(live.len());

        for candidate in candidates {
            if slots == 0 {
                break;
            }
            let symbol = candidate.snapshot.symbol.clone();
            if held.contains(&symbol.market_name()) {
                continue;
            }

            match self
                .order_manager
                .execute_entry(&symbol, self.config.trading.notional_per_entry)
                .await
            {
                Ok(ExecutionOutcome::BothFilled { position }) => {
                    if let Err(e) = self.registry.insert(position.clone()).await {
                        // The fill exists on the venue but the registry
                        // refused it; never trade our way out of an
                        // inconsistent book.
                        error!(symbol = %position.symbol, error = %e, "untracked fill");
                        self.entry_halt.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    self.spawn_guardian(&position);
                    slots -= 1;
                }
                Ok(outcome) => {
                    info!(%symbol, ?outcome, "entry did not complete");
                }
                Err(ExecError::Halted) => break,
                Err(ExecError::InsufficientNotional { quantity, min_qty }) => {
                    info!(%symbol, %quantity, %min_qty, "notional too small for venue minimum");
                }
                Err(ExecError::ManualIntervention(msg)) => {
                    error!(%symbol, %msg, "entry escalated");
                    break;
                }
                Err(ExecError::Gateway(e)) => {
                    warn!(%symbol, error = %e, "entry failed");
                }
            }
        }
        Ok(())
    }

    /// Kill-switch path: request exit on every live position, then wait for
    /// the registry to empty within the drain budget.
    async fn drain(&mut self) -> ExitCode {
        warn!("kill switch engaged, draining registry");
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        let live = match self.registry.snapshot().await {
            Ok(live) => live,
            Err(e) => {
                error!(error = %e, "registry unavailable during drain");
                return ExitCode::DrainTimeout;
            }
        };

        for position in live {
            if Instant::now() >= deadline {
                break;
            }
            if let Err(e) = self.close_for_drain(&position).await {
                warn!(symbol = %position.symbol, error = %e, "drain close failed");
            }
        }

        loop {
            match self.registry.snapshot().await {
                Ok(live) if live.is_empty() => {
                    info!("registry drained, shutting down");
                    return ExitCode::CleanShutdown;
                }
                Ok(live) => {
                    if Instant::now() >= deadline {
                        error!(remaining = live.len(), "drain timeout with live positions");
                        return ExitCode::DrainTimeout;
                    }
                }
                Err(e) => {
                    error!(error = %e, "registry unavailable during drain");
                    return ExitCode::DrainTimeout;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn close_for_drain(&self, position: &ActivePosition) -> Result<()> {
        let closing = match position.status {
            PositionStatus::Open => {
                self.registry
                    .transition(&position.id, PositionStatus::Closing)
                    .await?
            }
            PositionStatus::Closing => position.clone(),
            PositionStatus::Closed => return Ok(()),
        };

        let fills = self.order_manager.execute_exit(&closing).await?;
        self.registry
            .transition(&position.id, PositionStatus::Closed)
            .await?;

        let price = weighted_average(&[
            (fills.spot.avg_price, fills.spot.quantity),
            (fills.perp.avg_price, fills.perp.quantity),
        ]);
        TradeEvent {
            kind: TradeKind::Exit,
            symbol: position.symbol.market_name(),
            entry_price: price,
            size: fills.spot.quantity,
            notional_quote: fills.spot.quantity * price,
            exit_type: Some(ExitType::Full),
        }
        .emit();
        Ok(())
    }

    /// Compare each persisted position against live venue state. Tolerance
    /// is one step per leg.
    async fn reconcile(
        gateway: &dyn ExchangeGateway,
        positions: &[ActivePosition],
    ) -> Result<()> {
        for position in positions {
            let symbol = &position.symbol;
            let (perp_rules, perp_amount, spot_balance) = tokio::try_join!(
                gateway.fetch_instrument_rules(Venue::Perp, symbol),
                gateway.fetch_perp_position(symbol),
                gateway.fetch_spot_balance(symbol.base()),
            )?;
            let step = perp_rules.step_size;

            let expected_short = -position.perp_qty;
            if (perp_amount - expected_short).abs() > step {
                anyhow::bail!(
                    "perp position for {symbol} is {perp_amount}, expected {expected_short}"
                );
            }
            if spot_balance < position.spot_qty - step {
                anyhow::bail!(
                    "spot balance for {symbol} is {spot_balance}, expected at least {}",
                    position.spot_qty
                );
            }
        }
        Ok(())
    }

    fn spawn_guardian(&mut self, position: &ActivePosition) {
        let guardian = PositionGuardian::new(
            self.gateway.clone(),
            self.order_manager.clone(),
            self.registry.clone(),
            &self.config.exit,
            &self.config.margin,
            self.config.timing.guardian_period_s,
            position,
        );
        self.guardians.spawn(guardian.run());
    }

    /// Finish the exit of a position that was CLOSING when the process
    /// died.
    fn spawn_exit_finisher(&mut self, position: ActivePosition) {
        let order_manager = self.order_manager.clone();
        let registry = self.registry.clone();
        self.guardians.spawn(async move {
            info!(symbol = %position.symbol, "resuming interrupted exit");
            match order_manager.execute_exit(&position).await {
                Ok(_) => {
                    if let Err(e) = registry.transition(&position.id, PositionStatus::Closed).await
                    {
                        warn!(symbol = %position.symbol, error = %e, "could not mark resumed exit closed");
                    }
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "resumed exit failed");
                }
            }
        });
    }
}
