//! Position registry actor.
//!
//! The supervisor exclusively owns the set of live positions; guardians
//! hold a [`RegistryHandle`] and request mutations via messages. Every
//! mutation is persisted before the reply is sent, so a crash never loses
//! an acknowledged transition.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::persistence::PositionStore;
use crate::position::{ActivePosition, PositionStatus};

enum RegistryCommand {
    Insert {
        position: ActivePosition,
        reply: oneshot::Sender<Result<()>>,
    },
    Transition {
        id: String,
        status: PositionStatus,
        reply: oneshot::Sender<Result<ActivePosition>>,
    },
    ApplyRebalance {
        id: String,
        spot_qty: Decimal,
        perp_qty: Decimal,
        extra_fees: Decimal,
        reply: oneshot::Sender<Result<()>>,
    },
    AccrueFunding {
        id: String,
        amount: Decimal,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<ActivePosition>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ActivePosition>>,
    },
}

/// Cloneable capability to read the registry and request transitions.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Add a freshly opened position. Enforces the one-live-position-per-
    /// symbol and max-open-positions invariants.
    pub async fn insert(&self, position: ActivePosition) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Insert { position, reply })
            .await
            .map_err(|_| anyhow!("registry task is gone"))?;
        rx.await.map_err(|_| anyhow!("registry dropped the reply"))?
    }

    /// Advance a position's lifecycle; returns the updated record.
    pub async fn transition(&self, id: &str, status: PositionStatus) -> Result<ActivePosition> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Transition {
                id: id.to_string(),
                status,
                reply,
            })
            .await
            .map_err(|_| anyhow!("registry task is gone"))?;
        rx.await.map_err(|_| anyhow!("registry dropped the reply"))?
    }

    /// Record a coordinated partial close.
    pub async fn apply_rebalance(
        &self,
        id: &str,
        spot_qty: Decimal,
        perp_qty: Decimal,
        extra_fees: Decimal,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::ApplyRebalance {
                id: id.to_string(),
                spot_qty,
                perp_qty,
                extra_fees,
                reply,
            })
            .await
            .map_err(|_| anyhow!("registry task is gone"))?;
        rx.await.map_err(|_| anyhow!("registry dropped the reply"))?
    }

    /// Add estimated funding income to a position.
    pub async fn accrue_funding(&self, id: &str, amount: Decimal) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::AccrueFunding {
                id: id.to_string(),
                amount,
                reply,
            })
            .await
            .map_err(|_| anyhow!("registry task is gone"))?;
        rx.await.map_err(|_| anyhow!("registry dropped the reply"))?
    }

    pub async fn get(&self, id: &str) -> Result<Option<ActivePosition>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Get {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("registry task is gone"))?;
        rx.await.map_err(|_| anyhow!("registry dropped the reply"))
    }

    /// Point-in-time copy of every live position.
    pub async fn snapshot(&self) -> Result<Vec<ActivePosition>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Snapshot { reply })
            .await
            .map_err(|_| anyhow!("registry task is gone"))?;
        rx.await.map_err(|_| anyhow!("registry dropped the reply"))
    }
}

/// Registry actor state: the live position map plus its durable store.
struct Registry {
    positions: HashMap<String, ActivePosition>,
    store: PositionStore,
    max_open_positions: usize,
}

impl Registry {
    fn insert(&mut self, position: ActivePosition) -> Result<()> {
        if self.positions.len() >= self.max_open_positions {
            bail!(
                "registry full: {} live positions (cap {})",
                self.positions.len(),
                self.max_open_positions
            );
        }
        if self
            .positions
            .values()
            .any(|p| p.symbol == position.symbol)
        {
            bail!("a live position already exists for {}", position.symbol);
        }
        self.store
            .upsert(&position)
            .context("failed to persist new position")?;
        info!(id = %position.id, symbol = %position.symbol, "position registered");
        self.positions.insert(position.id.clone(), position);
        Ok(())
    }

    fn transition(&mut self, id: &str, status: PositionStatus) -> Result<ActivePosition> {
        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| anyhow!("no live position with id {id}"))?;
        position.transition(status)?;
        self.store.upsert(position)?;
        let updated = position.clone();
        if status == PositionStatus::Closed {
            self.positions.remove(id);
            debug!(id, "closed position left the registry");
        }
        Ok(updated)
    }

    fn apply_rebalance(
        &mut self,
        id: &str,
        spot_qty: Decimal,
        perp_qty: Decimal,
        extra_fees: Decimal,
    ) -> Result<()> {
        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| anyhow!("no live position with id {id}"))?;
        position.spot_qty = spot_qty;
        position.perp_qty = perp_qty;
        position.total_fees += extra_fees;
        self.store.upsert(position)?;
        Ok(())
    }

    fn accrue_funding(&mut self, id: &str, amount: Decimal) -> Result<()> {
        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| anyhow!("no live position with id {id}"))?;
        position.accumulated_funding += amount;
        self.store.upsert(position)?;
        Ok(())
    }
}

/// Start the registry actor over preloaded positions. Returns the handle
/// plus the actor task; the task ends when every handle is dropped.
pub fn spawn_registry(
    store: PositionStore,
    preloaded: Vec<ActivePosition>,
    max_open_positions: usize,
) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(64);
    let mut registry = Registry {
        positions: preloaded
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect(),
        store,
        max_open_positions,
    };

    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                RegistryCommand::Insert { position, reply } => {
                    let _ = reply.send(registry.insert(position));
                }
                RegistryCommand::Transition { id, status, reply } => {
                    let _ = reply.send(registry.transition(&id, status));
                }
                RegistryCommand::ApplyRebalance {
                    id,
                    spot_qty,
                    perp_qty,
                    extra_fees,
                    reply,
                } => {
                    let _ = reply.send(registry.apply_rebalance(&id, spot_qty, perp_qty, extra_fees));
                }
                RegistryCommand::AccrueFunding { id, amount, reply } => {
                    let _ = reply.send(registry.accrue_funding(&id, amount));
                }
                RegistryCommand::Get { id, reply } => {
                    let _ = reply.send(registry.positions.get(&id).cloned());
                }
                RegistryCommand::Snapshot { reply } => {
                    let _ = reply.send(registry.positions.values().cloned().collect());
                }
            }
        }
        debug!("registry actor stopped");
    });

    (RegistryHandle { tx }, task)
}
