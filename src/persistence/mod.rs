//! SQLite persistence for the positions table.
//!
//! The daemon survives restarts by reloading every non-CLOSED row at
//! startup and reconciling it against live exchange positions.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::exchange::Symbol;
use crate::position::{ActivePosition, PositionStatus};

/// Store for durable position records.
pub struct PositionStore {
    conn: Connection,
}

impl PositionStore {
    /// Open (or create) the database and ensure the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Position store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                entry_timestamp INTEGER NOT NULL,
                spot_qty REAL NOT NULL,
                perp_qty REAL NOT NULL,
                entry_spread REAL NOT NULL,
                total_fees REAL NOT NULL,
                accumulated_funding REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            "#,
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Insert or replace one position row.
    pub fn upsert(&self, position: &ActivePosition) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO positions (id, symbol, entry_timestamp, spot_qty, perp_qty,
                                   entry_spread, total_fees, accumulated_funding, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                spot_qty = ?4,
                perp_qty = ?5,
                entry_spread = ?6,
                total_fees = ?7,
                accumulated_funding = ?8,
                status = ?9
            "#,
            params![
                position.id,
                position.symbol.market_name(),
                position.entry_timestamp,
                to_real(position.spot_qty),
                to_real(position.perp_qty),
                to_real(position.entry_spread),
                to_real(position.total_fees),
                to_real(position.accumulated_funding),
                position.status.as_str(),
            ],
        )?;
        debug!(id = %position.id, symbol = %position.symbol, status = position.status.as_str(), "position upserted");
        Ok(())
    }

    /// Update only the lifecycle state of one row.
    pub fn set_status(&self, id: &str, status: PositionStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE positions SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        anyhow::ensure!(changed == 1, "no position row with id {id}");
        Ok(())
    }

    /// All rows with status != CLOSED. `quote` is needed to split the stored
    /// market name back into base/quote; a row that does not end in the
    /// configured quote is corrupt and fails the load.
    pub fn load_live(&self, quote: &str) -> Result<Vec<ActivePosition>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, symbol, entry_timestamp, spot_qty, perp_qty,
                   entry_spread, total_fees, accumulated_funding, status
            FROM positions
            WHERE status != 'CLOSED'
            ORDER BY entry_timestamp
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut positions = Vec::new();
        for row in rows {
            let (id, market, ts, spot_qty, perp_qty, spread, fees, funding, status) = row?;
            let base = market
                .strip_suffix(quote)
                .with_context(|| format!("stored symbol '{market}' does not end in '{quote}'"))?;
            let symbol = Symbol::new(base, quote)
                .map_err(|e| anyhow::anyhow!("corrupt symbol in row {id}: {e}"))?;
            positions.push(ActivePosition {
                id,
                symbol,
                entry_timestamp: ts,
                spot_qty: from_real(spot_qty)?,
                perp_qty: from_real(perp_qty)?,
                entry_spread: from_real(spread)?,
                total_fees: from_real(fees)?,
                accumulated_funding: from_real(funding)?,
                status: PositionStatus::parse(&status)?,
            });
        }
        Ok(positions)
    }

    /// Number of rows with status != CLOSED.
    pub fn live_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE status != 'CLOSED'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn to_real(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn from_real(value: f64) -> Result<Decimal> {
    Decimal::from_f64(value).with_context(|| format!("unrepresentable decimal {value}"))
}
