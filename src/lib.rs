//! # Funding Harvester
//!
//! An unattended delta-neutral funding-rate arbitrage daemon. For each
//! eligible perpetual/spot pair it builds a cash-and-carry position (long
//! spot, short perpetual in equal quantity) to collect positive funding
//! while staying insensitive to price direction.
//!
//! ## Architecture
//!
//! - `config`: configuration loading and validation
//! - `exchange`: rate-limited gateway facade (Binance, paper mode, mock)
//! - `strategy`: scanner, atomic two-leg executor, registry, supervisor
//! - `risk`: per-position guardian and margin policy
//! - `persistence`: SQLite positions table
//! - `telemetry`: structured events for the external sink
//! - `utils`: decimal helpers

pub mod config;
pub mod exchange;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod strategy;
pub mod telemetry;
pub mod utils;

pub use config::Config;
