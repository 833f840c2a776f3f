//! Position risk management.
//!
//! - Per-position guardian loop: exit triggers and margin rebalancing
//! - Margin-usage policy shared by every guardian

pub mod guardian;
pub mod margin;

pub use guardian::{GuardianState, PositionGuardian, Verdict};
pub use margin::{MarginPolicy, RebalanceAction};
