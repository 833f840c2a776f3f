//! Trading control plane.
//!
//! - Market scanning and candidate ranking
//! - Atomic two-leg order execution
//! - Position registry (supervisor-owned, message-mutated)
//! - Supervisor main loop, kill switch, and drain

pub mod executor;
pub mod registry;
pub mod scanner;
pub mod supervisor;

pub use executor::{ExecError, ExecutionOutcome, Leg, LegFills, OrderManager};
pub use registry::{spawn_registry, RegistryHandle};
pub use scanner::{MarketScanner, MarketSnapshot, TargetCandidate};
pub use supervisor::{ExitCode, KillSwitch, Supervisor};
