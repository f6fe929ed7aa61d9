// =============================================================================
// Account monitoring — positions, balances, P&L, reconciliation
// =============================================================================

pub mod monitor;
pub mod position;
pub mod reconciler;
pub mod recorder;

pub use monitor::{AccountMonitor, RiskThresholds};
pub use position::Position;
