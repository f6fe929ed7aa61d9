// =============================================================================
// Order execution — lifecycle state machine + gateway
// =============================================================================

pub mod gateway;
pub mod state_machine;

pub use gateway::OrderGateway;
pub use state_machine::{NewOrderRequest, OrderRecord, OrderStore};
