// =============================================================================
// Exchange adapter — one WebSocket + REST session per exchange
// =============================================================================

pub mod client;
pub mod rate_limit;
pub mod user_stream;
pub mod ws;

pub use client::{AccountSnapshot, DepthSnapshot, ExchangeClient, ExchangePosition, OrderAck};
pub use user_stream::{AccountEvent, OrderUpdateEvent};
pub use ws::{MarketEvent, TickerStats};
