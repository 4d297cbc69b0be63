//! Chrome-compatible debugging surface for the Magi fleet: HTTP discovery,
//! WebSocket upgrade and routing, the per-connection `Target.*` state
//! machine, and the broadcast bridge from fleet lifecycle to CDP events.

mod connection;
mod gateway;
pub mod http;
pub mod metrics;
pub mod protocol;
mod ws;

pub use connection::BrowserConnection;
pub use gateway::{CdpGateway, ConnectionRegistry, GatewayConfig, GatewayCtx};
