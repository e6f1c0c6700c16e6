// hubrelay - WebSocket bridge between block-programming clients and robotics hubs

pub mod config;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod server;
pub mod session;
pub mod telegram;
pub mod transport;

pub use config::{ConfigError, RelayConfig};
pub use server::{routes, serve, Bridge, ServerError};
