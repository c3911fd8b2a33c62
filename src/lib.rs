//! SOCKS5 front-end that chains client connections through encrypted
//! upstream proxies, hiding real destinations behind fake endpoints.

pub mod cache;
pub mod cipher;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod relay;
pub mod server;
pub mod socks5;
pub mod tracer;
pub mod tunnel_stats;
pub mod udp_relay;
pub mod upstream;

pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use server::TunnelServer;

#[cfg(test)]
mod selector_tests;
