//! natproxy-server: relay for peers that cannot reach each other directly
//!
//! Peers log in over a TCP control connection, discover each other, and ask
//! the relay for a channel: a pair of UDP sockets that forward datagrams
//! between the two peers once both have authenticated.

pub mod channel;
pub mod client;
pub mod config;
pub mod directory;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

#[cfg(test)]
mod testing;

pub use channel::{ChannelConfig, RelayChannel, Side};
pub use config::{ServerConfig, SessionType};
pub use manager::{ManagerConfig, SessionManager};
pub use reactor::{ReactorPool, Scheduler, SingleContext};
pub use server::{serve_listener, RelayServer};
pub use session::Session;
