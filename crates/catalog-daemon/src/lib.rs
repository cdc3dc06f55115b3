//! catalog-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod commands;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod outgoing;
pub mod server;
pub mod store;

// Re-export key types for convenience
pub use config::Config;
pub use connection::{ConnectionEvent, WsChannel};
pub use daemon::{Console, Daemon};
pub use outgoing::{Dialer, ReconnectConfig, StaticDirectory};
pub use server::WebSocketServer;
pub use store::JsonFileStore;
