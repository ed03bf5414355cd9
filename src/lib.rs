// Shared infrastructure
pub mod config;
pub mod error;
pub mod stats;

// Domain layer
pub mod dispatch;
pub mod routing;
pub mod store;

// Application layer
pub mod client;
pub mod server;
pub mod session;
pub mod transport;
