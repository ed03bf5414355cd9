use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::routing::HandlerRules;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    /// Routing table: handler name to one rule or an ordered list of rules.
    #[serde(default)]
    pub handlers: HashMap<String, HandlerRules>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Base URL of the relay server, used by the consumer client.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Inbound payloads larger than this are truncated (bytes).
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Seconds between store polls on a streaming session.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Maximum lifetime of a streaming session in seconds; 0 disables.
    #[serde(default = "default_ws_max_lifetime")]
    pub ws_max_lifetime: u64,
    /// Whether the consumer reconnects after the session closes.
    #[serde(default = "default_ws_auto_reconnect")]
    pub ws_auto_reconnect: bool,
    /// Seconds the consumer waits before reconnecting.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: u64,
    /// Timeout for outbound delivery requests in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9292
}

fn default_database_url() -> String {
    "postgres://localhost/hook_relay".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_server_url() -> String {
    "http://localhost:9292".to_string()
}

fn default_max_payload_size() -> usize {
    128 * 1024
}

fn default_poll_interval() -> u64 {
    5
}

fn default_ws_max_lifetime() -> u64 {
    14400 // 4 hours
}

fn default_ws_auto_reconnect() -> bool {
    true
}

fn default_reconnect_backoff() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9292)?
            .set_default("database.url", "postgres://localhost/hook_relay")?
            .set_default("relay.server_url", "http://localhost:9292")?
            .set_default("relay.poll_interval", 5)?
            .set_default("relay.ws_max_lifetime", 14400)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, DATABASE_URL, RELAY_SERVER_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.ws_max_lifetime)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            max_payload_size: default_max_payload_size(),
            poll_interval: default_poll_interval(),
            ws_max_lifetime: default_ws_max_lifetime(),
            ws_auto_reconnect: default_ws_auto_reconnect(),
            reconnect_backoff: default_reconnect_backoff(),
            request_timeout: default_request_timeout(),
        }
    }
}
