mod settings;

pub use settings::{DatabaseConfig, RelayConfig, ServerConfig, Settings};
