use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
}

/// Where the WebSocket transport binds and how many node sessions it admits.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

/// Delivery tuning for the broker engine.
///
/// `message_ttl_secs` and `default_max_receivers` fill in durability for a
/// `Durable` message sent without explicit durability options.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub message_ttl_secs: u64,
    pub default_max_receivers: u32,
    pub ack_timeout_ms: i64,
    pub max_retries: u32,
    pub maintenance_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
    /// Open sled in temporary mode; the database is removed on drop.
    pub temporary: bool,
    /// Move settled durable messages into a per-topic archive tree instead of
    /// deleting them.
    pub archive_settled: bool,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub message_ttl_secs: Option<u64>,
    pub default_max_receivers: Option<u32>,
    pub ack_timeout_ms: Option<i64>,
    pub max_retries: Option<u32>,
    pub maintenance_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub temporary: Option<bool>,
    pub archive_settled: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_connections: 1000,
            },
            broker: BrokerSettings::default(),
            storage: StorageSettings {
                path: "astermq_db".to_string(),
                temporary: false,
                archive_settled: false,
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            message_ttl_secs: 3600,
            default_max_receivers: 1,
            ack_timeout_ms: 5000,
            max_retries: 5,
            maintenance_interval_ms: 1000,
        }
    }
}

impl StorageSettings {
    /// Settings for a throwaway store, used by tests and the bench command.
    pub fn temporary() -> Self {
        Self {
            path: String::new(),
            temporary: true,
            archive_settled: false,
        }
    }
}
