mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, ServerSettings, Settings, StorageSettings};

/// Loads the configuration from `config/default` and `ASTERMQ__*` environment
/// variables, then merges it over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("ASTERMQ")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let server = partial.server.as_ref();
    let broker = partial.broker.as_ref();
    let storage = partial.storage.as_ref();

    Ok(Settings {
        server: ServerSettings {
            host: server
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server.and_then(|s| s.port).unwrap_or(default.server.port),
            max_connections: server
                .and_then(|s| s.max_connections)
                .unwrap_or(default.server.max_connections),
        },
        broker: BrokerSettings {
            message_ttl_secs: broker
                .and_then(|b| b.message_ttl_secs)
                .unwrap_or(default.broker.message_ttl_secs),
            default_max_receivers: broker
                .and_then(|b| b.default_max_receivers)
                .unwrap_or(default.broker.default_max_receivers),
            ack_timeout_ms: broker
                .and_then(|b| b.ack_timeout_ms)
                .unwrap_or(default.broker.ack_timeout_ms),
            max_retries: broker
                .and_then(|b| b.max_retries)
                .unwrap_or(default.broker.max_retries),
            maintenance_interval_ms: broker
                .and_then(|b| b.maintenance_interval_ms)
                .unwrap_or(default.broker.maintenance_interval_ms),
        },
        storage: StorageSettings {
            path: storage
                .and_then(|s| s.path.clone())
                .unwrap_or(default.storage.path),
            temporary: storage
                .and_then(|s| s.temporary)
                .unwrap_or(default.storage.temporary),
            archive_settled: storage
                .and_then(|s| s.archive_settled)
                .unwrap_or(default.storage.archive_settled),
        },
    })
}

#[cfg(test)]
mod tests;
