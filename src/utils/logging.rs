use tracing::Level;

/// Environment variable that overrides the level passed to `init`.
pub const LOG_ENV: &str = "ASTERMQ_LOG";

/// Resolves a level name, falling back to `INFO` for anything unknown.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "warning" => Level::WARN,
        other => other.parse().unwrap_or(Level::INFO),
    }
}

/// Installs the global `fmt` subscriber. `ASTERMQ_LOG` wins over
/// `default_level` when set. Later calls are no-ops.
pub fn init(default_level: &str) {
    let level = std::env::var(LOG_ENV)
        .map(|name| parse_level(&name))
        .unwrap_or_else(|_| parse_level(default_level));

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(level >= Level::DEBUG)
        .try_init();
}
