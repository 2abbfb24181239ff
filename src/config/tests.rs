use super::load_config;
use super::settings::Settings;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.max_connections, 1000);
    assert_eq!(settings.broker.message_ttl_secs, 3600);
    assert_eq!(settings.broker.max_retries, 5);
    assert!(!settings.storage.temporary);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [broker]
        message_ttl_secs = 60
        ack_timeout_ms = 250

        [storage]
        archive_settled = true
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.max_connections, 1000);
    assert_eq!(cfg.broker.message_ttl_secs, 60);
    assert_eq!(cfg.broker.ack_timeout_ms, 250);
    assert_eq!(cfg.broker.max_retries, 5);
    assert!(cfg.storage.archive_settled);
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("ASTERMQ__SERVER__PORT", Some("9100")),
            ("ASTERMQ__BROKER__MAX_RETRIES", Some("2")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.broker.max_retries, 2);
            assert_eq!(cfg.server.host, "127.0.0.1");
        },
    );
}
