use super::BrokerError;
use super::logging;
use serial_test::serial;
use tracing::Level;

#[test]
fn log_levels_parse_with_fallback() {
    assert_eq!(logging::parse_level("debug"), Level::DEBUG);
    assert_eq!(logging::parse_level(" WARNING "), Level::WARN);
    assert_eq!(logging::parse_level("Trace"), Level::TRACE);
    assert_eq!(logging::parse_level("loud"), Level::INFO);
}

#[test]
#[serial]
fn logging_init_is_repeatable() {
    temp_env::with_var(logging::LOG_ENV, Some("error"), || {
        logging::init("info");
        logging::init("debug");
    });
}

#[test]
fn errors_keep_their_kind_on_the_wire() {
    let err = BrokerError::CapacityExceeded {
        topic: "test/overflow".to_string(),
        capacity: 3,
    };
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains("\"kind\":\"capacity_exceeded\""));

    let back: BrokerError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, err);
}

#[test]
fn cancelled_has_no_detail() {
    let json = serde_json::to_value(BrokerError::Cancelled).unwrap();
    assert_eq!(json["kind"], "cancelled");
}

#[test]
fn sled_errors_map_to_storage() {
    let err: BrokerError = sled::Error::Unsupported("nope".to_string()).into();
    assert!(matches!(err, BrokerError::Storage(_)));
}

#[test]
fn delivery_failed_carries_its_counts() {
    let json = serde_json::to_value(BrokerError::DeliveryFailed {
        topic: "t".to_string(),
        message_id: 7,
        undelivered: 2,
    })
    .unwrap();
    assert_eq!(json["kind"], "delivery_failed");
    assert_eq!(json["detail"]["undelivered"], 2);
}
