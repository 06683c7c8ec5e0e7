use offboard_lib::{Error, SessionConfig};
use std::time::Duration;

#[test]
fn defaults_are_consistent() {
    let config = SessionConfig::default();

    config.validate().unwrap();
    assert_eq!(config.setpoint_period(), Duration::from_millis(50));
    assert_eq!(config.remote_timeout(), Duration::from_millis(500));
    assert_eq!(config.ack_timeout(), Duration::from_secs(1));
    assert_eq!(config.shutdown_timeout(), Duration::from_millis(200));
    assert_eq!(config.send_failure_threshold, 5);
}

#[test]
fn missing_keys_take_their_default() {
    let config = SessionConfig::from_toml_str(
        r#"
        setpoint_period_ms = 20
        ack_timeout_ms = 2000
        "#,
    )
    .unwrap();

    assert_eq!(
        config,
        SessionConfig {
            setpoint_period_ms: 20,
            ack_timeout_ms: 2000,
            ..SessionConfig::default()
        }
    );
    assert_eq!(SessionConfig::from_toml_str("").unwrap(), SessionConfig::default());
}

#[test]
fn unknown_keys_are_rejected() {
    let result = SessionConfig::from_toml_str("setpoint_rate_hz = 20");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn inconsistent_timings_are_rejected() {
    for text in [
        "setpoint_period_ms = 0",
        "setpoint_period_ms = 300",
        "send_failure_threshold = 0",
        "ack_timeout_ms = 0",
        "shutdown_timeout_ms = 0",
    ] {
        assert!(
            matches!(SessionConfig::from_toml_str(text), Err(Error::Config(_))),
            "{} accepted",
            text
        );
    }

    // Exactly half of the remote timeout is fine
    SessionConfig::from_toml_str("setpoint_period_ms = 250").unwrap();
}

#[test]
fn written_config_reads_back() {
    let config = SessionConfig {
        setpoint_period_ms: 25,
        remote_timeout_ms: 1000,
        send_failure_threshold: 2,
        ack_timeout_ms: 750,
        shutdown_timeout_ms: 300,
    };

    let text = config.to_toml_string().unwrap();
    assert_eq!(SessionConfig::from_toml_str(&text).unwrap(), config);
}

#[test]
fn missing_file_is_a_config_error() {
    let result = SessionConfig::from_file("/nonexistent/offboard.toml");
    assert!(matches!(result, Err(Error::Config(message)) if message.contains("offboard.toml")));
}
