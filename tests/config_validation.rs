//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use network_transport::config::{
    CryptoMode, LoggingConfig, SchedulerConfig, TcpConfig, TransportConfig,
};
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = TransportConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_tcp_address() {
    let mut config = TransportConfig::default();
    config.tcp.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid TCP address")));
    assert!(config.tcp.local_address().is_err());
}

#[test]
fn test_empty_udp_address() {
    let mut config = TransportConfig::default();
    config.udp.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("UDP address cannot be empty")));
}

#[test]
fn test_invalid_proxy_and_forward_host() {
    let mut config = TransportConfig::default();
    config.tcp.proxy = "not-a-host".to_string();
    config.udp.forward_host = "1.2.3.4".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid TCP proxy address")));
    assert!(errors.iter().any(|e| e.contains("Invalid UDP forward host")));
}

#[test]
fn test_proxy_is_part_of_local_address() {
    let tcp = TcpConfig {
        address: "10.0.0.1:5377".to_string(),
        proxy: "192.0.2.7:6000".to_string(),
        ..TcpConfig::default()
    };
    let local = tcp.local_address().expect("valid address");
    assert_eq!(local.local.to_string(), "10.0.0.1:5377");
    assert_eq!(local.proxy.to_string(), "192.0.2.7:6000");
}

#[test]
fn test_zero_queue_size() {
    let mut config = TransportConfig::default();
    config.tcp.queue_size = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Queue size must be greater than 0")));
}

#[test]
fn test_threshold_above_queue_size() {
    let mut config = TransportConfig::default();
    config.tcp.queue_size = 100;
    config.tcp.threshold = 200;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot exceed queue size")));
}

#[test]
fn test_threshold_defaults_to_half_queue() {
    let mut tcp = TcpConfig::default();
    tcp.queue_size = 100;
    assert_eq!(tcp.effective_threshold(), 50);

    tcp.queue_size = 1;
    assert_eq!(tcp.effective_threshold(), 1);

    tcp.threshold = 1;
    tcp.queue_size = 10;
    assert_eq!(tcp.effective_threshold(), 1);
}

#[test]
fn test_delivery_threads_bounds() {
    let mut config = TransportConfig::default();
    config.tcp.delivery_threads = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Delivery threads must be greater than 0")));

    config.tcp.delivery_threads = 64;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Too many delivery threads")));
    assert_eq!(config.tcp.effective_delivery_threads(), 8);
}

#[test]
fn test_read_buffer_and_message_limits() {
    let mut config = TransportConfig::default();
    config.tcp.read_buffer_size = 16;
    config.tcp.max_message_size = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Read buffer size too small")));
    assert!(errors.iter().any(|e| e.contains("Max message size cannot be 0")));
}

#[test]
fn test_tls_requires_material() {
    let mut config = TransportConfig::default();
    config.tcp.crypto = CryptoMode::Tls;

    let errors = config.validate();
    assert_eq!(
        errors
            .iter()
            .filter(|e| e.contains("must be specified when crypto"))
            .count(),
        3
    );

    config.tls.cert_path = "/nonexistent/cert.pem".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("TLS certificate file does not exist")));
}

#[test]
fn test_no_verify_hostnames_forms() {
    let mut config = TransportConfig::default();
    config.tls.apply_no_verify_hostnames("alpha.example Beta.Example");
    assert!(config.tls.verify_hostnames);
    assert!(config.tls.hostname_exempt("beta.example"));
    assert!(!config.tls.hostname_exempt("gamma.example"));

    config.tls.apply_no_verify_hostnames("true");
    assert!(config.tls.hostname_exempt("gamma.example"));
}

#[test]
fn test_scheduler_timeouts() {
    let scheduler = SchedulerConfig {
        select_timeout: Duration::from_millis(5),
        ..SchedulerConfig::default()
    };
    assert!(scheduler
        .validate()
        .iter()
        .any(|e| e.contains("Select timeout too short")));

    let scheduler = SchedulerConfig {
        select_timeout: Duration::from_millis(100),
        max_timer_wait: Duration::from_millis(200),
        check_running_interval: 0,
        ..SchedulerConfig::default()
    };
    let errors = scheduler.validate();
    assert!(errors.iter().any(|e| e.contains("Max timer wait cannot exceed")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Check running interval must be greater than 0")));
}

#[test]
fn test_logging_requires_an_output() {
    let logging = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));

    let logging = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_toml_roundtrip_keeps_overrides() {
    let config = TransportConfig::default_with_overrides(|c| {
        c.tcp.address = "127.0.0.1:0".to_string();
        c.tcp.listen = false;
        c.tcp.queue_size = 4096;
        c.tcp.window_size = Duration::from_millis(250);
        c.udp.port_offset = 3;
        c.logging.log_level = Level::DEBUG;
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("transport.toml");
    config.save_to_file(&path).expect("save");

    let loaded = TransportConfig::from_file(&path).expect("load");
    assert_eq!(loaded.tcp.address, "127.0.0.1:0");
    assert!(!loaded.tcp.listen);
    assert_eq!(loaded.tcp.queue_size, 4096);
    assert_eq!(loaded.tcp.window_size, Duration::from_millis(250));
    assert_eq!(loaded.udp.port_offset, 3);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = TransportConfig::from_toml(
        r#"
        [tcp]
        address = "10.0.0.9:7000"
        crypto = "none"
        reject_route_rts = true
        "#,
    )
    .expect("parse");
    assert_eq!(config.tcp.address, "10.0.0.9:7000");
    assert!(config.tcp.reject_route_rts);
    assert!(config.tcp.listen);
    assert_eq!(config.tcp.backlog, 128);
    assert_eq!(config.udp.delivery_threads, 1);
    assert_eq!(config.scheduler.select_timeout, Duration::from_millis(500));
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("NETWORK_TRANSPORT_TCP_ADDRESS", "10.1.1.1:9000");
    std::env::set_var("NETWORK_TRANSPORT_PORT_OFFSET", "2");
    std::env::set_var("NETWORK_TRANSPORT_CRYPTO", "TLS");

    let config = TransportConfig::from_env().expect("env config");
    assert_eq!(config.tcp.address, "10.1.1.1:9000");
    assert_eq!(config.tcp.port_offset, 2);
    assert_eq!(config.udp.port_offset, 2);
    assert_eq!(config.tcp.crypto, CryptoMode::Tls);

    std::env::set_var("NETWORK_TRANSPORT_CRYPTO", "rot13");
    assert!(TransportConfig::from_env().is_err());

    std::env::remove_var("NETWORK_TRANSPORT_TCP_ADDRESS");
    std::env::remove_var("NETWORK_TRANSPORT_PORT_OFFSET");
    std::env::remove_var("NETWORK_TRANSPORT_CRYPTO");
}

#[test]
fn test_validate_strict_joins_errors() {
    let mut config = TransportConfig::default();
    config.tcp.backlog = 0;
    config.logging.app_name = String::new();

    let err = config.validate_strict().expect_err("invalid config");
    let message = err.to_string();
    assert!(message.contains("Listen backlog must be greater than 0"));
    assert!(message.contains("Application name cannot be empty"));
}
