use std::io::Write;

use serial_test::serial;

use super::*;
use crate::bus::BusType;

fn write_yaml(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("AMI_GATEWAY__") || key == CONFIG_ENV_VAR {
            std::env::remove_var(key);
        }
    }
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert!(config.publish_ami_events);
    assert!(!config.ami.enabled);
    assert_eq!(config.ami.port, 5038);
    assert_eq!(config.ajam.port, 5039);
    assert_eq!(config.rest_api.port, 9491);
    assert_eq!(config.bus.exchange_name, "accent-headers");
    assert_eq!(config.bus.exchange_type, "headers");
    assert_eq!(config.consumer.handler_timeout(), Duration::from_secs(30));
    assert!(uuid::Uuid::parse_str(&config.uuid).is_ok());
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_load_without_sources_uses_defaults() {
    clear_env();
    let config = Config::load(None).unwrap();
    assert_eq!(config.ajam.host, "localhost");
    assert_eq!(config.bus.bus_type, BusType::Amqp);
}

#[test]
#[serial]
fn test_load_from_file() {
    clear_env();
    let file = write_yaml(
        r#"
uuid: 7f3a6d2e-0000-4000-8000-000000000001
publish_ami_events: false
ajam:
  host: pbx.internal
  port: 8088
  https: true
  username: gateway
  password: s3cret
  timeout_ms: 2500
  login_retry:
    max_retries: 1
    base_delay: 50
ami:
  enabled: true
  username: relay
bus:
  type: channel
  exchange_type: topic
rest_api:
  port: 9500
  cors:
    enabled: false
consumer:
  queue_name: ami-gateway
  handler_timeout_secs: 5
"#,
    );

    let config = Config::load(file.path().to_str()).unwrap();

    assert_eq!(config.uuid, "7f3a6d2e-0000-4000-8000-000000000001");
    assert!(!config.publish_ami_events);
    assert_eq!(config.ajam.base_url(), "https://pbx.internal:8088/rawman");
    assert_eq!(config.ajam.timeout_ms, 2500);
    assert_eq!(config.ajam.login_retry.max_retries, 1);
    assert_eq!(config.ajam.login_retry.base_delay, Duration::from_millis(50));
    assert!(config.ami.enabled);
    assert_eq!(config.ami.port, 5038);
    assert!(!config.relay_enabled());
    assert_eq!(config.bus.bus_type, BusType::Channel);
    assert_eq!(config.bus.exchange_type, "topic");
    assert_eq!(config.rest_api.port, 9500);
    assert!(!config.rest_api.cors.enabled);
    assert_eq!(config.consumer.queue_name, "ami-gateway");
    assert_eq!(config.consumer.handler_timeout(), Duration::from_secs(5));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = write_yaml("ajam:\n  host: from-file\n  port: 8088\n");
    std::env::set_var("AMI_GATEWAY__AJAM__HOST", "from-env");

    let config = Config::load(file.path().to_str());
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.ajam.host, "from-env");
    assert_eq!(config.ajam.port, 8088);
}

#[test]
#[serial]
fn test_config_env_var_file() {
    clear_env();
    let file = write_yaml("rest_api:\n  port: 9999\n");
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    let config = Config::load(None);
    clear_env();

    assert_eq!(config.unwrap().rest_api.port, 9999);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_error() {
    clear_env();
    let result = Config::load(Some("/nonexistent/ami-gateway.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_invalid_exchange_type_rejected() {
    clear_env();
    let file = write_yaml("bus:\n  exchange_type: bogus\n");

    let result = Config::load(file.path().to_str());

    match result {
        Err(ConfigError::Invalid(message)) => assert!(message.contains("bogus")),
        other => panic!("expected invalid config, got {other:?}"),
    }
}

#[test]
fn test_zero_timeout_rejected() {
    let mut config = Config::default();
    config.ajam.timeout_ms = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_relay_enabled_requires_both_flags() {
    let mut config = Config::default();
    assert!(!config.relay_enabled());
    config.ami.enabled = true;
    assert!(config.relay_enabled());
    config.publish_ami_events = false;
    assert!(!config.relay_enabled());
}
