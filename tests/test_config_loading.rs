//! Tests for loading configuration files

use pixrelay::{RelayConfig, RelayProxy, SignatureAlgorithm};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_config() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
bind_address: "127.0.0.1:8080"
secret: "mysecret"
signature_algorithm: hmac-sha1
request_timeout_ms: 5000
save_timeout_ms: 0
debug: true
cache:
  max_entries: 64
  max_bytes: 1048576
  result_ttl_secs: 30
  error_ttl_secs: 5
  shards: 8
file_loader:
  base_dir: /srv/images
  path_prefix: /public/
http_loader:
  base_url: https://origin.example.com
  timeout_ms: 2000
metrics_endpoint:
  enabled: true
  address: "127.0.0.1:9091"
"#
    )
    .unwrap();

    let config = RelayConfig::from_file(file.path()).unwrap();
    assert_eq!(config.bind_address, "127.0.0.1:8080");
    assert_eq!(config.signature_algorithm, SignatureAlgorithm::HmacSha1);
    assert_eq!(config.request_timeout(), Duration::from_secs(5));
    assert_eq!(config.save_timeout(), Duration::ZERO);
    assert!(config.debug);
    assert_eq!(config.cache.shards, 8);
    assert_eq!(config.cache.error_ttl(), Duration::from_secs(5));
    assert_eq!(config.file_loader.as_ref().unwrap().path_prefix, "/public/");
    let http = config.http_loader.as_ref().unwrap();
    assert!(http.allow_absolute);
    assert_eq!(http.timeout_ms, 2000);
    assert!(config.metrics_endpoint.as_ref().unwrap().enabled);

    assert!(RelayProxy::from_config(&config, None).is_ok());
}

#[test]
fn test_missing_file_is_config_error() {
    let err = RelayConfig::from_file("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_invalid_yaml_is_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "cache: [unclosed").unwrap();
    let err = RelayConfig::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_validation_runs_on_load() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "secret: abc\ncache:\n  shards: 3").unwrap();
    let err = RelayConfig::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("power of 2"));
}

#[test]
fn test_bundled_sample_config() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/pixrelay.yaml");
    let config = RelayConfig::from_file(path).unwrap();
    assert!(!config.unsafe_mode);
    assert!(!config.secret.is_empty());
}
