//! Configuration management for pixrelay

use crate::error::{RelayError, Result};
use crate::signature::SignatureAlgorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the image server listens on (default: "0.0.0.0:8000")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Accept `/unsafe/...` URLs without a signature (default: false)
    #[serde(rename = "unsafe", default)]
    pub unsafe_mode: bool,

    /// Shared secret for URL signatures
    #[serde(default)]
    pub secret: String,

    /// MAC used for URL signatures (default: hmac-sha256)
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,

    /// Per-request deadline in milliseconds, 0 disables it (default: 30000)
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for each background save in milliseconds, 0 disables it (default: 30000)
    #[serde(default = "default_timeout_ms")]
    pub save_timeout_ms: u64,

    /// Load deduplication cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Verbose request logging (default: false)
    #[serde(default)]
    pub debug: bool,

    /// Load images from a local directory (optional)
    #[serde(default)]
    pub file_loader: Option<FileStoreConfig>,

    /// Persist loaded images to a local directory (optional)
    #[serde(default)]
    pub file_storage: Option<FileStoreConfig>,

    /// Load images over HTTP (optional)
    #[serde(default)]
    pub http_loader: Option<HttpLoaderConfig>,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Settings for the load deduplication cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of cached outcomes (default: 1000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum aggregate size of cached buffers in bytes (default: 256MB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Lifetime of a successful load in seconds, 0 disables caching it (default: 60)
    #[serde(default = "default_ttl")]
    pub result_ttl_secs: u64,

    /// Lifetime of a failed load in seconds, 0 disables caching it (default: 60)
    #[serde(default = "default_ttl")]
    pub error_ttl_secs: u64,

    /// Number of independently locked store shards, power of two (default: 16)
    #[serde(default = "default_shards")]
    pub shards: usize,
}

/// Settings for a directory-backed loader or storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileStoreConfig {
    /// Root directory
    pub base_dir: String,

    /// Only identifiers under this prefix are served (default: "/")
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

/// Settings for the HTTP loader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpLoaderConfig {
    /// Base URL relative identifiers are resolved against (optional)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Accept absolute `http(s)://` identifiers (default: true)
    #[serde(default = "default_true")]
    pub allow_absolute: bool,

    /// Upper bound for a single fetch in milliseconds, 0 for none (default: 30000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            result_ttl_secs: default_ttl(),
            error_ttl_secs: default_ttl(),
            shards: default_shards(),
        }
    }
}

impl CacheConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn error_ttl(&self) -> Duration {
        Duration::from_secs(self.error_ttl_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(RelayError::ConfigError(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(RelayError::ConfigError(
                "cache.max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(RelayError::ConfigError(format!(
                "cache.shards must be a power of 2, got {}",
                self.shards
            )));
        }
        Ok(())
    }
}

impl FileStoreConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.base_dir.is_empty() {
            return Err(RelayError::ConfigError(format!(
                "{}.base_dir must not be empty",
                name
            )));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(RelayError::ConfigError(format!(
                "{}.path_prefix must start with '/', got '{}'",
                name, self.path_prefix
            )));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_entries() -> usize {
    1000
}

fn default_max_bytes() -> usize {
    256 * 1024 * 1024 // 256MB
}

fn default_ttl() -> u64 {
    60
}

fn default_shards() -> usize {
    16
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind_address: default_bind_address(),
            unsafe_mode: false,
            secret: String::new(),
            signature_algorithm: SignatureAlgorithm::default(),
            request_timeout_ms: default_timeout_ms(),
            save_timeout_ms: default_timeout_ms(),
            cache: CacheConfig::default(),
            debug: false,
            file_loader: None,
            file_storage: None,
            http_loader: None,
            metrics_endpoint: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - a secret is required unless unsafe mode is on
    /// - cache limits must be positive and shards a power of two
    /// - file store directories must be set
    /// - http base_url must be an http(s) URL
    pub fn validate(&self) -> Result<()> {
        if !self.unsafe_mode && self.secret.is_empty() {
            return Err(RelayError::ConfigError(
                "secret must be set unless unsafe mode is enabled".to_string(),
            ));
        }

        self.cache.validate()?;

        if let Some(ref loader) = self.file_loader {
            loader.validate("file_loader")?;
        }
        if let Some(ref storage) = self.file_storage {
            storage.validate("file_storage")?;
        }

        if let Some(ref http) = self.http_loader {
            if let Some(ref base) = http.base_url {
                if !(base.starts_with("http://") || base.starts_with("https://")) {
                    return Err(RelayError::ConfigError(format!(
                        "http_loader.base_url must be an http(s) URL, got '{}'",
                        base
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
}
