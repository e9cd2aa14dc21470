use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a loaded configuration is unusable
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the gallery storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Durable record store configuration
    pub database: DatabaseConfig,
    /// Upload status store configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Notification bus configuration
    pub kafka: KafkaConfig,
    /// Blob storage configuration
    pub blob: BlobConfig,
    /// Upload worker pool configuration
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Redis configuration for the upload status store
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

/// Kafka configuration for the notification bus
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID of the reconciliation listener
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying successful transfer outcomes
    #[serde(default = "default_url_update_topic")]
    pub url_update_topic: String,
    /// Topic carrying failed transfer outcomes
    #[serde(default = "default_delete_topic")]
    pub delete_topic: String,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Storage account name, substituted into `url_template`
    pub account: String,
    /// Container (bucket) photos are written to
    pub container: String,
    /// Public URL prefix of the container
    #[serde(default = "default_url_template")]
    pub url_template: String,
    /// Region of the storage API
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom storage API endpoint
    pub endpoint_url: Option<String>,
    /// Force path-style access
    #[serde(default)]
    pub force_path_style: bool,
    /// Size of every transferred block in bytes (5MB default, 5MB minimum)
    #[serde(default = "default_block_size")]
    pub block_size_bytes: usize,
    /// Blocks in flight per transfer
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

/// Upload worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Number of concurrent upload workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs that may wait for a free worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

// Default value functions
fn default_service_name() -> String {
    "gallery-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_consumer_group() -> String {
    "gallery-reconciler".to_string()
}

fn default_url_update_topic() -> String {
    "url-update".to_string()
}

fn default_delete_topic() -> String {
    "delete".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_message_timeout_ms() -> u64 {
    30000
}

fn default_url_template() -> String {
    "https://{account}.blob.core.windows.net/{container}".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Smallest part S3-compatible services accept for any but the last part
pub const MIN_BLOCK_SIZE: usize = 5 * 1024 * 1024;

fn default_block_size() -> usize {
    MIN_BLOCK_SIZE
}

fn default_parallelism() -> usize {
    16
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    256
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "gallery-storage")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/gallery").required(false))
            .add_source(config::File::with_name("/etc/gallery/gallery").required(false))
            // Override with environment variables
            // GALLERY__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the upload pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blob.block_size_bytes < MIN_BLOCK_SIZE {
            return Err(invalid("blob.block_size_bytes", "must be at least 5 MiB"));
        }
        if self.blob.parallelism == 0 {
            return Err(invalid("blob.parallelism", "must be greater than zero"));
        }
        if !self.blob.url_template.contains("{container}") {
            return Err(invalid(
                "blob.url_template",
                "must contain the {container} placeholder",
            ));
        }
        if self.upload.workers == 0 {
            return Err(invalid("upload.workers", "must be greater than zero"));
        }
        if self.upload.queue_capacity == 0 {
            return Err(invalid("upload.queue_capacity", "must be greater than zero"));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl KafkaConfig {
    /// Producer delivery timeout as Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BlobConfig {
    /// Blob settings with the given account and container and every other field defaulted
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            url_template: default_url_template(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            block_size_bytes: default_block_size(),
            parallelism: default_parallelism(),
        }
    }
}
