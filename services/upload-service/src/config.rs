//! Configuration for the upload service.
//!
//! Values are layered (later sources override earlier):
//! 1. Built-in defaults
//! 2. `config/upload` and `/etc/upload-service/upload` files, if present
//! 3. `UPLOAD__SECTION__KEY` environment variables
//! 4. The flat environment knobs used by earlier deployments
//!    (`MAX_LENGTH`, `LISTEN_PORT`, `KAFKAMQ`, ...)

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Flat environment variables and the config keys they override.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("MAX_LENGTH", "api.max_length"),
    ("LISTEN_PORT", "api.port"),
    ("RETRY_INTERVAL", "kafka.retry_interval_secs"),
    ("KAFKAMQ", "kafka.bootstrap_servers"),
    ("MQ_GROUP_ID", "kafka.group_id"),
    ("VALIDATION_QUEUE", "kafka.validation_topic"),
    ("MAX_WORKERS", "pipeline.max_workers"),
    ("STORAGE_UPLOAD_TIMEOUT", "pipeline.storage_upload_timeout_secs"),
    ("STORAGE_DRIVER", "storage.driver"),
    ("LOGLEVEL", "service.log_level"),
];

/// Errors raised by [`Config::validate`]
#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the upload service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
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
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Prefix every route is mounted under
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Uploads declaring this many bytes or more are refused
    #[serde(default = "default_max_length")]
    pub max_length: u64,
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed origins; empty means any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Kafka broker configuration shared by the producer and consumer loops
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Inbound topic carrying validation verdicts
    #[serde(default = "default_validation_topic")]
    pub validation_topic: String,
    /// Outbound topic for artifacts promoted to permanent storage
    #[serde(default = "default_available_topic")]
    pub available_topic: String,
    /// Outbound "received" events go to `topic_prefix + service`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Delay between reconnect attempts of either loop
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Pause between loop iterations when there is nothing to do
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// How long a consumer poll waits for the first record of a batch
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the outbound produce queue; the oldest event is evicted past this
    #[serde(default = "default_produce_queue_capacity")]
    pub produce_queue_capacity: usize,
    /// Size of the worker pool used for blocking work
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Maximum time to wait for an archive to land in quarantine storage
    #[serde(default = "default_storage_upload_timeout_secs")]
    pub storage_upload_timeout_secs: u64,
    #[serde(default = "default_progress_poll_interval_ms")]
    pub progress_poll_interval_ms: u64,
}

/// Which storage driver backs the three tiers
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    S3,
    LocalDisk,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub driver: StorageDriver,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub localdisk: LocalDiskConfig,
}

/// S3 storage configuration, one bucket per tier
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default = "default_quarantine_bucket")]
    pub quarantine_bucket: String,
    #[serde(default = "default_permanent_bucket")]
    pub permanent_bucket: String,
    #[serde(default = "default_rejected_bucket")]
    pub rejected_bucket: String,
    /// Lifetime of the presigned URLs handed to downstream services
    #[serde(default = "default_url_expiry_secs")]
    pub url_expiry_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDiskConfig {
    #[serde(default = "default_local_base_path")]
    pub base_path: PathBuf,
}

// Default value functions
fn default_service_name() -> String {
    "upload-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8888
}

fn default_path_prefix() -> String {
    "/r/insights/platform/upload".to_string()
}

fn default_max_length() -> u64 {
    11_010_048 // 10.5MB, one MB above the largest archive seen in practice
}

fn default_bootstrap_servers() -> String {
    "kafka:29092".to_string()
}

fn default_group_id() -> String {
    "upload".to_string()
}

fn default_client_id() -> String {
    "upload-service".to_string()
}

fn default_validation_topic() -> String {
    "platform.upload.validation".to_string()
}

fn default_available_topic() -> String {
    "platform.upload.available".to_string()
}

fn default_topic_prefix() -> String {
    "platform.upload.".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_idle_interval_ms() -> u64 {
    100
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_poll_records() -> usize {
    500
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_produce_queue_capacity() -> usize {
    999
}

fn default_max_workers() -> usize {
    50
}

fn default_storage_upload_timeout_secs() -> u64 {
    60
}

fn default_progress_poll_interval_ms() -> u64 {
    10
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_quarantine_bucket() -> String {
    "insights-upload-quarantine".to_string()
}

fn default_permanent_bucket() -> String {
    "insights-upload-perm-test".to_string()
}

fn default_rejected_bucket() -> String {
    "insights-upload-rejected".to_string()
}

fn default_url_expiry_secs() -> u64 {
    86400
}

fn default_local_base_path() -> PathBuf {
    PathBuf::from("/tmp/upload-service")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            path_prefix: default_path_prefix(),
            max_length: default_max_length(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            group_id: default_group_id(),
            client_id: default_client_id(),
            validation_topic: default_validation_topic(),
            available_topic: default_available_topic(),
            topic_prefix: default_topic_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            idle_interval_ms: default_idle_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_poll_records: default_max_poll_records(),
            auto_offset_reset: default_auto_offset_reset(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            produce_queue_capacity: default_produce_queue_capacity(),
            max_workers: default_max_workers(),
            storage_upload_timeout_secs: default_storage_upload_timeout_secs(),
            progress_poll_interval_ms: default_progress_poll_interval_ms(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            quarantine_bucket: default_quarantine_bucket(),
            permanent_bucket: default_permanent_bucket(),
            rejected_bucket: default_rejected_bucket(),
            url_expiry_secs: default_url_expiry_secs(),
        }
    }
}

impl Default for LocalDiskConfig {
    fn default() -> Self {
        Self {
            base_path: default_local_base_path(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(File::with_name("config/upload").required(false))
            .add_source(File::with_name("/etc/upload-service/upload").required(false))
            // UPLOAD__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                Environment::with_prefix("UPLOAD")
                    .separator("__")
                    .try_parsing(true),
            );

        let builder = apply_legacy_env(builder, |key| std::env::var(key).ok())?;

        builder.build()?.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.kafka.group_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.group_id".to_string(),
            ));
        }

        if self.api.max_length == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_length".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if !self.api.path_prefix.is_empty() && !self.api.path_prefix.starts_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.path_prefix".to_string(),
                message: "must start with '/'".to_string(),
            });
        }

        if self.pipeline.produce_queue_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.produce_queue_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.pipeline.max_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.max_workers".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.storage.driver == StorageDriver::S3 {
            let s3 = &self.storage.s3;
            for (field, bucket) in [
                ("storage.s3.quarantine_bucket", &s3.quarantine_bucket),
                ("storage.s3.permanent_bucket", &s3.permanent_bucket),
                ("storage.s3.rejected_bucket", &s3.rejected_bucket),
            ] {
                if bucket.is_empty() {
                    return Err(ConfigValidationError::MissingField(field.to_string()));
                }
            }
        }

        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.kafka.retry_interval_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.kafka.idle_interval_ms)
    }

    pub fn storage_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.storage_upload_timeout_secs)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.progress_poll_interval_ms)
    }

    pub fn url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.s3.url_expiry_secs)
    }
}

impl KafkaConfig {
    /// Build the settings shared by producer and consumer clients
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);

        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(ref ca) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let (Some(ref username), Some(ref password)) =
            (&self.sasl_username, &self.sasl_password)
        {
            config.set("sasl.username", username);
            config.set("sasl.password", password);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("request.timeout.ms", self.request_timeout_ms.to_string());
        config.set("message.timeout.ms", self.request_timeout_ms.to_string());
        config.set("acks", "all");

        config
    }

    /// Build a consumer ClientConfig
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.group_id);
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "true");

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Layer the flat environment knobs on top of everything else.
fn apply_legacy_env<F>(
    mut builder: ConfigBuilder<DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<DefaultState>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (env_key, config_key) in LEGACY_ENV_KEYS {
        let value = lookup(env_key).map(|v| match *env_key {
            "STORAGE_DRIVER" | "LOGLEVEL" => v.to_lowercase(),
            _ => v,
        });
        builder = builder.set_override_option(*config_key, value)?;
    }
    Ok(builder)
}
