use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the detector service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Shared AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// Ingestion queue configuration
    pub queue: QueueConfig,
    /// Recognition configuration
    #[serde(default)]
    pub recognition: RecognitionConfig,
    /// Orchestrator configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Alert channel configuration
    pub alerts: AlertConfig,
    /// API configuration
    pub api: ApiConfig,
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

/// AWS configuration shared by the Rekognition, SNS and SQS clients
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Timeout for a whole SDK operation, retries included
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Timeout for a single SDK attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

/// SQS queue receiving S3 event notifications
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue URL
    pub url: String,
    /// Maximum messages per receive call (1-10)
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    /// Long-poll wait time in seconds (0-20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Visibility timeout applied to received messages, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i32,
    /// Number of events processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// Label and text detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Maximum number of labels kept per image
    #[serde(default = "default_max_labels")]
    pub max_labels: i32,
    /// Minimum label confidence (0-100)
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Upper bound for one detection call in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound for the persist and registry stages in seconds
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
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

/// SNS alert configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Topic ARN alerts are published to
    pub topic_arn: String,
    /// Subject prefix; the matched identifier is appended
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Publish attempts per alert (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum retry delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "checkpoint-detector".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

fn default_batch_size() -> i32 {
    10
}

fn default_wait_time_secs() -> i32 {
    20
}

fn default_visibility_timeout_secs() -> i32 {
    300
}

fn default_concurrency() -> usize {
    4
}

fn default_max_labels() -> i32 {
    10
}

fn default_min_confidence() -> f32 {
    70.0
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_stage_timeout_secs() -> u64 {
    15
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

fn default_subject_prefix() -> String {
    "Blacklisted Vehicle Detected".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "checkpoint-detector")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("api.port", 8080)?
            .add_source(config::File::with_name("config/detector").required(false))
            .add_source(config::File::with_name("/etc/checkpoint/detector").required(false))
            // CHECKPOINT__QUEUE__URL -> queue.url
            .add_source(
                config::Environment::with_prefix("CHECKPOINT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Worst-case wall time of one event that raises `alerts` alerts: both
    /// detections, the persist and registry stages, then every publish
    /// attempt of every alert with the longest randomized backoff between
    /// attempts.
    pub fn event_time_budget(&self, alerts: u32) -> Duration {
        let stage = self.pipeline.stage_timeout();
        let attempts = self.alerts.max_attempts.max(1);
        let per_alert = stage * attempts
            + self.alerts.retry_max_delay().mul_f64(1.5) * (attempts - 1);

        self.recognition.call_timeout() + stage * 2 + per_alert * alerts
    }

    /// How much longer than the queue visibility timeout an event raising
    /// `alerts` alerts may run. A message still in flight past the timeout
    /// is redelivered and its alerts sent again.
    pub fn visibility_shortfall(&self, alerts: u32) -> Option<Duration> {
        self.event_time_budget(alerts)
            .checked_sub(self.queue.visibility_timeout())
            .filter(|shortfall| !shortfall.is_zero())
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs.max(0) as u64)
    }
}

impl AwsConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl RecognitionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

impl AlertConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
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

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            operation_timeout_secs: default_operation_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            max_labels: default_max_labels(),
            min_confidence: default_min_confidence(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_labels(), 10);
        assert_eq!(default_min_confidence(), 70.0);
        assert_eq!(default_max_attempts(), 3);
        assert_eq!(default_subject_prefix(), "Blacklisted Vehicle Detected");
    }

    fn minimal_config() -> Config {
        config::Config::builder()
            .set_default("service.name", "checkpoint-detector")
            .unwrap()
            .set_default("queue.url", "http://localhost:4566/000000000000/images")
            .unwrap()
            .set_default("database.url", "postgres://localhost/checkpoint")
            .unwrap()
            .set_default("alerts.topic_arn", "arn:aws:sns:us-east-1:000000000000:alerts")
            .unwrap()
            .set_default("api.port", 8080)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config = minimal_config();
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.recognition.max_labels, 10);
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.pipeline.stage_timeout(), Duration::from_secs(15));
        assert_eq!(config.alerts.retry_base_delay(), Duration::from_millis(200));
        assert!(config.database.run_migrations);
        assert_eq!(config.queue.visibility_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_event_time_budget() {
        let config = minimal_config();

        // 30s recognition, 15s persist, 15s registry
        assert_eq!(config.event_time_budget(0), Duration::from_secs(60));
        // 3 publishes of 15s plus 2 backoffs of at most 3s
        assert_eq!(config.event_time_budget(1), Duration::from_secs(111));
        assert_eq!(config.event_time_budget(4), Duration::from_secs(264));
    }

    #[test]
    fn test_visibility_shortfall() {
        let mut config = minimal_config();
        assert_eq!(config.visibility_shortfall(4), None);
        assert_eq!(config.visibility_shortfall(5), Some(Duration::from_secs(15)));

        config.queue.visibility_timeout_secs = 120;
        assert_eq!(config.visibility_shortfall(1), None);
        assert_eq!(config.visibility_shortfall(2), Some(Duration::from_secs(42)));
    }
}
