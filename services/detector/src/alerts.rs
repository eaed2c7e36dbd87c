//! Alert construction and dispatch.
//!
//! Every alert-worthy match is published on its own. Publishing is retried
//! with exponential backoff up to `alerts.max_attempts`; a final failure is
//! reported to the caller as [`DispatchOutcome::Failed`] and never fails
//! the event.

use crate::analysis::ImageRef;
use crate::config::AlertConfig;
use crate::registry::MatchOutcome;
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client as SnsClient;
use aws_types::SdkConfig;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// SNS rejects subjects longer than this
pub const MAX_SUBJECT_CHARS: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("Failed to publish alert: {0}")]
    Publish(String),

    #[error("Publishing timed out after {0:?}")]
    Timeout(Duration),
}

/// Downstream alert channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Publish one message, returning the channel's message id
    async fn publish(&self, subject: &str, body: &str) -> Result<String, AlertError>;
}

/// Amazon SNS topic
pub struct SnsAlertChannel {
    client: SnsClient,
    topic_arn: String,
}

impl SnsAlertChannel {
    pub fn new(sdk_config: &SdkConfig, topic_arn: impl Into<String>) -> Self {
        Self {
            client: SnsClient::new(sdk_config),
            topic_arn: topic_arn.into(),
        }
    }
}

#[async_trait]
impl AlertChannel for SnsAlertChannel {
    #[instrument(skip(self, body), fields(topic_arn = %self.topic_arn))]
    async fn publish(&self, subject: &str, body: &str) -> Result<String, AlertError> {
        let response = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(subject)
            .message(body)
            .send()
            .await
            .map_err(|e| AlertError::Publish(DisplayErrorContext(&e).to_string()))?;

        Ok(response.message_id().unwrap_or_default().to_string())
    }
}

/// A structured alert for one flagged match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub identifier: String,
    pub subject: String,
    pub body: String,
}

impl Alert {
    pub fn for_match(
        subject_prefix: &str,
        outcome: &MatchOutcome,
        image: &ImageRef,
        detected_text: &[String],
    ) -> Self {
        let subject = truncate_chars(
            &format!("{}: {}", subject_prefix, outcome.identifier),
            MAX_SUBJECT_CHARS,
        );

        let body = format!(
            "{}\nImage: {}\nBucket: {}\nDetected text: {}",
            outcome.summary,
            image.key,
            image.bucket,
            detected_text.join(" ")
        );

        Self {
            identifier: outcome.identifier.clone(),
            subject,
            body,
        }
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Result of dispatching one alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        identifier: String,
        message_id: String,
        attempts: u32,
    },
    Failed {
        identifier: String,
        error: AlertError,
        attempts: u32,
    },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

/// Publishes alerts with bounded retry
pub struct AlertDispatcher {
    channel: Arc<dyn AlertChannel>,
    subject_prefix: String,
    max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    publish_timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(channel: Arc<dyn AlertChannel>, config: &AlertConfig, publish_timeout: Duration) -> Self {
        Self {
            channel,
            subject_prefix: config.subject_prefix.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
            publish_timeout,
        }
    }

    pub fn subject_prefix(&self) -> &str {
        &self.subject_prefix
    }

    /// Publish one alert. Failures are logged and returned, never raised.
    #[instrument(skip(self, alert), fields(identifier = %alert.identifier))]
    pub async fn dispatch(&self, alert: &Alert) -> DispatchOutcome {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_base_delay,
            max_interval: self.retry_max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let result = tokio::time::timeout(
                self.publish_timeout,
                self.channel.publish(&alert.subject, &alert.body),
            )
            .await
            .unwrap_or(Err(AlertError::Timeout(self.publish_timeout)));

            match result {
                Ok(message_id) => {
                    info!(
                        message_id = %message_id,
                        attempts = attempts,
                        "Alert published"
                    );
                    metrics::counter!("detector.alerts.sent").increment(1);
                    return DispatchOutcome::Delivered {
                        identifier: alert.identifier.clone(),
                        message_id,
                        attempts,
                    };
                }
                Err(e) if attempts >= self.max_attempts => {
                    error!(
                        attempts = attempts,
                        error = %e,
                        "Failed to publish alert, giving up"
                    );
                    metrics::counter!("detector.alerts.failed").increment(1);
                    return DispatchOutcome::Failed {
                        identifier: alert.identifier.clone(),
                        error: e,
                        attempts,
                    };
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.retry_max_delay);
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Alert publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
