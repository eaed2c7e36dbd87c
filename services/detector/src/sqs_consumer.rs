use crate::config::QueueConfig;
use crate::event::RawEnvelope;
use crate::pipeline::{Pipeline, ProcessOutcome};
use anyhow::{Context, Result};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use aws_types::SdkConfig;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Whether a message should be removed from the queue after processing.
/// Only `Failed` outcomes stay in flight so the queue redelivers them.
pub fn should_acknowledge(outcome: &ProcessOutcome) -> bool {
    !outcome.is_retryable()
}

/// Long-polling worker for S3 event notifications
pub struct EventQueueConsumer {
    client: SqsClient,
    queue_url: String,
    batch_size: i32,
    wait_time_secs: i32,
    visibility_timeout_secs: i32,
    concurrency: usize,
    pipeline: Arc<Pipeline>,
}

impl EventQueueConsumer {
    pub fn new(sdk_config: &SdkConfig, config: &QueueConfig, pipeline: Arc<Pipeline>) -> Self {
        Self {
            client: SqsClient::new(sdk_config),
            queue_url: config.url.clone(),
            batch_size: config.batch_size.clamp(1, 10),
            wait_time_secs: config.wait_time_secs.clamp(0, 20),
            visibility_timeout_secs: config.visibility_timeout_secs,
            concurrency: config.concurrency.max(1),
            pipeline,
        }
    }

    /// Receive and process messages until `shutdown` is cancelled.
    /// A batch already received is finished before returning.
    #[instrument(skip(self, shutdown), fields(queue_url = %self.queue_url))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            concurrency = self.concurrency,
            "Starting event queue consumer"
        );

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.receive_batch() => received,
            };

            match received {
                Ok(messages) => {
                    backoff.reset();
                    if messages.is_empty() {
                        continue;
                    }
                    debug!(count = messages.len(), "Received message batch");
                    self.process_batch(messages).await;
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Failed to receive messages, backing off"
                    );
                    metrics::counter!("detector.queue.errors").increment(1);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Event queue consumer stopped");
        Ok(())
    }

    async fn receive_batch(&self) -> Result<Vec<Message>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.batch_size)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(DisplayErrorContext(&e).to_string()))
            .context("ReceiveMessage failed")?;

        Ok(output.messages().to_vec())
    }

    async fn process_batch(&self, messages: Vec<Message>) {
        futures::stream::iter(messages)
            .for_each_concurrent(self.concurrency, |message| async move {
                self.process_message(message).await;
            })
            .await;
    }

    #[instrument(skip(self, message), fields(message_id = message.message_id().unwrap_or_default()))]
    async fn process_message(&self, message: Message) {
        let body = message.body().unwrap_or_default().to_string();
        let outcome = self.pipeline.handle(RawEnvelope::Notification(body)).await;

        if !should_acknowledge(&outcome) {
            warn!(
                status = outcome.status_code(),
                "Leaving message in flight for redelivery"
            );
            return;
        }

        let Some(receipt_handle) = message.receipt_handle() else {
            warn!("Message has no receipt handle, cannot delete");
            return;
        };

        if let Err(e) = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            // The message will be redelivered and processed again
            warn!(error = %DisplayErrorContext(&e), "Failed to delete message");
            metrics::counter!("detector.queue.delete_failed").increment(1);
        }
    }
}
