//! Event orchestrator.
//!
//! One inbound envelope moves through
//! `Received → Parsed → Analyzed → Persisted → Matched → Completed`.
//! Each stage returns its own result type; only two things stop an event
//! early:
//!
//! - a malformed envelope, which ends in [`ProcessOutcome::Rejected`] and
//!   must never be redelivered
//! - an unexpected failure (registry unreadable, a panic), which ends in
//!   [`ProcessOutcome::Failed`] so the delivery mechanism retries it
//!
//! Recognition, persistence and dispatch failures are absorbed where they
//! happen and recorded in the [`EventReport`].

use crate::alerts::{Alert, AlertDispatcher, DispatchOutcome};
use crate::analysis::{AnalysisRecord, ImageRef};
use crate::config::PipelineConfig;
use crate::event::{EventError, IngestionEvent, RawEnvelope};
use crate::recognition::{RecognitionAdapter, RecognitionFailure};
use crate::registry::{MatchReport, RegistryError, RegistryMatcher};
use crate::result_store::{ResultStore, StoreError};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Orchestrator states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Parsed,
    Analyzed,
    Persisted,
    Matched,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Parsed => "parsed",
            Stage::Analyzed => "analyzed",
            Stage::Persisted => "persisted",
            Stage::Matched => "matched",
            Stage::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Result of the persist stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    Stored,
    Failed(String),
}

/// Everything a completed event produced
#[derive(Debug, Clone)]
pub struct EventReport {
    pub invocation_id: Uuid,
    pub image: ImageRef,
    pub record: AnalysisRecord,
    pub recognition_failures: Vec<RecognitionFailure>,
    pub persist: PersistStatus,
    pub matches: MatchReport,
    pub dispatches: Vec<DispatchOutcome>,
}

impl EventReport {
    pub fn alerts_sent(&self) -> usize {
        self.dispatches.iter().filter(|d| d.is_delivered()).count()
    }

    pub fn alerts_failed(&self) -> usize {
        self.dispatches.len() - self.alerts_sent()
    }
}

/// Terminal outcome of one event
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// All stages ran; "no match" is also a completion
    Completed(Box<EventReport>),
    /// Malformed input, never retried
    Rejected(EventError),
    /// Unexpected failure, safe to redeliver
    Failed {
        /// Last stage that was reached, when known
        reached: Option<Stage>,
        reason: String,
    },
}

impl ProcessOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            ProcessOutcome::Completed(_) => 200,
            ProcessOutcome::Rejected(_) => 400,
            ProcessOutcome::Failed { .. } => 500,
        }
    }

    /// Short caller-facing text; internal detail stays in the logs
    pub fn body(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed(_) => "Message processing completed successfully",
            ProcessOutcome::Rejected(e) => e.public_message(),
            ProcessOutcome::Failed { .. } => "Message processing failed",
        }
    }

    /// Whether the delivery mechanism should retry this event
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessOutcome::Failed { .. })
    }

    pub fn report(&self) -> Option<&EventReport> {
        match self {
            ProcessOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
enum PipelineError {
    #[error(transparent)]
    Rejected(#[from] EventError),

    #[error("Registry lookup failed: {0}")]
    Registry(#[from] RegistryError),
}

/// Drives one event through every stage
pub struct Pipeline {
    recognition: RecognitionAdapter,
    store: Arc<dyn ResultStore>,
    matcher: RegistryMatcher,
    dispatcher: AlertDispatcher,
    stage_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        recognition: RecognitionAdapter,
        store: Arc<dyn ResultStore>,
        matcher: RegistryMatcher,
        dispatcher: AlertDispatcher,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            recognition,
            store,
            matcher,
            dispatcher,
            stage_timeout: config.stage_timeout(),
        }
    }

    /// Process one envelope to a terminal outcome. Never panics and never
    /// returns a component error to the caller.
    pub async fn handle(&self, envelope: RawEnvelope) -> ProcessOutcome {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("event", invocation_id = %invocation_id, envelope = envelope.kind());
        let started = Instant::now();

        let outcome = async {
            match AssertUnwindSafe(self.run(invocation_id, &envelope))
                .catch_unwind()
                .await
            {
                Ok(Ok(report)) => {
                    info!(
                        image_id = %report.image.key,
                        matches = report.matches.matches.len(),
                        alerts_sent = report.alerts_sent(),
                        alerts_failed = report.alerts_failed(),
                        "Message processing completed successfully"
                    );
                    metrics::counter!("detector.events.completed").increment(1);
                    ProcessOutcome::Completed(Box::new(report))
                }
                Ok(Err(PipelineError::Rejected(e))) => {
                    warn!(error = %e, "Rejecting malformed message");
                    metrics::counter!("detector.events.rejected").increment(1);
                    ProcessOutcome::Rejected(e)
                }
                Ok(Err(e @ PipelineError::Registry(_))) => {
                    error!(error = %e, "Message processing failed");
                    metrics::counter!("detector.events.failed").increment(1);
                    ProcessOutcome::Failed {
                        reached: Some(Stage::Persisted),
                        reason: e.to_string(),
                    }
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(reason = %reason, "Message processing panicked");
                    metrics::counter!("detector.events.failed").increment(1);
                    ProcessOutcome::Failed {
                        reached: None,
                        reason,
                    }
                }
            }
        }
        .instrument(span)
        .await;

        metrics::histogram!("detector.event.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    async fn run(
        &self,
        invocation_id: Uuid,
        envelope: &RawEnvelope,
    ) -> Result<EventReport, PipelineError> {
        // Received -> Parsed
        let event = IngestionEvent::parse(envelope)?;
        debug!(
            stage = %Stage::Parsed,
            image = %event.image,
            event_name = ?event.event_name,
            "Event parsed"
        );

        // Parsed -> Analyzed
        let recognition = self.recognition.analyze(&event.image).await;
        let record = AnalysisRecord::new(
            &event.image,
            recognition.labels,
            recognition.text,
        );
        debug!(
            stage = %Stage::Analyzed,
            labels = record.labels.len(),
            detected_text = ?record.detected_text,
            "Image analyzed"
        );

        // Analyzed -> Persisted
        let persist = self.persist(&record).await;
        debug!(stage = %Stage::Persisted, status = ?persist, "Persist stage finished");

        // Persisted -> Matched
        let matches = tokio::time::timeout(
            self.stage_timeout,
            self.matcher.evaluate(&record.detected_text),
        )
        .await
        .unwrap_or(Err(RegistryError::Timeout))?;

        let mut dispatches = Vec::new();
        for outcome in matches.alert_worthy() {
            let alert = Alert::for_match(
                self.dispatcher.subject_prefix(),
                outcome,
                &event.image,
                &record.detected_text,
            );
            dispatches.push(self.dispatcher.dispatch(&alert).await);
        }
        debug!(
            stage = %Stage::Matched,
            summary = %matches.summary(),
            alerts = dispatches.len(),
            "Registry evaluated"
        );

        // Matched -> Completed
        Ok(EventReport {
            invocation_id,
            image: event.image,
            record,
            recognition_failures: recognition.failures,
            persist,
            matches,
            dispatches,
        })
    }

    /// Persistence failures are absorbed: the alert decision matters more
    /// than the archived record.
    async fn persist(&self, record: &AnalysisRecord) -> PersistStatus {
        let result = tokio::time::timeout(self.stage_timeout, self.store.put(record))
            .await
            .unwrap_or(Err(StoreError::Timeout));

        match result {
            Ok(()) => {
                info!(image_id = %record.image_id, "Successfully saved analysis record");
                metrics::counter!("detector.records.persisted").increment(1);
                PersistStatus::Stored
            }
            Err(e) => {
                warn!(
                    image_id = %record.image_id,
                    error = %e,
                    "Failed to save analysis record, continuing"
                );
                metrics::counter!("detector.records.persist_failed").increment(1);
                PersistStatus::Failed(e.to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
