//! Label and text detection.
//!
//! [`RecognitionProvider`] is the raw capability (Rekognition in
//! production). [`RecognitionAdapter`] runs both detections for one image,
//! isolates their failures from each other, and turns provider scores
//! into bounded [`Label`]s.

use crate::analysis::{Confidence, ImageRef, Label};
use crate::config::RecognitionConfig;
use async_trait::async_trait;
use aws_sdk_rekognition::error::{DisplayErrorContext, SdkError};
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use aws_types::SdkConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors from a single detection call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("Image object not found or unreadable: {0}")]
    ObjectNotFound(String),

    #[error("Detection timed out: {0}")]
    Timeout(String),

    #[error("Recognition service unavailable: {0}")]
    Unavailable(String),
}

/// Label as reported by the provider, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct RawLabel {
    pub name: String,
    pub confidence: f32,
}

impl RawLabel {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Image recognition capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Detect scene labels, at most `max_labels` at or above `min_confidence`
    async fn detect_labels(
        &self,
        image: &ImageRef,
        max_labels: i32,
        min_confidence: f32,
    ) -> Result<Vec<RawLabel>, RecognitionError>;

    /// Detect text fragments in provider order
    async fn detect_text(&self, image: &ImageRef) -> Result<Vec<String>, RecognitionError>;
}

/// Which of the two detections failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Labels,
    Text,
}

impl Detection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Detection::Labels => "labels",
            Detection::Text => "text",
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detection that failed and was replaced by an empty result
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionFailure {
    pub detection: Detection,
    pub error: RecognitionError,
}

/// Both detection results for one image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub labels: Vec<Label>,
    pub text: Vec<String>,
    pub failures: Vec<RecognitionFailure>,
}

impl Recognition {
    /// Exactly one of the two detections failed
    pub fn is_partial(&self) -> bool {
        self.failures.len() == 1
    }

    pub fn failed(&self, detection: Detection) -> bool {
        self.failures.iter().any(|f| f.detection == detection)
    }
}

/// Runs label and text detection with per-call failure isolation
pub struct RecognitionAdapter {
    provider: Arc<dyn RecognitionProvider>,
    max_labels: usize,
    min_confidence: f32,
    call_timeout: Duration,
}

impl RecognitionAdapter {
    pub fn new(provider: Arc<dyn RecognitionProvider>, config: &RecognitionConfig) -> Self {
        Self {
            provider,
            // Rekognition rejects MaxLabels below 1
            max_labels: config.max_labels.max(1) as usize,
            min_confidence: config.min_confidence,
            call_timeout: config.call_timeout(),
        }
    }

    /// Run both detections concurrently. A failing call yields an empty
    /// result plus a [`RecognitionFailure`]; it never aborts the other call.
    #[instrument(skip(self, image), fields(image = %image))]
    pub async fn analyze(&self, image: &ImageRef) -> Recognition {
        let labels_call = tokio::time::timeout(
            self.call_timeout,
            self.provider
                .detect_labels(image, self.max_labels as i32, self.min_confidence),
        );
        let text_call = tokio::time::timeout(self.call_timeout, self.provider.detect_text(image));

        let (labels_result, text_result) = tokio::join!(labels_call, text_call);

        let mut recognition = Recognition::default();

        match flatten_timeout(labels_result, self.call_timeout) {
            Ok(raw) => recognition.labels = self.bound_labels(raw),
            Err(error) => recognition.failures.push(self.absorb(image, Detection::Labels, error)),
        }

        match flatten_timeout(text_result, self.call_timeout) {
            Ok(text) => recognition.text = text,
            Err(error) => recognition.failures.push(self.absorb(image, Detection::Text, error)),
        }

        debug!(
            labels = recognition.labels.len(),
            text_fragments = recognition.text.len(),
            failures = recognition.failures.len(),
            "Recognition finished"
        );

        recognition
    }

    /// Keep provider order, drop labels below the threshold or with an
    /// invalid score, and cap the count.
    fn bound_labels(&self, raw: Vec<RawLabel>) -> Vec<Label> {
        raw.into_iter()
            .filter(|label| label.confidence >= self.min_confidence)
            .filter_map(|label| match Confidence::from_f32(label.confidence) {
                Ok(confidence) => Some(Label {
                    name: label.name,
                    confidence,
                }),
                Err(e) => {
                    warn!(label = %label.name, error = %e, "Dropping label with invalid confidence");
                    None
                }
            })
            .take(self.max_labels)
            .collect()
    }

    fn absorb(
        &self,
        image: &ImageRef,
        detection: Detection,
        error: RecognitionError,
    ) -> RecognitionFailure {
        warn!(
            image = %image,
            detection = %detection,
            error = %error,
            "Detection failed, continuing with empty result"
        );
        metrics::counter!("detector.recognition.failures", "detection" => detection.as_str())
            .increment(1);

        RecognitionFailure { detection, error }
    }
}

fn flatten_timeout<T>(
    result: Result<Result<T, RecognitionError>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T, RecognitionError> {
    result.unwrap_or_else(|_| {
        Err(RecognitionError::Timeout(format!(
            "no response within {:?}",
            timeout
        )))
    })
}

/// Amazon Rekognition backed provider
pub struct RekognitionProvider {
    client: RekognitionClient,
}

impl RekognitionProvider {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: RekognitionClient::new(sdk_config),
        }
    }
}

fn s3_image(image: &ImageRef) -> Image {
    Image::builder()
        .s3_object(
            S3Object::builder()
                .bucket(&image.bucket)
                .name(&image.key)
                .build(),
        )
        .build()
}

/// Map an SDK error; `not_found` tells whether the service error means the
/// referenced object is missing or unreadable.
fn map_sdk_error<E, R>(err: SdkError<E, R>, not_found: impl Fn(&E) -> bool) -> RecognitionError
where
    E: std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    if matches!(err, SdkError::TimeoutError(_)) {
        return RecognitionError::Timeout(DisplayErrorContext(&err).to_string());
    }
    if err.as_service_error().map(&not_found).unwrap_or(false) {
        return RecognitionError::ObjectNotFound(DisplayErrorContext(&err).to_string());
    }
    RecognitionError::Unavailable(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl RecognitionProvider for RekognitionProvider {
    #[instrument(skip(self, image), fields(image = %image))]
    async fn detect_labels(
        &self,
        image: &ImageRef,
        max_labels: i32,
        min_confidence: f32,
    ) -> Result<Vec<RawLabel>, RecognitionError> {
        let response = self
            .client
            .detect_labels()
            .image(s3_image(image))
            .max_labels(max_labels)
            .min_confidence(min_confidence)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, |se| se.is_invalid_s3_object_exception()))?;

        Ok(response
            .labels()
            .iter()
            .filter_map(|label| Some(RawLabel::new(label.name()?, label.confidence()?)))
            .collect())
    }

    #[instrument(skip(self, image), fields(image = %image))]
    async fn detect_text(&self, image: &ImageRef) -> Result<Vec<String>, RecognitionError> {
        let response = self
            .client
            .detect_text()
            .image(s3_image(image))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, |se| se.is_invalid_s3_object_exception()))?;

        Ok(response
            .text_detections()
            .iter()
            .filter_map(|detection| detection.detected_text().map(String::from))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn config() -> RecognitionConfig {
        RecognitionConfig {
            max_labels: 3,
            min_confidence: 70.0,
            call_timeout_secs: 5,
        }
    }

    fn image() -> ImageRef {
        ImageRef::new("images", "car1.jpg")
    }

    #[tokio::test]
    async fn test_both_detections_succeed() {
        let mut provider = MockRecognitionProvider::new();
        provider
            .expect_detect_labels()
            .withf(|image, max_labels, min_confidence| {
                image.key == "car1.jpg" && *max_labels == 3 && *min_confidence == 70.0
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![
                    RawLabel::new("Car", 99.5),
                    RawLabel::new("Vehicle", 98.25),
                ])
            });
        provider
            .expect_detect_text()
            .times(1)
            .returning(|_| Ok(vec!["ABC123".to_string(), "ENTRY".to_string()]));

        let adapter = RecognitionAdapter::new(Arc::new(provider), &config());
        let recognition = adapter.analyze(&image()).await;

        assert!(recognition.failures.is_empty());
        assert_eq!(recognition.labels.len(), 2);
        assert_eq!(recognition.labels[0].name, "Car");
        assert_eq!(
            recognition.labels[1].confidence.value(),
            Decimal::from_str("98.25").unwrap()
        );
        assert_eq!(recognition.text, vec!["ABC123", "ENTRY"]);
    }

    #[tokio::test]
    async fn test_labels_are_filtered_and_capped() {
        let mut provider = MockRecognitionProvider::new();
        provider.expect_detect_labels().returning(|_, _, _| {
            Ok(vec![
                RawLabel::new("Car", 99.0),
                RawLabel::new("Blurry", 40.0),
                RawLabel::new("Road", 90.0),
                RawLabel::new("Glitch", 250.0),
                RawLabel::new("Tree", 80.0),
                RawLabel::new("Sky", 75.0),
            ])
        });
        provider.expect_detect_text().returning(|_| Ok(vec![]));

        let adapter = RecognitionAdapter::new(Arc::new(provider), &config());
        let recognition = adapter.analyze(&image()).await;

        let names: Vec<_> = recognition.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Car", "Road", "Tree"]);
    }

    #[tokio::test]
    async fn test_label_failure_keeps_text() {
        let mut provider = MockRecognitionProvider::new();
        provider
            .expect_detect_labels()
            .returning(|_, _, _| Err(RecognitionError::ObjectNotFound("car1.jpg".into())));
        provider
            .expect_detect_text()
            .returning(|_| Ok(vec!["ABC123".to_string()]));

        let adapter = RecognitionAdapter::new(Arc::new(provider), &config());
        let recognition = adapter.analyze(&image()).await;

        assert!(recognition.labels.is_empty());
        assert_eq!(recognition.text, vec!["ABC123"]);
        assert!(recognition.is_partial());
        assert!(recognition.failed(Detection::Labels));
        assert!(!recognition.failed(Detection::Text));
    }

    #[tokio::test]
    async fn test_text_failure_keeps_labels() {
        let mut provider = MockRecognitionProvider::new();
        provider
            .expect_detect_labels()
            .returning(|_, _, _| Ok(vec![RawLabel::new("Car", 99.0)]));
        provider
            .expect_detect_text()
            .returning(|_| Err(RecognitionError::Unavailable("throttled".into())));

        let adapter = RecognitionAdapter::new(Arc::new(provider), &config());
        let recognition = adapter.analyze(&image()).await;

        assert_eq!(recognition.labels.len(), 1);
        assert!(recognition.text.is_empty());
        assert_eq!(
            recognition.failures,
            vec![RecognitionFailure {
                detection: Detection::Text,
                error: RecognitionError::Unavailable("throttled".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_non_positive_max_labels_requests_one() {
        let mut provider = MockRecognitionProvider::new();
        provider
            .expect_detect_labels()
            .withf(|_, max_labels, _| *max_labels == 1)
            .times(1)
            .returning(|_, _, _| Ok(vec![RawLabel::new("Car", 99.0), RawLabel::new("Road", 90.0)]));
        provider.expect_detect_text().returning(|_| Ok(vec![]));

        let adapter = RecognitionAdapter::new(
            Arc::new(provider),
            &RecognitionConfig {
                max_labels: 0,
                ..config()
            },
        );
        let recognition = adapter.analyze(&image()).await;

        assert!(recognition.failures.is_empty());
        assert_eq!(recognition.labels.len(), 1);
        assert_eq!(recognition.labels[0].name, "Car");
    }

    struct SlowText;

    #[async_trait]
    impl RecognitionProvider for SlowText {
        async fn detect_labels(
            &self,
            _image: &ImageRef,
            _max_labels: i32,
            _min_confidence: f32,
        ) -> Result<Vec<RawLabel>, RecognitionError> {
            Ok(vec![RawLabel::new("Car", 99.0)])
        }

        async fn detect_text(&self, _image: &ImageRef) -> Result<Vec<String>, RecognitionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec!["never".to_string()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_detection_times_out() {
        let adapter = RecognitionAdapter::new(Arc::new(SlowText), &config());
        let recognition = adapter.analyze(&image()).await;

        assert_eq!(recognition.labels.len(), 1);
        assert!(recognition.text.is_empty());
        assert_eq!(
            recognition.failures[0].error,
            RecognitionError::Timeout("no response within 5s".to_string())
        );
    }
}
