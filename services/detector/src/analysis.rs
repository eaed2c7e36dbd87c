//! Analysis data model shared by every pipeline stage.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reference to an image object in storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Source bucket name
    pub bucket: String,
    /// Object key, also used as the image identifier
    pub key: String,
}

impl ImageRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfidenceError {
    #[error("Confidence {0} is not a finite number")]
    NotFinite(f32),

    #[error("Confidence {0} is outside 0-100")]
    OutOfRange(Decimal),
}

/// Label confidence as an exact decimal percentage in `[0, 100]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Confidence(Decimal);

impl Confidence {
    pub const MIN: Decimal = Decimal::ZERO;
    pub const MAX: Decimal = Decimal::ONE_HUNDRED;

    /// Convert a provider score through its shortest decimal form, so
    /// `97.5f32` becomes exactly `97.5` rather than its binary expansion.
    pub fn from_f32(value: f32) -> Result<Self, ConfidenceError> {
        if !value.is_finite() {
            return Err(ConfidenceError::NotFinite(value));
        }

        let decimal =
            Decimal::from_str(&value.to_string()).map_err(|_| ConfidenceError::NotFinite(value))?;
        Self::try_from(decimal)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Confidence {
    type Error = ConfidenceError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        if value < Self::MIN || value > Self::MAX {
            return Err(ConfidenceError::OutOfRange(value));
        }
        Ok(Self(value.normalize()))
    }
}

impl From<Confidence> for Decimal {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Scene label with its confidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: Confidence,
}

/// Result of examining one image.
///
/// Built once per event and written once; a re-processed image produces
/// a new record that replaces the old one under the same `image_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// Object key of the analyzed image
    pub image_id: String,
    /// Bucket the image was read from
    pub bucket: String,
    /// Labels in provider order
    pub labels: Vec<Label>,
    /// Detected text fragments in provider order
    pub detected_text: Vec<String>,
    /// When the analysis finished
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn new(image: &ImageRef, labels: Vec<Label>, detected_text: Vec<String>) -> Self {
        Self {
            image_id: image.key.clone(),
            bucket: image.bucket.clone(),
            labels,
            detected_text,
            analyzed_at: Utc::now(),
        }
    }

    /// Detected text joined with single spaces, in detection order
    pub fn joined_text(&self) -> String {
        self.detected_text.join(" ")
    }

    /// Compare the analysis content, ignoring when it was produced
    pub fn same_content(&self, other: &AnalysisRecord) -> bool {
        self.image_id == other.image_id
            && self.bucket == other.bucket
            && self.labels == other.labels
            && self.detected_text == other.detected_text
    }
}
