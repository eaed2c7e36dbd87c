//! Checkpoint Detector Service
//!
//! Event-driven image analysis for vehicle checkpoints. Each new image in
//! object storage produces a notification; the service recognizes labels
//! and text in the image, archives the result, checks the text against a
//! registry of flagged identifiers and publishes an alert for every
//! flagged identifier it finds.
//!
//! ## Architecture
//!
//! ```text
//!  S3 notification                                     PostgreSQL
//! ┌──────────────┐   ┌──────────────┐             ┌──────────────────┐
//! │ SQS queue    │──▶│ Queue        │             │ analysis_records │
//! └──────────────┘   │ Consumer     │──┐          │ analysis_labels  │
//!                    └──────────────┘  │          └──────────────────┘
//! ┌──────────────┐                     ▼                   ▲
//! │ POST         │──────────────▶┌──────────────┐          │
//! │ /v1/events   │               │ Pipeline     │──────────┤
//! └──────────────┘               └──────────────┘          │
//!                                  │         │             │
//!                                  ▼         ▼             │
//!                        ┌────────────┐ ┌────────────┐ ┌───────────────────┐
//!                        │ Rekognition│ │ Alert      │ │ flagged_          │
//!                        │ labels+text│ │ Dispatcher │ │ identifiers       │
//!                        └────────────┘ └────────────┘ └───────────────────┘
//!                                             │
//!                                             ▼
//!                                       ┌────────────┐
//!                                       │ SNS topic  │
//!                                       └────────────┘
//! ```

pub mod alerts;
pub mod analysis;
pub mod api;
pub mod aws;
pub mod config;
pub mod db;
pub mod event;
pub mod pipeline;
pub mod recognition;
pub mod registry;
pub mod result_store;
pub mod sqs_consumer;

pub use alerts::{Alert, AlertChannel, AlertDispatcher, DispatchOutcome, SnsAlertChannel};
pub use analysis::{AnalysisRecord, Confidence, ImageRef, Label};
pub use api::AppState;
pub use config::Config;
pub use event::{EventError, IngestionEvent, RawEnvelope};
pub use pipeline::{EventReport, Pipeline, ProcessOutcome, Stage};
pub use recognition::{RecognitionAdapter, RecognitionProvider, RekognitionProvider};
pub use registry::{FlaggedEntry, MatchReport, PgRegistry, RegistryMatcher, RegistrySource};
pub use result_store::{PgResultStore, ResultStore};
pub use sqs_consumer::EventQueueConsumer;
