use crate::analysis::{AnalysisRecord, Confidence, ConfidenceError, Label};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored label for {image_id} is invalid: {source}")]
    InvalidLabel {
        image_id: String,
        source: ConfidenceError,
    },

    #[error("Result store call timed out")]
    Timeout,
}

/// Keyed storage for analysis records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write the record under its image id, replacing any previous one
    async fn put(&self, record: &AnalysisRecord) -> Result<(), StoreError>;

    /// Read the record stored for an image id
    async fn get(&self, image_id: &str) -> Result<Option<AnalysisRecord>, StoreError>;
}

#[derive(Debug, FromRow)]
struct RecordRow {
    image_id: String,
    bucket: String,
    detected_text: Vec<String>,
    analyzed_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct LabelRow {
    name: String,
    confidence: Decimal,
}

/// PostgreSQL backed result store
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    #[instrument(skip(self, record), fields(image_id = %record.image_id))]
    async fn put(&self, record: &AnalysisRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO analysis_records (
                image_id, bucket, detected_text, analyzed_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, NOW()
            )
            ON CONFLICT (image_id) DO UPDATE SET
                bucket = EXCLUDED.bucket,
                detected_text = EXCLUDED.detected_text,
                analyzed_at = EXCLUDED.analyzed_at,
                updated_at = NOW()
            "#,
        )
        .bind(&record.image_id)
        .bind(&record.bucket)
        .bind(&record.detected_text)
        .bind(record.analyzed_at)
        .execute(&mut *tx)
        .await?;

        // Labels are replaced wholesale so a re-analysis never accumulates rows
        sqlx::query("DELETE FROM analysis_labels WHERE image_id = $1")
            .bind(&record.image_id)
            .execute(&mut *tx)
            .await?;

        for (position, label) in record.labels.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO analysis_labels (image_id, position, name, confidence)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&record.image_id)
            .bind(position as i32)
            .bind(&label.name)
            .bind(label.confidence.value())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            labels = record.labels.len(),
            text_fragments = record.detected_text.len(),
            "Analysis record stored"
        );

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, image_id: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        // Record and labels must come from the same committed write
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT image_id, bucket, detected_text, analyzed_at
            FROM analysis_records
            WHERE image_id = $1
            "#,
        )
        .bind(image_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let label_rows = sqlx::query_as::<_, LabelRow>(
            r#"
            SELECT name, confidence
            FROM analysis_labels
            WHERE image_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(image_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        assemble_record(row, label_rows).map(Some)
    }
}

fn assemble_record(row: RecordRow, label_rows: Vec<LabelRow>) -> Result<AnalysisRecord, StoreError> {
    let labels = label_rows
        .into_iter()
        .map(|label| {
            Confidence::try_from(label.confidence)
                .map(|confidence| Label {
                    name: label.name,
                    confidence,
                })
                .map_err(|source| StoreError::InvalidLabel {
                    image_id: row.image_id.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AnalysisRecord {
        image_id: row.image_id,
        bucket: row.bucket,
        labels,
        detected_text: row.detected_text,
        analyzed_at: row.analyzed_at,
    })
}
