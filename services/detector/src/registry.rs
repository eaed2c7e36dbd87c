//! Flagged identifier registry and text matching.
//!
//! The registry is read in full for every event and never cached, so an
//! update in the store is visible to the next event. Two events racing
//! an update may see different snapshots; that eventual consistency is
//! accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry: {0}")]
    Read(#[from] sqlx::Error),

    #[error("Registry read timed out")]
    Timeout,
}

/// One registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FlaggedEntry {
    pub identifier: String,
    pub flagged: bool,
}

impl FlaggedEntry {
    pub fn new(identifier: impl Into<String>, flagged: bool) -> Self {
        Self {
            identifier: identifier.into(),
            flagged,
        }
    }
}

/// Read-only access to the registry store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Return every entry currently in the store
    async fn load_entries(&self) -> Result<Vec<FlaggedEntry>, RegistryError>;
}

/// PostgreSQL backed registry
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistrySource for PgRegistry {
    #[instrument(skip(self))]
    async fn load_entries(&self) -> Result<Vec<FlaggedEntry>, RegistryError> {
        let entries = sqlx::query_as::<_, FlaggedEntry>(
            r#"
            SELECT identifier, flagged
            FROM flagged_identifiers
            ORDER BY identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        debug!(count = entries.len(), "Loaded registry snapshot");
        Ok(entries)
    }
}

/// A registry entry found in the detected text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    pub identifier: String,
    pub flagged: bool,
    pub summary: String,
}

impl MatchOutcome {
    fn from_entry(entry: &FlaggedEntry) -> Self {
        let summary = if entry.flagged {
            format!(
                "Blacklisted vehicle detected with identifier: {}",
                entry.identifier
            )
        } else {
            format!(
                "Match found for identifier: {}, but it is not blacklisted",
                entry.identifier
            )
        };

        Self {
            identifier: entry.identifier.clone(),
            flagged: entry.flagged,
            summary,
        }
    }

    /// Whether this match must produce an alert
    pub fn is_alert_worthy(&self) -> bool {
        self.flagged
    }
}

/// All matches for one event, in registry order. Empty means "no match".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    pub matches: Vec<MatchOutcome>,
}

impl MatchReport {
    pub fn is_no_match(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn alert_worthy(&self) -> impl Iterator<Item = &MatchOutcome> {
        self.matches.iter().filter(|m| m.is_alert_worthy())
    }

    pub fn flagged_count(&self) -> usize {
        self.alert_worthy().count()
    }

    pub fn summary(&self) -> String {
        if self.is_no_match() {
            "No match was found for the current entry".to_string()
        } else {
            self.matches
                .iter()
                .map(|m| m.summary.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        }
    }
}

/// Find every entry whose identifier occurs in the fragments joined by
/// single spaces. Matching is case-sensitive substring search; entries
/// with an empty identifier are skipped.
pub fn find_matches(entries: &[FlaggedEntry], fragments: &[String]) -> MatchReport {
    let haystack = fragments.join(" ");

    let matches = entries
        .iter()
        .filter(|entry| {
            if entry.identifier.is_empty() {
                warn!("Skipping registry entry with empty identifier");
                return false;
            }
            haystack.contains(entry.identifier.as_str())
        })
        .map(MatchOutcome::from_entry)
        .collect();

    MatchReport { matches }
}

/// Evaluates detected text against a fresh registry snapshot
pub struct RegistryMatcher {
    source: Arc<dyn RegistrySource>,
}

impl RegistryMatcher {
    pub fn new(source: Arc<dyn RegistrySource>) -> Self {
        Self { source }
    }

    #[instrument(skip(self, fragments), fields(fragments = fragments.len()))]
    pub async fn evaluate(&self, fragments: &[String]) -> Result<MatchReport, RegistryError> {
        let entries = self.source.load_entries().await?;
        let report = find_matches(&entries, fragments);

        for outcome in &report.matches {
            if outcome.flagged {
                info!(identifier = %outcome.identifier, "Flagged identifier detected");
                metrics::counter!("detector.matches.flagged").increment(1);
            } else {
                info!(
                    identifier = %outcome.identifier,
                    "Match found for identifier, but it is not flagged"
                );
                metrics::counter!("detector.matches.unflagged").increment(1);
            }
        }

        if report.is_no_match() {
            info!(registry_size = entries.len(), "No match was found for the current entry");
            metrics::counter!("detector.matches.none").increment(1);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn text(fragments: &[&str]) -> Vec<String> {
        fragments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flagged_identifier_matches() {
        let entries = vec![FlaggedEntry::new("ABC123", true)];
        let report = find_matches(&entries, &text(&["ABC123", "ENTRY"]));

        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.flagged_count(), 1);
        assert_eq!(report.matches[0].identifier, "ABC123");
        assert!(report.matches[0].summary.contains("ABC123"));
    }

    #[test]
    fn test_unflagged_match_does_not_alert() {
        let entries = vec![FlaggedEntry::new("XYZ789", false)];
        let report = find_matches(&entries, &text(&["XYZ789"]));

        assert!(!report.is_no_match());
        assert_eq!(report.flagged_count(), 0);
        assert!(report.summary().contains("not blacklisted"));
    }

    #[test]
    fn test_no_match() {
        let entries = vec![FlaggedEntry::new("ABC123", true)];
        let report = find_matches(&entries, &text(&["HELLO", "WORLD"]));

        assert!(report.is_no_match());
        assert_eq!(report.summary(), "No match was found for the current entry");
    }

    #[test]
    fn test_match_spans_fragment_boundary() {
        // Fragments are joined with one space, so an identifier containing a
        // space matches across two fragments.
        let entries = vec![FlaggedEntry::new("AB 123", true)];
        let report = find_matches(&entries, &text(&["AB", "123"]));
        assert_eq!(report.flagged_count(), 1);
    }

    #[test]
    fn test_substring_and_case_sensitivity() {
        let entries = vec![
            FlaggedEntry::new("C12", true),
            FlaggedEntry::new("abc123", true),
        ];
        let report = find_matches(&entries, &text(&["ABC123"]));

        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].identifier, "C12");
    }

    #[test]
    fn test_multiple_matches_in_registry_order() {
        let entries = vec![
            FlaggedEntry::new("AAA111", true),
            FlaggedEntry::new("BBB222", false),
            FlaggedEntry::new("CCC333", true),
        ];
        let report = find_matches(&entries, &text(&["CCC333", "BBB222", "AAA111"]));

        let ids: Vec<_> = report.matches.iter().map(|m| m.identifier.as_str()).collect();
        assert_eq!(ids, vec!["AAA111", "BBB222", "CCC333"]);
        assert_eq!(report.flagged_count(), 2);
    }

    #[test]
    fn test_empty_identifier_is_ignored() {
        let entries = vec![FlaggedEntry::new("", true)];
        assert!(find_matches(&entries, &text(&["ANYTHING"])).is_no_match());
    }

    #[tokio::test]
    async fn test_matcher_reads_registry_every_time() {
        let mut source = MockRegistrySource::new();
        source
            .expect_load_entries()
            .times(2)
            .returning(|| Ok(vec![FlaggedEntry::new("ABC123", true)]));

        let matcher = RegistryMatcher::new(Arc::new(source));
        let fragments = text(&["ABC123"]);

        let first = assert_ok!(matcher.evaluate(&fragments).await);
        let second = assert_ok!(matcher.evaluate(&fragments).await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_matcher_propagates_read_failure() {
        let mut source = MockRegistrySource::new();
        source
            .expect_load_entries()
            .returning(|| Err(RegistryError::Read(sqlx::Error::PoolTimedOut)));

        let matcher = RegistryMatcher::new(Arc::new(source));
        assert_err!(matcher.evaluate(&text(&["ABC123"])).await);
    }

    async fn seed(pool: &PgPool, entries: &[(&str, bool)]) {
        for &(identifier, flagged) in entries {
            sqlx::query("INSERT INTO flagged_identifiers (identifier, flagged) VALUES ($1, $2)")
                .bind(identifier)
                .bind(flagged)
                .execute(pool)
                .await
                .unwrap();
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_pg_registry_reads_all_entries_in_order(pool: PgPool) {
        seed(&pool, &[("ZZZ999", true), ("ABC123", false), ("MMM555", true)]).await;

        let entries = assert_ok!(PgRegistry::new(pool).load_entries().await);

        assert_eq!(
            entries,
            vec![
                FlaggedEntry::new("ABC123", false),
                FlaggedEntry::new("MMM555", true),
                FlaggedEntry::new("ZZZ999", true),
            ]
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_pg_registry_update_visible_to_next_event(pool: PgPool) {
        seed(&pool, &[("ABC123", false)]).await;
        let matcher = RegistryMatcher::new(Arc::new(PgRegistry::new(pool.clone())));
        let fragments = text(&["ABC123", "ENTRY"]);

        let before = assert_ok!(matcher.evaluate(&fragments).await);
        assert_eq!(before.flagged_count(), 0);

        sqlx::query("UPDATE flagged_identifiers SET flagged = TRUE WHERE identifier = $1")
            .bind("ABC123")
            .execute(&pool)
            .await
            .unwrap();

        let after = assert_ok!(matcher.evaluate(&fragments).await);
        assert_eq!(after.flagged_count(), 1);
    }
}
