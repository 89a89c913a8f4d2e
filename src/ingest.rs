//! Ingestion: normalize, reject, de-duplicate and bulk insert candidate
//! rows as `pending` records of a job.

use crate::errors::PipelineError;
use crate::normalizer::{normalize_row, CandidateRow, NormalizedRow, RawRow};
use crate::storage::{self, NewImportError};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const MISSING_EMAIL: &str = "Missing or empty email address";
pub const DUPLICATE_EMAIL: &str = "Duplicate email address";

/// What one `ingest_batch` call did with its rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub received: usize,
    pub ghost: usize,
    pub missing_email: usize,
    pub duplicates: usize,
    pub inserted: u64,
}

impl IngestSummary {
    pub fn rejected(&self) -> usize {
        self.missing_email + self.duplicates
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateResolution {
    pub accepted: Vec<CandidateRow>,
    pub duplicates: Vec<CandidateRow>,
}

/// Walk candidates in order. The first occurrence of an email not in
/// `known` is accepted; every later occurrence is a duplicate.
pub fn partition_duplicates(
    candidates: Vec<CandidateRow>,
    mut known: HashSet<String>,
) -> DuplicateResolution {
    let mut resolution = DuplicateResolution::default();

    for candidate in candidates {
        if known.insert(candidate.email.clone()) {
            resolution.accepted.push(candidate);
        } else {
            resolution.duplicates.push(candidate);
        }
    }

    resolution
}

/// Partition against the current store contents plus the batch itself.
pub async fn resolve_duplicates(
    db: &DatabaseConnection,
    candidates: Vec<CandidateRow>,
) -> Result<DuplicateResolution, PipelineError> {
    let emails: Vec<String> = candidates.iter().map(|c| c.email.clone()).collect();
    let known = storage::existing_emails(db, &emails).await?;

    Ok(partition_duplicates(candidates, known))
}

fn snapshot<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    Ok(serde_json::to_string(value)?)
}

fn duplicate_errors(rows: &[CandidateRow]) -> Result<Vec<NewImportError>, PipelineError> {
    rows.iter()
        .map(|row| {
            Ok(NewImportError {
                record_data: snapshot(row)?,
                error_message: DUPLICATE_EMAIL.to_string(),
            })
        })
        .collect()
}

/// Ingest one batch (a whole payload, or one chunk of a streamed file).
///
/// Rejected rows are logged as import errors and counted as failed with a
/// single counter update. Accepted rows become `pending` records. Anything
/// already written stays written if a later step fails.
pub async fn ingest_batch(
    db: &DatabaseConnection,
    job_id: i64,
    rows: &[RawRow],
) -> Result<IngestSummary, PipelineError> {
    let mut summary = IngestSummary {
        received: rows.len(),
        ..Default::default()
    };
    if rows.is_empty() {
        return Ok(summary);
    }

    let mut candidates = Vec::new();
    let mut errors = Vec::new();

    for raw in rows {
        match normalize_row(raw) {
            NormalizedRow::Ghost => summary.ghost += 1,
            NormalizedRow::MissingEmail => {
                summary.missing_email += 1;
                errors.push(NewImportError {
                    record_data: snapshot(raw)?,
                    error_message: MISSING_EMAIL.to_string(),
                });
            }
            NormalizedRow::Valid(candidate) => candidates.push(candidate),
        }
    }

    if candidates.is_empty() {
        let failed = errors.len() as i64;
        storage::insert_import_errors(db, job_id, errors).await?;
        storage::increment_job_counters(db, job_id, 0, failed).await?;
        debug!(job_id, ghost = summary.ghost, failed, "Batch had no usable rows");
        return Ok(summary);
    }

    let resolution = resolve_duplicates(db, candidates).await?;
    summary.duplicates = resolution.duplicates.len();
    errors.extend(duplicate_errors(&resolution.duplicates)?);

    let failed = errors.len() as i64;
    storage::insert_import_errors(db, job_id, errors).await?;
    storage::increment_job_counters(db, job_id, 0, failed).await?;

    let inserted = storage::insert_pending_records(db, job_id, &resolution.accepted).await?;
    summary.inserted = inserted;

    if (inserted as usize) < resolution.accepted.len() {
        // Another ingestion claimed some emails between the lookup and the
        // insert. Those rows are duplicates too.
        let skipped = skipped_by_race(db, job_id, &resolution.accepted).await?;
        warn!(
            job_id,
            skipped = skipped.len(),
            "Emails claimed concurrently, recording as duplicates"
        );
        summary.duplicates += skipped.len();
        let raced = skipped.len() as i64;
        storage::insert_import_errors(db, job_id, duplicate_errors(&skipped)?).await?;
        storage::increment_job_counters(db, job_id, 0, raced).await?;
    }

    info!(
        job_id,
        received = summary.received,
        inserted = summary.inserted,
        rejected = summary.rejected(),
        "Ingested batch"
    );

    Ok(summary)
}

async fn skipped_by_race(
    db: &DatabaseConnection,
    job_id: i64,
    accepted: &[CandidateRow],
) -> Result<Vec<CandidateRow>, PipelineError> {
    let emails: Vec<String> = accepted.iter().map(|c| c.email.clone()).collect();
    let owned = storage::emails_owned_by_job(db, job_id, &emails).await?;

    Ok(accepted
        .iter()
        .filter(|c| !owned.contains(&c.email))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, email: &str) -> CandidateRow {
        CandidateRow {
            name: name.to_string(),
            email: email.to_string(),
            company: "Co".to_string(),
        }
    }

    #[test]
    fn test_first_occurrence_wins() {
        let resolution = partition_duplicates(
            vec![
                candidate("A", "a@x.com"),
                candidate("B", "a@x.com"),
                candidate("C", "c@x.com"),
                candidate("D", "a@x.com"),
            ],
            HashSet::new(),
        );

        let accepted: Vec<&str> = resolution.accepted.iter().map(|c| c.name.as_str()).collect();
        let duplicates: Vec<&str> = resolution.duplicates.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(accepted, vec!["A", "C"]);
        assert_eq!(duplicates, vec!["B", "D"]);
    }

    #[test]
    fn test_known_emails_are_duplicates() {
        let known: HashSet<String> = ["a@x.com".to_string()].into_iter().collect();

        let resolution = partition_duplicates(
            vec![candidate("A", "a@x.com"), candidate("B", "b@x.com")],
            known,
        );

        assert_eq!(resolution.accepted, vec![candidate("B", "b@x.com")]);
        assert_eq!(resolution.duplicates, vec![candidate("A", "a@x.com")]);
    }

    #[test]
    fn test_summary_rejected() {
        let summary = IngestSummary {
            received: 5,
            ghost: 1,
            missing_email: 1,
            duplicates: 2,
            inserted: 1,
        };
        assert_eq!(summary.rejected(), 3);
    }
}
