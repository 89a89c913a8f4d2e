//! Drains the pending records of a job through the rate-limited
//! downstream call and settles each one as `success` or `failed`.

use crate::entities::import_job::JobStatus;
use crate::entities::record::RecordStatus;
use crate::errors::PipelineError;
use crate::rate_limiter::RateLimiter;
use crate::settings::Import;
use crate::storage::{self, NewImportError, Record};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const SUCCESS_MESSAGE: &str = "Processed successfully";
pub const MAX_FIELD_LEN: usize = 255;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

/// Failure reported by the downstream API.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionError {
    /// HTTP-like status, when the failure carried one
    pub status: Option<u16>,
    /// Seconds the API asked us to wait before retrying
    pub retry_after: Option<u64>,
    pub message: String,
}

impl ExecutionError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    /// 429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self.status, Some(429) | Some(500..=599))
    }
}

/// The downstream call a record is submitted to.
#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn submit(&self, record: &Record) -> Result<String, ExecutionError>;
}

/// Stand-in for the external API. Accepts every well-formed record.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedApi;

#[async_trait]
impl RecordApi for SimulatedApi {
    async fn submit(&self, _record: &Record) -> Result<String, ExecutionError> {
        Ok(SUCCESS_MESSAGE.to_string())
    }
}

/// Payload stored in `records.response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl RecordResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email) && !email.contains("..")
}

fn check_text(field: &str, label: &str, value: &str, issues: &mut Vec<String>) {
    let len = value.chars().count();
    if len == 0 {
        issues.push(format!("{}: {} is required", field, label));
    } else if len > MAX_FIELD_LEN {
        issues.push(format!("{}: {} is too long", field, label));
    }
}

/// Schema check run before a record may spend a rate-limit token.
/// The error lists every failing field as `field: message`.
pub fn validate_fields(name: &str, email: &str, company: &str) -> Result<(), String> {
    let mut issues = Vec::new();

    check_text("name", "Name", name, &mut issues);
    if !is_valid_email(email) {
        issues.push("email: Invalid email format".to_string());
    }
    check_text("company", "Company", company, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues.join(", "))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: u64,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl From<&Import> for ProcessorConfig {
    fn from(cfg: &Import) -> Self {
        Self {
            batch_size: cfg.process_batch_size,
            max_retries: cfg.max_retries,
            backoff_base: cfg.backoff_base(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&Import::default())
    }
}

impl ProcessorConfig {
    /// `backoff_base * 2^(attempt - 1)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

/// How a `process` run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Cancelled,
    /// The job was already terminal; nothing was touched.
    AlreadyFinished,
}

/// Settled state of one record, held in memory until the batch flush.
#[derive(Debug, Clone)]
struct RecordOutcome {
    record_id: i64,
    status: RecordStatus,
    response: String,
    error: Option<NewImportError>,
}

/// Counter deltas for one batch, written with a single increment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchTally {
    pub success: i64,
    pub failed: i64,
}

impl BatchTally {
    fn count(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Success => self.success += 1,
            RecordStatus::Failed => self.failed += 1,
            RecordStatus::Pending => {}
        }
    }
}

pub struct JobProcessor {
    db: DatabaseConnection,
    limiter: Arc<RateLimiter>,
    api: Arc<dyn RecordApi>,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        db: DatabaseConnection,
        limiter: Arc<RateLimiter>,
        api: Arc<dyn RecordApi>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            db,
            limiter,
            api,
            config,
        }
    }

    /// Drain every pending record of `job_id` in batches, then complete the
    /// job. Cancellation is honoured between batches: the job is marked
    /// failed and its remaining records stay pending.
    pub async fn process(
        &self,
        job_id: i64,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PipelineError> {
        let job = storage::get_job(&self.db, job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))?;
        if job.status.is_terminal() || !storage::mark_job_processing(&self.db, job_id).await? {
            warn!(job_id, status = ?job.status, "Job already finished, not processing");
            return Ok(ProcessOutcome::AlreadyFinished);
        }

        info!(job_id, "Processing job");
        let mut batches = 0u64;

        loop {
            if cancel.is_cancelled() {
                storage::finish_job(&self.db, job_id, JobStatus::Failed).await?;
                warn!(job_id, batches, "Job cancelled");
                return Ok(ProcessOutcome::Cancelled);
            }

            let pending =
                storage::fetch_pending_records(&self.db, job_id, self.config.batch_size).await?;
            if pending.is_empty() {
                break;
            }

            // Sequential: the limiter is consulted in submission order
            let mut outcomes = Vec::with_capacity(pending.len());
            for record in &pending {
                outcomes.push(self.process_record(record).await?);
            }

            let tally = self.flush_batch(job_id, outcomes).await?;
            batches += 1;
            info!(
                job_id,
                batch = batches,
                success = tally.success,
                failed = tally.failed,
                "Processed batch"
            );
        }

        storage::finish_job(&self.db, job_id, JobStatus::Completed).await?;
        info!(job_id, batches, "Job completed");
        Ok(ProcessOutcome::Completed)
    }

    async fn process_record(&self, record: &Record) -> Result<RecordOutcome, PipelineError> {
        // Invalid records fail without spending a token
        if let Err(message) = validate_fields(&record.name, &record.email, &record.company) {
            return self.failed(record, message);
        }

        match self.execute_with_retry(record).await {
            Ok(message) => Ok(RecordOutcome {
                record_id: record.id,
                status: RecordStatus::Success,
                response: serde_json::to_string(&RecordResponse::success(message))?,
                error: None,
            }),
            Err(err) => self.failed(record, err.message),
        }
    }

    async fn execute_with_retry(&self, record: &Record) -> Result<String, ExecutionError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            match self.api.submit(record).await {
                Ok(message) => return Ok(message),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let wait = match err.retry_after {
                        Some(secs) => Duration::from_secs(secs),
                        None => self.config.backoff_for(attempt),
                    };
                    warn!(
                        record_id = record.id,
                        attempt,
                        status = ?err.status,
                        wait_ms = wait.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn failed(
        &self,
        record: &Record,
        message: String,
    ) -> Result<RecordOutcome, PipelineError> {
        let snapshot = serde_json::json!({
            "name": record.name,
            "email": record.email,
            "company": record.company,
        });

        Ok(RecordOutcome {
            record_id: record.id,
            status: RecordStatus::Failed,
            response: serde_json::to_string(&RecordResponse::failure(message.clone()))?,
            error: Some(NewImportError {
                record_data: snapshot.to_string(),
                error_message: message,
            }),
        })
    }

    /// Persist a batch in one transaction: record outcomes, then error rows,
    /// then one counter increment. A record that was no longer pending is
    /// neither logged nor counted.
    async fn flush_batch(
        &self,
        job_id: i64,
        outcomes: Vec<RecordOutcome>,
    ) -> Result<BatchTally, PipelineError> {
        let txn = self.db.begin().await?;
        let mut tally = BatchTally::default();
        let mut errors = Vec::new();

        for outcome in outcomes {
            let saved =
                storage::save_record_outcome(&txn, outcome.record_id, outcome.status, &outcome.response)
                    .await?;
            if !saved {
                continue;
            }
            tally.count(outcome.status);
            if let Some(error) = outcome.error {
                errors.push(error);
            }
        }

        storage::insert_import_errors(&txn, job_id, errors).await?;
        storage::increment_job_counters(&txn, job_id, tally.success, tally.failed).await?;
        txn.commit().await?;

        Ok(tally)
    }
}
