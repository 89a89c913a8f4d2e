//! Entry points of the import pipeline. Each job runs as one supervised
//! task: ingest, finalize the total, then process. Any error escaping the
//! task moves the job to `failed`.

use crate::entities::import_job::JobStatus;
use crate::errors::PipelineError;
use crate::ingest;
use crate::normalizer::RawRow;
use crate::processor::{
    validate_fields, JobProcessor, ProcessOutcome, ProcessorConfig, RecordApi, RecordResponse,
    SimulatedApi,
};
use crate::rate_limiter::RateLimiter;
use crate::settings::Import;
use crate::source;
use crate::storage::{self, ImportJob, NewRecord, Record};
use parking_lot::Mutex;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where a job's rows come from.
#[derive(Debug)]
enum JobSource {
    Batch(Vec<RawRow>),
    Stream(PathBuf),
    /// Uploaded CSV spooled to a temp file, removed once the job ends.
    Upload(TempPath),
    /// Rows were ingested by an earlier run; only processing is left.
    Resume,
}

struct RunningJob {
    /// Distinguishes this run from a later run of the same job id.
    task: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeSummary {
    pub resumed: Vec<i64>,
    pub abandoned: Vec<i64>,
}

#[derive(Clone)]
pub struct ImportPipeline {
    db: DatabaseConnection,
    limiter: Arc<RateLimiter>,
    processor: Arc<JobProcessor>,
    chunk_size: usize,
    running: Arc<Mutex<HashMap<i64, RunningJob>>>,
    next_task: Arc<AtomicU64>,
}

impl ImportPipeline {
    /// Build a pipeline around the simulated downstream API.
    pub fn new(db: DatabaseConnection, limiter: Arc<RateLimiter>, cfg: &Import) -> Self {
        Self::with_api(db, limiter, Arc::new(SimulatedApi), cfg)
    }

    pub fn with_api(
        db: DatabaseConnection,
        limiter: Arc<RateLimiter>,
        api: Arc<dyn RecordApi>,
        cfg: &Import,
    ) -> Self {
        let processor = JobProcessor::new(
            db.clone(),
            limiter.clone(),
            api,
            ProcessorConfig::from(cfg),
        );

        Self {
            db,
            limiter,
            processor: Arc::new(processor),
            chunk_size: cfg.ingest_chunk_size.max(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_task: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// The limiter every record of every job draws from.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Ingest `rows` into an existing job in one pass, then process it.
    /// Returns once the background task is started.
    pub fn start_import_batch(&self, job_id: i64, rows: Vec<RawRow>) -> Result<(), PipelineError> {
        self.spawn(job_id, JobSource::Batch(rows))
    }

    /// Read a CSV file in chunks, ingest each chunk, finalize the total,
    /// then process. Returns once the background task is started.
    pub fn start_import_stream(
        &self,
        job_id: i64,
        path: impl Into<PathBuf>,
    ) -> Result<(), PipelineError> {
        self.spawn(job_id, JobSource::Stream(path.into()))
    }

    /// Create a job sized to `rows` and start it.
    pub async fn submit_batch(&self, rows: Vec<RawRow>) -> Result<ImportJob, PipelineError> {
        let job = storage::create_job(&self.db, rows.len() as i64).await?;
        self.start_import_batch(job.id, rows)?;
        Ok(job)
    }

    /// Create a job with an unknown total and stream `path` into it.
    pub async fn submit_stream(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<ImportJob, PipelineError> {
        let job = storage::create_job(&self.db, 0).await?;
        self.start_import_stream(job.id, path)?;
        Ok(job)
    }

    /// Create a job for an uploaded CSV body and stream it like a file.
    /// The temp file is deleted when the job finishes.
    pub async fn submit_upload(&self, file: TempPath) -> Result<ImportJob, PipelineError> {
        let job = storage::create_job(&self.db, 0).await?;
        self.spawn(job.id, JobSource::Upload(file))?;
        Ok(job)
    }

    fn spawn(&self, job_id: i64, source: JobSource) -> Result<(), PipelineError> {
        let mut running = self.running.lock();
        if running
            .get(&job_id)
            .is_some_and(|job| !job.handle.is_finished())
        {
            return Err(PipelineError::JobRunning(job_id));
        }
        // Entries of tasks that ended without untracking themselves (panics)
        running.retain(|_, job| !job.handle.is_finished());

        let task = self.next_task.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            this.supervise(job_id, task, source, token).await;
        });

        running.insert(
            job_id,
            RunningJob {
                task,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Error boundary around one job run.
    async fn supervise(&self, job_id: i64, task: u64, source: JobSource, cancel: CancellationToken) {
        match self.run(job_id, source, &cancel).await {
            Ok(outcome) => info!(job_id, ?outcome, "Import job finished"),
            Err(e) => {
                error!(job_id, error = %e, "Import job failed");
                if let Err(e) = storage::finish_job(&self.db, job_id, JobStatus::Failed).await {
                    error!(job_id, error = %e, "Failed to mark job as failed");
                }
            }
        }
        self.untrack(job_id, task);
    }

    /// Drop the registry entry of a finished run, unless the job id has
    /// since been taken by a newer run.
    fn untrack(&self, job_id: i64, task: u64) {
        let mut running = self.running.lock();
        if running.get(&job_id).is_some_and(|job| job.task == task) {
            running.remove(&job_id);
        }
    }

    async fn run(
        &self,
        job_id: i64,
        source: JobSource,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PipelineError> {
        if !storage::mark_job_processing(&self.db, job_id).await? {
            warn!(job_id, "Job missing or already finished, skipping");
            return Ok(ProcessOutcome::AlreadyFinished);
        }

        match source {
            JobSource::Batch(rows) => {
                ingest::ingest_batch(&self.db, job_id, &rows).await?;
            }
            JobSource::Stream(path) => {
                if !self.ingest_stream(job_id, path, cancel).await? {
                    storage::finish_job(&self.db, job_id, JobStatus::Failed).await?;
                    return Ok(ProcessOutcome::Cancelled);
                }
            }
            JobSource::Upload(file) => {
                if !self.ingest_stream(job_id, file.to_path_buf(), cancel).await? {
                    storage::finish_job(&self.db, job_id, JobStatus::Failed).await?;
                    return Ok(ProcessOutcome::Cancelled);
                }
            }
            JobSource::Resume => {}
        }

        let total = storage::finalize_total_records(&self.db, job_id).await?;
        info!(job_id, total, "Total records finalized");

        self.processor.process(job_id, cancel).await
    }

    /// Returns false when cancelled between chunks.
    async fn ingest_stream(
        &self,
        job_id: i64,
        path: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<bool, PipelineError> {
        info!(job_id, path = %path.display(), chunk_size = self.chunk_size, "Streaming import");
        let mut chunks = source::stream_csv_chunks(path, self.chunk_size);
        let mut rows = 0usize;

        while let Some(chunk) = chunks.recv().await {
            if cancel.is_cancelled() {
                warn!(job_id, rows, "Import cancelled during ingestion");
                return Ok(false);
            }
            let chunk = chunk?;
            rows += chunk.len();
            ingest::ingest_batch(&self.db, job_id, &chunk).await?;
        }

        info!(job_id, rows, "Stream ingested");
        Ok(true)
    }

    /// Ask a running job to stop at its next batch boundary. Returns false
    /// when the job is not running.
    pub fn cancel(&self, job_id: i64) -> bool {
        let running = self.running.lock();
        match running.get(&job_id) {
            Some(job) if !job.handle.is_finished() => {
                job.cancel.cancel();
                info!(job_id, "Cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Ids of jobs whose task has not finished yet.
    pub fn running_jobs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .running
            .lock()
            .iter()
            .filter(|(_, job)| !job.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_running(&self, job_id: i64) -> bool {
        self.running
            .lock()
            .get(&job_id)
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Wait for the job's task, if any, then return the stored job.
    pub async fn wait_for(&self, job_id: i64) -> Result<ImportJob, PipelineError> {
        let job = self.running.lock().remove(&job_id);
        if let Some(job) = job {
            job.handle.await?;
        }

        storage::get_job(&self.db, job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))
    }

    /// Wait until every started job has finished.
    pub async fn wait_all(&self) -> Result<(), PipelineError> {
        loop {
            let jobs: Vec<RunningJob> = {
                let mut running = self.running.lock();
                running.drain().map(|(_, job)| job).collect()
            };
            if jobs.is_empty() {
                return Ok(());
            }
            for job in jobs {
                job.handle.await?;
            }
        }
    }

    /// Create one record outside any job. Spends a token from the shared
    /// limiter before anything else, then validates and stores it.
    pub async fn create_record(&self, input: NewRecord) -> Result<Record, PipelineError> {
        if !self.limiter.can_process() {
            return Err(PipelineError::RateLimited {
                retry_after: self.limiter.retry_after_secs(),
            });
        }

        let input = NewRecord {
            name: input.name.trim().to_string(),
            email: input.email.trim().to_lowercase(),
            company: input.company.trim().to_string(),
        };
        validate_fields(&input.name, &input.email, &input.company)
            .map_err(PipelineError::BadRequest)?;

        let response = serde_json::to_string(&RecordResponse::success("Record created"))?;
        match storage::create_record(&self.db, input, Some(response)).await {
            Err(PipelineError::Db(e))
                if matches!(e.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) =>
            {
                Err(PipelineError::Conflict("Record already exists".to_string()))
            }
            other => other,
        }
    }

    /// Pick up work left behind by a previous process. A `processing` job
    /// whose ingestion finished is processed again from its stored rows.
    /// One interrupted mid-ingestion has lost the rest of its input, as has
    /// any job still `pending`, so both are failed.
    pub async fn resume_interrupted(&self) -> Result<ResumeSummary, PipelineError> {
        let mut summary = ResumeSummary::default();

        for job in storage::list_jobs_by_status(&self.db, JobStatus::Pending).await? {
            if self.is_running(job.id) {
                continue;
            }
            storage::finish_job(&self.db, job.id, JobStatus::Failed).await?;
            summary.abandoned.push(job.id);
        }

        for job in storage::list_jobs_by_status(&self.db, JobStatus::Processing).await? {
            if self.is_running(job.id) {
                continue;
            }
            if job.ingested_at.is_none() {
                warn!(job_id = job.id, "Job was interrupted during ingestion");
                storage::finish_job(&self.db, job.id, JobStatus::Failed).await?;
                summary.abandoned.push(job.id);
                continue;
            }
            self.spawn(job.id, JobSource::Resume)?;
            summary.resumed.push(job.id);
        }

        if !summary.resumed.is_empty() || !summary.abandoned.is_empty() {
            info!(
                resumed = summary.resumed.len(),
                abandoned = summary.abandoned.len(),
                "Recovered interrupted imports"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct TestDb {
        connection: DatabaseConnection,
        _temp_file: NamedTempFile,
    }

    impl TestDb {
        async fn new() -> Self {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_path = temp_file.path().to_str().expect("Invalid temp file path");
            let db_url = format!("sqlite://{}?mode=rwc", db_path);

            let connection = Database::connect(&db_url)
                .await
                .expect("Failed to connect to test database");
            migration::Migrator::up(&connection, None)
                .await
                .expect("Failed to run migrations");

            Self {
                connection,
                _temp_file: temp_file,
            }
        }
    }

    fn fast_pipeline(db: &DatabaseConnection) -> ImportPipeline {
        let cfg = Import {
            backoff_base_ms: 1,
            ..Default::default()
        };
        ImportPipeline::new(
            db.clone(),
            Arc::new(RateLimiter::new(1_000_000.0, 1_000_000.0)),
            &cfg,
        )
    }

    fn person(email: &str) -> RawRow {
        let Value::Object(map) = json!({"name": "Ada", "email": email, "company": "Engines"}) else {
            unreachable!()
        };
        map
    }

    async fn until_untracked(pipeline: &ImportPipeline) {
        for _ in 0..500 {
            if pipeline.running.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("finished jobs are still tracked");
    }

    #[tokio::test]
    async fn test_finished_jobs_leave_the_registry() {
        let test_db = TestDb::new().await;
        let pipeline = fast_pipeline(&test_db.connection);

        let mut ids = Vec::new();
        for i in 0..20 {
            let job = pipeline
                .submit_batch(vec![person(&format!("p{i}@x.com"))])
                .await
                .expect("submit failed");
            ids.push(job.id);
        }

        // Nobody calls wait_for here, as with jobs started over HTTP
        until_untracked(&pipeline).await;

        for id in ids {
            let job = storage::get_job(&test_db.connection, id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert!(pipeline.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_stale_run_keeps_newer_entry() {
        let test_db = TestDb::new().await;
        let pipeline = fast_pipeline(&test_db.connection);

        let newer = RunningJob {
            task: 7,
            cancel: CancellationToken::new(),
            handle: tokio::spawn(std::future::pending::<()>()),
        };
        pipeline.running.lock().insert(1, newer);

        pipeline.untrack(1, 3);
        assert!(pipeline.is_running(1));

        pipeline.untrack(1, 7);
        assert!(!pipeline.is_running(1));
        assert!(pipeline.running.lock().is_empty());
    }
}
