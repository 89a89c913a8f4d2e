use crate::entities;
use crate::entities::import_job::JobStatus;
use crate::entities::record::RecordStatus;
use crate::errors::PipelineError;
use crate::normalizer::CandidateRow;
use crate::settings::Database as DbCfg;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TryInsertResult,
};
use sea_orm_migration::MigratorTrait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type ImportJob = entities::import_job::Model;
pub type Record = entities::record::Model;
pub type ImportError = entities::import_error::Model;

/// Email lookups are split so a large chunk never exceeds the bind limit.
const LOOKUP_CHUNK: usize = 500;

/// Rows per bulk insert statement. At 7 binds per record this stays far
/// below SQLite's 32766 variable limit.
const INSERT_CHUNK: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithErrors {
    #[serde(flatten)]
    pub job: ImportJob,
    pub errors: Vec<ImportError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewImportError {
    pub record_data: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub name: String,
    pub email: String,
    pub company: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedCounts {
    pub records: u64,
    pub errors: u64,
    pub jobs: u64,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PipelineError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

// Import job functions

pub async fn create_job(
    db: &DatabaseConnection,
    total_records: i64,
) -> Result<ImportJob, PipelineError> {
    let job = entities::import_job::ActiveModel {
        status: Set(JobStatus::Pending),
        total_records: Set(total_records),
        processed_count: Set(0),
        success_count: Set(0),
        failed_count: Set(0),
        created_at: Set(Utc::now().timestamp()),
        completed_at: Set(None),
        ingested_at: Set(None),
        ..Default::default()
    };

    Ok(job.insert(db).await?)
}

pub async fn get_job<C: ConnectionTrait>(
    db: &C,
    job_id: i64,
) -> Result<Option<ImportJob>, PipelineError> {
    Ok(entities::ImportJob::find_by_id(job_id).one(db).await?)
}

pub async fn get_job_with_errors(
    db: &DatabaseConnection,
    job_id: i64,
) -> Result<Option<JobWithErrors>, PipelineError> {
    use entities::import_error::Column;

    let Some(job) = get_job(db, job_id).await? else {
        return Ok(None);
    };

    let errors = entities::ImportError::find()
        .filter(Column::JobId.eq(job_id))
        .order_by_asc(Column::Id)
        .all(db)
        .await?;

    Ok(Some(JobWithErrors { job, errors }))
}

/// All jobs, most recent first.
pub async fn list_jobs(db: &DatabaseConnection) -> Result<Vec<ImportJob>, PipelineError> {
    use entities::import_job::Column;

    Ok(entities::ImportJob::find()
        .order_by_desc(Column::CreatedAt)
        .order_by_desc(Column::Id)
        .all(db)
        .await?)
}

pub async fn list_jobs_by_status(
    db: &DatabaseConnection,
    status: JobStatus,
) -> Result<Vec<ImportJob>, PipelineError> {
    use entities::import_job::Column;

    Ok(entities::ImportJob::find()
        .filter(Column::Status.eq(status))
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}

/// Move a non-terminal job to `processing`. Returns false when the job is
/// missing or already terminal.
pub async fn mark_job_processing(
    db: &DatabaseConnection,
    job_id: i64,
) -> Result<bool, PipelineError> {
    use entities::import_job::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(JobStatus::Processing))
        .filter(Column::Id.eq(job_id))
        .filter(Column::Status.is_not_in([JobStatus::Completed, JobStatus::Failed]))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Terminal transition. `completed_at` is written here and nowhere else, and
/// a job already in a terminal state is left untouched.
pub async fn finish_job(
    db: &DatabaseConnection,
    job_id: i64,
    status: JobStatus,
) -> Result<bool, PipelineError> {
    use entities::import_job::{Column, Entity};

    if !status.is_terminal() {
        return Err(PipelineError::Other(format!(
            "{:?} is not a terminal job status",
            status
        )));
    }

    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(status))
        .col_expr(Column::CompletedAt, Expr::value(Utc::now().timestamp()))
        .filter(Column::Id.eq(job_id))
        .filter(Column::Status.is_not_in([JobStatus::Completed, JobStatus::Failed]))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Atomic in-store increment; concurrent writers never lose updates.
pub async fn increment_job_counters<C: ConnectionTrait>(
    db: &C,
    job_id: i64,
    success: i64,
    failed: i64,
) -> Result<(), PipelineError> {
    use entities::import_job::{Column, Entity};

    if success == 0 && failed == 0 {
        return Ok(());
    }

    Entity::update_many()
        .col_expr(
            Column::SuccessCount,
            Expr::col(Column::SuccessCount).add(success),
        )
        .col_expr(Column::FailedCount, Expr::col(Column::FailedCount).add(failed))
        .col_expr(
            Column::ProcessedCount,
            Expr::col(Column::ProcessedCount).add(success + failed),
        )
        .filter(Column::Id.eq(job_id))
        .exec(db)
        .await?;

    Ok(())
}

/// Fix `total_records` once every row of the job is known. Settled rows are
/// all in `processed_count`, so the total is that plus whatever is still
/// pending. Holds before, during and after processing.
///
/// Also stamps `ingested_at`. A job without it never finished ingesting and
/// cannot be resumed.
pub async fn finalize_total_records(
    db: &DatabaseConnection,
    job_id: i64,
) -> Result<i64, PipelineError> {
    use entities::import_job::{Column, Entity};

    let job = get_job(db, job_id)
        .await?
        .ok_or(PipelineError::JobNotFound(job_id))?;
    let pending = count_records_for_job(db, job_id, Some(RecordStatus::Pending)).await? as i64;
    let total = pending + job.processed_count;

    Entity::update_many()
        .col_expr(Column::TotalRecords, Expr::value(total))
        .col_expr(Column::IngestedAt, Expr::value(Utc::now().timestamp()))
        .filter(Column::Id.eq(job_id))
        .exec(db)
        .await?;

    Ok(total)
}

// Record functions

/// Which of `emails` already belong to a stored record.
pub async fn existing_emails(
    db: &DatabaseConnection,
    emails: &[String],
) -> Result<HashSet<String>, PipelineError> {
    use entities::record::{Column, Entity};

    let mut found = HashSet::new();
    for chunk in emails.chunks(LOOKUP_CHUNK) {
        let rows: Vec<String> = Entity::find()
            .select_only()
            .column(Column::Email)
            .filter(Column::Email.is_in(chunk.iter().cloned()))
            .into_tuple()
            .all(db)
            .await?;
        found.extend(rows);
    }

    Ok(found)
}

/// Bulk insert `pending` records for a job. Rows whose email is already
/// taken are skipped by the store. Returns how many rows were inserted.
pub async fn insert_pending_records(
    db: &DatabaseConnection,
    job_id: i64,
    rows: &[CandidateRow],
) -> Result<u64, PipelineError> {
    use entities::record::{ActiveModel, Column, Entity};

    if rows.is_empty() {
        return Ok(0);
    }

    let now = Utc::now().timestamp();
    let mut inserted = 0;

    for chunk in rows.chunks(INSERT_CHUNK) {
        let models = chunk.iter().map(|row| ActiveModel {
            name: Set(row.name.clone()),
            email: Set(row.email.clone()),
            company: Set(row.company.clone()),
            status: Set(RecordStatus::Pending),
            job_id: Set(Some(job_id)),
            response: Set(None),
            created_at: Set(now),
            ..Default::default()
        });

        let result = Entity::insert_many(models)
            .on_conflict(OnConflict::column(Column::Email).do_nothing().to_owned())
            .do_nothing()
            .exec_without_returning(db)
            .await?;

        inserted += match result {
            TryInsertResult::Inserted(count) => count,
            TryInsertResult::Empty | TryInsertResult::Conflicted => 0,
        };
    }

    Ok(inserted)
}

/// Subset of `emails` whose stored record belongs to `job_id`.
pub async fn emails_owned_by_job(
    db: &DatabaseConnection,
    job_id: i64,
    emails: &[String],
) -> Result<HashSet<String>, PipelineError> {
    use entities::record::{Column, Entity};

    let mut owned = HashSet::new();
    for chunk in emails.chunks(LOOKUP_CHUNK) {
        let rows: Vec<String> = Entity::find()
            .select_only()
            .column(Column::Email)
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Email.is_in(chunk.iter().cloned()))
            .into_tuple()
            .all(db)
            .await?;
        owned.extend(rows);
    }

    Ok(owned)
}

pub async fn fetch_pending_records(
    db: &DatabaseConnection,
    job_id: i64,
    limit: u64,
) -> Result<Vec<Record>, PipelineError> {
    use entities::record::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::JobId.eq(job_id))
        .filter(Column::Status.eq(RecordStatus::Pending))
        .limit(limit)
        .all(db)
        .await?)
}

/// Persist the outcome of one processed record. Only a `pending` row is
/// updated; finished records are never reverted.
pub async fn save_record_outcome<C: ConnectionTrait>(
    db: &C,
    record_id: i64,
    status: RecordStatus,
    response: &str,
) -> Result<bool, PipelineError> {
    use entities::record::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(status))
        .col_expr(Column::Response, Expr::value(response.to_string()))
        .filter(Column::Id.eq(record_id))
        .filter(Column::Status.eq(RecordStatus::Pending))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

pub async fn count_records_for_job(
    db: &DatabaseConnection,
    job_id: i64,
    status: Option<RecordStatus>,
) -> Result<u64, PipelineError> {
    use entities::record::{Column, Entity};

    let mut query = Entity::find().filter(Column::JobId.eq(job_id));
    if let Some(status) = status {
        query = query.filter(Column::Status.eq(status));
    }

    Ok(query.count(db).await?)
}

pub async fn get_record_by_email(
    db: &DatabaseConnection,
    email: &str,
) -> Result<Option<Record>, PipelineError> {
    use entities::record::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Email.eq(email))
        .one(db)
        .await?)
}

/// Create a record outside of any import job.
pub async fn create_record(
    db: &DatabaseConnection,
    input: NewRecord,
    response: Option<String>,
) -> Result<Record, PipelineError> {
    let record = entities::record::ActiveModel {
        name: Set(input.name),
        email: Set(input.email),
        company: Set(input.company),
        status: Set(RecordStatus::Success),
        job_id: Set(None),
        response: Set(response),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    };

    Ok(record.insert(db).await?)
}

// Import error functions

pub async fn insert_import_errors<C: ConnectionTrait>(
    db: &C,
    job_id: i64,
    errors: Vec<NewImportError>,
) -> Result<(), PipelineError> {
    use entities::import_error::{ActiveModel, Entity};

    if errors.is_empty() {
        return Ok(());
    }

    let now = Utc::now().timestamp();
    let mut errors = errors.into_iter().peekable();

    while errors.peek().is_some() {
        let models: Vec<ActiveModel> = errors
            .by_ref()
            .take(INSERT_CHUNK)
            .map(|e| ActiveModel {
                job_id: Set(job_id),
                record_data: Set(e.record_data),
                error_message: Set(e.error_message),
                created_at: Set(now),
                ..Default::default()
            })
            .collect();

        Entity::insert_many(models).exec_without_returning(db).await?;
    }
    Ok(())
}

pub async fn count_import_errors(
    db: &DatabaseConnection,
    job_id: i64,
    message: Option<&str>,
) -> Result<u64, PipelineError> {
    use entities::import_error::{Column, Entity};

    let mut query = Entity::find().filter(Column::JobId.eq(job_id));
    if let Some(message) = message {
        query = query.filter(Column::ErrorMessage.eq(message));
    }

    Ok(query.count(db).await?)
}

/// Remove every record, import error and job.
pub async fn clear_all(db: &DatabaseConnection) -> Result<ClearedCounts, PipelineError> {
    let errors = entities::ImportError::delete_many().exec(db).await?;
    let records = entities::Record::delete_many().exec(db).await?;
    let jobs = entities::ImportJob::delete_many().exec(db).await?;

    Ok(ClearedCounts {
        records: records.rows_affected,
        errors: errors.rows_affected,
        jobs: jobs.rows_affected,
    })
}
