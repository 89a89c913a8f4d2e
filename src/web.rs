//! HTTP endpoints over the import pipeline. Handlers stay thin: parse the
//! request, call the pipeline or storage, shape the JSON reply.
use crate::errors::PipelineError;
use crate::pipeline::ImportPipeline;
use crate::rate_limiter::RateLimiter;
use crate::settings::Settings;
use crate::source;
use crate::storage::{self, NewRecord};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::json;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: ImportPipeline,
}

#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub company: String,
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.settings.server.max_upload_bytes;

    Router::new()
        .route(
            "/imports",
            get(list_imports).post(create_import).delete(clear_imports),
        )
        .route(
            "/imports/stream",
            post(create_stream_import).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/imports/{id}", get(get_import))
        .route("/imports/{id}/cancel", post(cancel_import))
        .route("/records", post(create_record))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let limiter = Arc::new(RateLimiter::from_settings(&settings.import));
    let pipeline = ImportPipeline::new(db, limiter, &settings.import);

    let resumed = pipeline.resume_interrupted().await?;
    tracing::info!(?resumed, "Startup recovery done");

    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let state = AppState {
        settings: Arc::new(settings),
        pipeline,
    };
    let router = router(state);

    tracing::info!(%addr, "Import API listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

fn is_csv(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/csv"))
        .unwrap_or(false)
}

async fn create_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, PipelineError> {
    let rows = if is_csv(&headers) {
        source::read_csv_rows(&body[..])?
    } else {
        source::parse_json_rows(&body)?
    };
    if rows.is_empty() {
        return Err(PipelineError::BadRequest("No records provided".to_string()));
    }

    let job = state.pipeline.submit_batch(rows).await?;
    tracing::info!(job_id = job.id, total = job.total_records, "Import accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "job_id": job.id,
            "message": "Import started",
        })),
    ))
}

/// Stream-mode import of a CSV request body. The body is spooled to a temp
/// file and read back in chunks, so the total is only known once ingestion
/// ends.
async fn create_stream_import(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, PipelineError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(PipelineError::BadRequest("No records provided".to_string()));
    }

    let file = tokio::task::spawn_blocking(move || spool(&body)).await??;
    let job = state.pipeline.submit_upload(file).await?;
    tracing::info!(job_id = job.id, "Stream import accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "job_id": job.id,
            "message": "Import started",
        })),
    ))
}

fn spool(body: &[u8]) -> Result<TempPath, PipelineError> {
    let mut file = NamedTempFile::new()?;
    file.write_all(body)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

async fn list_imports(State(state): State<AppState>) -> Result<impl IntoResponse, PipelineError> {
    let jobs = storage::list_jobs(state.pipeline.db()).await?;
    Ok(Json(json!({ "success": true, "data": jobs })))
}

async fn get_import(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, PipelineError> {
    let job = storage::get_job_with_errors(state.pipeline.db(), id)
        .await?
        .ok_or(PipelineError::JobNotFound(id))?;
    Ok(Json(json!({ "success": true, "data": job })))
}

async fn cancel_import(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, PipelineError> {
    let job = storage::get_job(state.pipeline.db(), id)
        .await?
        .ok_or(PipelineError::JobNotFound(id))?;

    if !state.pipeline.cancel(job.id) {
        return Err(PipelineError::Conflict(format!(
            "Import job {} is not running",
            job.id
        )));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "job_id": job.id,
            "message": "Cancellation requested",
        })),
    ))
}

async fn clear_imports(State(state): State<AppState>) -> Result<impl IntoResponse, PipelineError> {
    let running = state.pipeline.running_jobs();
    if !running.is_empty() {
        return Err(PipelineError::Conflict(format!(
            "Imports still running: {:?}",
            running
        )));
    }

    let cleared = storage::clear_all(state.pipeline.db()).await?;
    tracing::info!(?cleared, "Cleared all imports");
    Ok(Json(json!({ "success": true, "data": cleared })))
}

async fn create_record(
    State(state): State<AppState>,
    Json(req): Json<CreateRecordRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let record = state
        .pipeline
        .create_record(NewRecord {
            name: req.name,
            email: req.email,
            company: req.company,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": record })),
    ))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
