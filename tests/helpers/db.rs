use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tributary::pipeline::ImportPipeline;
use tributary::processor::RecordApi;
use tributary::rate_limiter::RateLimiter;
use tributary::settings::Import;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Import settings with an effectively unlimited bucket and millisecond
/// backoff, so pipeline tests run at database speed.
pub fn fast_import_settings() -> Import {
    Import {
        rate_limit_capacity: 1_000_000.0,
        rate_limit_refill_per_sec: 1_000_000.0,
        backoff_base_ms: 1,
        ..Import::default()
    }
}

pub fn test_pipeline(db: &DatabaseConnection) -> ImportPipeline {
    let cfg = fast_import_settings();
    ImportPipeline::new(
        db.clone(),
        Arc::new(RateLimiter::from_settings(&cfg)),
        &cfg,
    )
}

pub fn test_pipeline_with_api(db: &DatabaseConnection, api: Arc<dyn RecordApi>) -> ImportPipeline {
    let cfg = fast_import_settings();
    ImportPipeline::with_api(
        db.clone(),
        Arc::new(RateLimiter::from_settings(&cfg)),
        api,
        &cfg,
    )
}
