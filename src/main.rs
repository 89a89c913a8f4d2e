use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use tributary::pipeline::ImportPipeline;
use tributary::rate_limiter::RateLimiter;
use tributary::{settings, source, storage, web};

#[derive(Parser, Debug)]
#[command(
    name = "tributary",
    version,
    about = "Bulk record import pipeline"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API (default)
    Serve,
    /// Import a file and wait for the job to finish
    Import {
        /// CSV file, or a JSON array when used with --batch
        file: PathBuf,

        /// Load the whole file in one pass instead of streaming it in chunks
        #[arg(long, default_value_t = false)]
        batch: bool,
    },
    /// Print the job history
    Jobs,
    /// Delete all records, import errors and jobs
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    let db = storage::init(&settings.database).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => web::serve(settings, db).await?,
        Commands::Import { file, batch } => {
            let limiter = Arc::new(RateLimiter::from_settings(&settings.import));
            let pipeline = ImportPipeline::new(db, limiter, &settings.import);

            let job = if batch {
                let rows = read_rows(&file)?;
                pipeline.submit_batch(rows).await?
            } else {
                pipeline.submit_stream(&file).await?
            };
            tracing::info!(job_id = job.id, file = %file.display(), "Import started");

            let done = pipeline.wait_for(job.id).await?;
            let errors = storage::count_import_errors(pipeline.db(), job.id, None).await?;
            println!(
                "job {} {:?}: total={} success={} failed={} errors={}",
                done.id, done.status, done.total_records, done.success_count, done.failed_count, errors
            );
        }
        Commands::Jobs => {
            let jobs = storage::list_jobs(&db).await?;
            println!("{}", serde_json::to_string_pretty(&jobs).into_diagnostic()?);
        }
        Commands::Clear => {
            let cleared = storage::clear_all(&db).await?;
            println!(
                "cleared {} records, {} errors, {} jobs",
                cleared.records, cleared.errors, cleared.jobs
            );
        }
    }

    Ok(())
}

fn read_rows(file: &Path) -> Result<Vec<tributary::normalizer::RawRow>> {
    let is_json = file
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        let body = std::fs::read(file).into_diagnostic()?;
        Ok(source::parse_json_rows(&body)?)
    } else {
        let reader = std::fs::File::open(file).into_diagnostic()?;
        Ok(source::read_csv_rows(reader)?)
    }
}
