use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub database: Database,
    pub import: Import,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Largest request body accepted by `POST /imports/stream`
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// SeaORM/SQLx connection string
    /// Examples:
    /// - sqlite://tributary.db?mode=rwc
    /// - sqlite:///var/lib/tributary/imports.db?mode=rwc
    pub url: String,
}

/// Tuning for the import pipeline. The rate limit models the downstream
/// API budget: a burst of `rate_limit_capacity` calls, refilled at
/// `rate_limit_refill_per_sec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_sec: f64,
    /// Rows per ingestion chunk when streaming a file
    pub ingest_chunk_size: usize,
    /// Pending records drained per processing batch
    pub process_batch_size: u64,
    pub max_retries: u32,
    /// First backoff step; doubles on each further attempt
    pub backoff_base_ms: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://tributary.db?mode=rwc".to_string(),
        }
    }
}

impl Default for Import {
    fn default() -> Self {
        Self {
            rate_limit_capacity: 4.0,
            rate_limit_refill_per_sec: 2.0,
            ingest_chunk_size: 500,
            process_batch_size: 50,
            max_retries: 5,
            backoff_base_ms: 1000,
        }
    }
}

impl Import {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let import = Import::default();
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default(
                "server.max_upload_bytes",
                Server::default().max_upload_bytes as u64,
            )
            .into_diagnostic()?
            .set_default("database.url", Database::default().url)
            .into_diagnostic()?
            .set_default("import.rate_limit_capacity", import.rate_limit_capacity)
            .into_diagnostic()?
            .set_default(
                "import.rate_limit_refill_per_sec",
                import.rate_limit_refill_per_sec,
            )
            .into_diagnostic()?
            .set_default("import.ingest_chunk_size", import.ingest_chunk_size as u64)
            .into_diagnostic()?
            .set_default("import.process_batch_size", import.process_batch_size)
            .into_diagnostic()?
            .set_default("import.max_retries", import.max_retries)
            .into_diagnostic()?
            .set_default("import.backoff_base_ms", import.backoff_base_ms)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: TRIBUTARY__IMPORT__MAX_RETRIES=3, etc.
        builder = builder.add_source(config::Environment::with_prefix("TRIBUTARY").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let s: Settings = cfg.try_deserialize().into_diagnostic()?;

        if s.import.rate_limit_capacity < 1.0 || s.import.rate_limit_refill_per_sec <= 0.0 {
            return Err(miette::miette!(
                "import rate limit needs capacity >= 1 and a positive refill rate"
            ));
        }
        if s.import.ingest_chunk_size == 0 || s.import.process_batch_size == 0 {
            return Err(miette::miette!("import batch sizes must be non-zero"));
        }

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_settings_load_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nonexistent.toml");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.max_upload_bytes, 64 * 1024 * 1024);
        assert_eq!(settings.database.url, "sqlite://tributary.db?mode=rwc");
        assert_eq!(settings.import.rate_limit_capacity, 4.0);
        assert_eq!(settings.import.rate_limit_refill_per_sec, 2.0);
        assert_eq!(settings.import.ingest_chunk_size, 500);
        assert_eq!(settings.import.process_batch_size, 50);
        assert_eq!(settings.import.max_retries, 5);
        assert_eq!(Import::default().backoff_base(), Duration::from_secs(1));
    }

    #[test]
    fn test_settings_load_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[server]
host = "127.0.0.1"
port = 9090

[database]
url = "sqlite://imports.db?mode=rwc"

[import]
rate_limit_capacity = 10
rate_limit_refill_per_sec = 5
process_batch_size = 20
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.database.url, "sqlite://imports.db?mode=rwc");
        assert_eq!(settings.import.rate_limit_capacity, 10.0);
        assert_eq!(settings.import.rate_limit_refill_per_sec, 5.0);
        assert_eq!(settings.import.process_batch_size, 20);
        // untouched keys keep their defaults
        assert_eq!(settings.import.ingest_chunk_size, 500);
        assert_eq!(settings.import.max_retries, 5);
    }

    #[test]
    fn test_settings_env_override() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[import]
backoff_base_ms = 1000
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        env::set_var("TRIBUTARY__IMPORT__BACKOFF_BASE_MS", "25");

        // Environment wins over the file
        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.import.backoff_base(), Duration::from_millis(25));

        env::remove_var("TRIBUTARY__IMPORT__BACKOFF_BASE_MS");
    }

    #[test]
    fn test_settings_rejects_zero_batch_size() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("bad.toml");
        fs::write(&config_path, "[import]\ningest_chunk_size = 0\n").expect("Failed to write config");

        assert!(Settings::load(config_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_listen_addr() {
        let mut settings = Settings::default();
        settings.server.host = "localhost".to_string();
        settings.server.port = 3000;

        assert_eq!(settings.listen_addr(), "localhost:3000");
    }
}
