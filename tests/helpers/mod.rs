pub mod builders;
pub mod db;
pub mod mock_api;

pub use builders::{row, CsvFileBuilder};
pub use db::{fast_import_settings, test_pipeline, test_pipeline_with_api, TestDb};
pub use mock_api::ScriptedApi;
