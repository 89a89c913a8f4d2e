pub mod import_error;
pub mod import_job;
pub mod record;

pub use import_error::Entity as ImportError;
pub use import_job::Entity as ImportJob;
pub use record::Entity as Record;
