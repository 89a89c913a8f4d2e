pub use sea_orm_migration::prelude::*;

mod m20250301_000001_import_schema;
mod m20250308_000001_add_job_completed_at;
mod m20250315_000001_add_job_ingested_at;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_import_schema::Migration),
            Box::new(m20250308_000001_add_job_completed_at::Migration),
            Box::new(m20250315_000001_add_job_ingested_at::Migration),
        ]
    }
}
