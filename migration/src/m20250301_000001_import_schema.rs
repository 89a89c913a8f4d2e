use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        let backend = manager.get_database_backend();

        // Create import_jobs table
        manager
            .create_table(
                Table::create()
                    .table(ImportJobs::Table)
                    .if_not_exists()
                    .col(id_column(backend, ImportJobs::Id))
                    .col(
                        ColumnDef::new(ImportJobs::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ImportJobs::TotalRecords)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ImportJobs::ProcessedCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ImportJobs::SuccessCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ImportJobs::FailedCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(ImportJobs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create records table; email is the natural key for duplicate detection
        manager
            .create_table(
                Table::create()
                    .table(Records::Table)
                    .if_not_exists()
                    .col(id_column(backend, Records::Id))
                    .col(string(Records::Name))
                    .col(ColumnDef::new(Records::Email).string().not_null().unique_key())
                    .col(string(Records::Company))
                    .col(
                        ColumnDef::new(Records::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(big_integer_null(Records::JobId))
                    .col(text_null(Records::Response))
                    .col(big_integer(Records::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_records_job")
                            .from(Records::Table, Records::JobId)
                            .to(ImportJobs::Table, ImportJobs::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // The processor drains pending rows per job
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_records_job_status")
                    .table(Records::Table)
                    .col(Records::JobId)
                    .col(Records::Status)
                    .to_owned(),
            )
            .await?;

        // Create import_errors table
        manager
            .create_table(
                Table::create()
                    .table(ImportErrors::Table)
                    .if_not_exists()
                    .col(id_column(backend, ImportErrors::Id))
                    .col(big_integer(ImportErrors::JobId))
                    .col(text(ImportErrors::RecordData))
                    .col(string(ImportErrors::ErrorMessage))
                    .col(big_integer(ImportErrors::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_import_errors_job")
                            .from(ImportErrors::Table, ImportErrors::JobId)
                            .to(ImportJobs::Table, ImportJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_import_errors_job_id")
                    .table(ImportErrors::Table)
                    .col(ImportErrors::JobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ImportErrors::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Records::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ImportJobs::Table).to_owned())
            .await
    }
}

/// SQLite only autoincrements `INTEGER PRIMARY KEY`, Postgres wants a bigint.
fn id_column<T: IntoIden>(backend: sea_orm::DatabaseBackend, iden: T) -> ColumnDef {
    let mut col = ColumnDef::new(iden);
    match backend {
        sea_orm::DatabaseBackend::Postgres => col.big_integer(),
        _ => col.integer(),
    };
    col.not_null().auto_increment().primary_key().to_owned()
}

#[derive(DeriveIden)]
enum ImportJobs {
    Table,
    Id,
    Status,
    TotalRecords,
    ProcessedCount,
    SuccessCount,
    FailedCount,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Records {
    Table,
    Id,
    Name,
    Email,
    Company,
    Status,
    JobId,
    Response,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ImportErrors {
    Table,
    Id,
    JobId,
    RecordData,
    ErrorMessage,
    CreatedAt,
}
