use crate::config::DbConfig;
use crate::storage::entity::{harvest_run, journal, publication, publication_metadata};
use log::info;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Schema,
    Statement,
};
use std::time::Duration;

pub async fn establish_connection(config: &DbConfig) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(config.url.to_owned());
    opt.connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    if config.is_in_memory() {
        // every pooled connection would otherwise open its own empty database
        opt.max_connections(1).min_connections(1);
    } else {
        opt.max_connections(config.max_connections.max(1))
            .min_connections(1)
            .idle_timeout(Duration::from_secs(300));
    }

    let db = Database::connect(opt).await?;

    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA foreign_keys=ON;".to_string(),
        ))
        .await?;
    }

    create_schema(&db).await?;

    info!("Database connection established and schema initialised.");

    Ok(db)
}

/// Creates tables and indexes if they do not exist yet.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    db.execute(builder.build(schema.create_table_from_entity(journal::Entity).if_not_exists()))
        .await?;
    db.execute(
        builder.build(
            schema
                .create_table_from_entity(harvest_run::Entity)
                .if_not_exists(),
        ),
    )
    .await?;
    db.execute(
        builder.build(
            schema
                .create_table_from_entity(publication::Entity)
                .if_not_exists(),
        ),
    )
    .await?;
    db.execute(
        builder.build(
            schema
                .create_table_from_entity(publication_metadata::Entity)
                .if_not_exists(),
        ),
    )
    .await?;

    let indexes = [
        // at most one running harvest per journal, enforced by the store itself
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_harvest_runs_one_running ON harvest_runs(journal_id) WHERE status = 'running';",
        "CREATE INDEX IF NOT EXISTS idx_harvest_runs_journal_status ON harvest_runs(journal_id, status);",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_oai_key ON publications(journal_id, oai_identifier);",
        "CREATE INDEX IF NOT EXISTS idx_publications_issued ON publications(issued);",
        "CREATE INDEX IF NOT EXISTS idx_publications_issued_year ON publications(issued_year);",
        "CREATE INDEX IF NOT EXISTS idx_publication_metadata_group ON publication_metadata(publication_id, schema, element, qualifier);",
        "CREATE INDEX IF NOT EXISTS idx_publication_metadata_element ON publication_metadata(schema, element, qualifier);",
    ];
    for sql in indexes {
        db.execute(Statement::from_string(builder, sql.to_string()))
            .await?;
    }

    Ok(())
}
