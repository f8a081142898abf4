//! Schema migrations for the Postgres store.
//!
//! Applied on startup before the import routes accept traffic; startup
//! aborts if the recorded migrations drifted from the embedded ones.

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    log::info!("checking import schema migrations");
    MIGRATOR.run(pool).await?;
    log::info!("import schema up to date");
    Ok(())
}
