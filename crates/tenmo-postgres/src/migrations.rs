//! Embedded schema migrations.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! tenmo_postgres::migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// Migrator with the queue and graph schema embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already-applied migrations are skipped.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
