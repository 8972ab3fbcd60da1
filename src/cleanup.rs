//! Staging teardown. Runs on both the success and failure paths, so it is
//! idempotent and never errors when the table is already gone.

use anyhow::Result;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use crate::payload::IngestSettings;
use crate::schema::{qualified, quote_ident, SCHEMA};

#[instrument(skip(pool, settings), fields(table = %settings.staging_table))]
pub async fn cleanup(pool: &PgPool, settings: &IngestSettings) -> Result<()> {
    let mut conn = pool.acquire().await?;
    sqlx::raw_sql("SET lock_timeout = '2s'; SET statement_timeout = '30s'")
        .execute(&mut *conn)
        .await?;

    let table = qualified(&settings.staging_table);
    sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
        .execute(&mut *conn)
        .await?;

    // Safety net: exact-name and prefixed siblings left behind by earlier
    // attempts against the same upload.
    let residuals = sqlx::query(
        "SELECT tablename FROM pg_tables \
         WHERE schemaname = $1 AND left(tablename, length($2)) = $2",
    )
    .persistent(false)
    .bind(SCHEMA)
    .bind(&settings.staging_table)
    .fetch_all(&mut *conn)
    .await?;
    for r in &residuals {
        let name: String = r.get(0);
        sqlx::raw_sql(&format!(
            "DROP TABLE IF EXISTS {}.{} CASCADE",
            SCHEMA,
            quote_ident(&name)
        ))
        .execute(&mut *conn)
        .await?;
    }

    // Search-path residual without a schema qualifier.
    sqlx::raw_sql(&format!(
        "DROP TABLE IF EXISTS {} CASCADE",
        quote_ident(&settings.staging_table)
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::raw_sql("RESET lock_timeout; RESET statement_timeout")
        .execute(&mut *conn)
        .await?;
    info!(residuals = residuals.len(), "staging cleanup complete");
    Ok(())
}
