//! Staging store: a short-lived tabular copy of the caller's upload inside
//! the `sales` schema. DDL comes from the Arrow schema; the derived columns
//! (address ids, chunk id) are added later by the phases that own them.

use anyhow::{bail, Context, Result};
use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{info, instrument, warn};

use crate::arrow_io::{self, Cell};
use crate::payload::IngestSettings;
use crate::schema::{qualified, quote_ident};

/// Keep well under the Postgres bind-parameter cap (65_535 per statement).
pub const MAX_BIND_PARAMS: usize = 65_000;

#[derive(Debug, Clone)]
pub struct StagingColumn {
    pub name: String,
    pub pg_type: String,
}

/// Create (or recreate) the upload's staging table from its Arrow schema.
#[instrument(skip(pool, schema, settings), fields(table = %settings.staging_table))]
pub async fn create_staging_table(
    pool: &PgPool,
    settings: &IngestSettings,
    schema: &SchemaRef,
) -> Result<()> {
    if schema.fields().is_empty() {
        bail!("upload schema has no columns");
    }
    let table = qualified(&settings.staging_table);
    let cols: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| {
            format!(
                "{} {}",
                quote_ident(f.name()),
                arrow_io::pg_type_for(f.data_type())
            )
        })
        .collect();

    // Recreate from scratch so a previous failed ingest never leaks rows.
    sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(pool)
        .await?;
    sqlx::raw_sql(&format!("CREATE TABLE {table} ({})", cols.join(", ")))
        .execute(pool)
        .await
        .context("failed to create staging table")?;
    info!(columns = cols.len(), "staging table created");
    Ok(())
}

/// Bulk-insert Arrow batches into staging, batched under the param cap.
#[instrument(skip(pool, batches, settings), fields(table = %settings.staging_table))]
pub async fn ingest_batches(
    pool: &PgPool,
    settings: &IngestSettings,
    batches: &[RecordBatch],
) -> Result<u64> {
    let Some(first) = batches.first() else {
        warn!("upload contained no record batches");
        return Ok(0);
    };
    let table = qualified(&settings.staging_table);
    let col_names: Vec<String> = first
        .schema()
        .fields()
        .iter()
        .map(|f| quote_ident(f.name()))
        .collect();
    let ncols = col_names.len();
    let rows_per_stmt = (MAX_BIND_PARAMS / ncols).max(1);

    let mut pending: Vec<Vec<Cell>> = Vec::with_capacity(rows_per_stmt);
    let mut total: u64 = 0;
    for batch in batches {
        if batch.num_columns() != ncols {
            bail!("record batch column count changed mid-upload");
        }
        for row in 0..batch.num_rows() {
            let mut cells = Vec::with_capacity(ncols);
            for col in 0..ncols {
                cells.push(arrow_io::cell_at(batch.column(col).as_ref(), row)?);
            }
            pending.push(cells);
            if pending.len() >= rows_per_stmt {
                total += flush_rows(pool, &table, &col_names, &pending).await?;
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        total += flush_rows(pool, &table, &col_names, &pending).await?;
    }
    info!(rows = total, "staging ingest complete");
    Ok(total)
}

async fn flush_rows(
    pool: &PgPool,
    table: &str,
    col_names: &[String],
    rows: &[Vec<Cell>],
) -> Result<u64> {
    let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {table} ({}) ",
        col_names.join(", ")
    ));
    qb.push_values(rows, |mut b, row| {
        for cell in row {
            match cell {
                Cell::Null => {
                    b.push("NULL");
                }
                Cell::Text(v) => {
                    b.push_bind(v);
                }
                Cell::SmallInt(v) => {
                    b.push_bind(v);
                }
                Cell::Int(v) => {
                    b.push_bind(v);
                }
                Cell::BigInt(v) => {
                    b.push_bind(v);
                }
                Cell::Numeric(v) => {
                    b.push_bind(v);
                }
                Cell::Real(v) => {
                    b.push_bind(v);
                }
                Cell::Double(v) => {
                    b.push_bind(v);
                }
                Cell::Bool(v) => {
                    b.push_bind(v);
                }
            }
        }
    });
    let done = qb.build().persistent(false).execute(pool).await?;
    Ok(done.rows_affected())
}

/// Intermediate cleanup: rows whose order key is null or whitespace-only
/// carry nothing the pipeline can attribute; drop them before planning.
#[instrument(skip(pool, settings), fields(table = %settings.staging_table))]
pub async fn delete_blank_orders(pool: &PgPool, settings: &IngestSettings) -> Result<u64> {
    let table = qualified(&settings.staging_table);
    let col = quote_ident(settings.order_num_column());
    let done = sqlx::query(&format!(
        "DELETE FROM {table} WHERE {col} IS NULL OR btrim({col}::text) = ''"
    ))
    .persistent(false)
    .execute(pool)
    .await?;
    if done.rows_affected() > 0 {
        info!(rows = done.rows_affected(), "deleted blank-order rows");
    }
    Ok(done.rows_affected())
}

/// Current staging columns with their Postgres types, in ordinal order.
pub async fn staging_columns(
    executor: impl sqlx::PgExecutor<'_>,
    staging_table: &str,
) -> Result<Vec<StagingColumn>> {
    let rows = sqlx::query(
        "SELECT column_name, data_type
         FROM information_schema.columns
         WHERE table_schema = 'sales' AND table_name = $1
         ORDER BY ordinal_position",
    )
    .persistent(false)
    .bind(staging_table)
    .fetch_all(executor)
    .await?;
    if rows.is_empty() {
        bail!("staging table sales.{staging_table} does not exist");
    }
    Ok(rows
        .into_iter()
        .map(|r| StagingColumn {
            name: r.get::<String, _>(0),
            pg_type: r.get::<String, _>(1),
        })
        .collect())
}

/// Add a derived column if it is not there yet.
pub async fn ensure_column(
    pool: &PgPool,
    staging_table: &str,
    column: &str,
    pg_type: &str,
) -> Result<()> {
    let table = qualified(staging_table);
    sqlx::raw_sql(&format!(
        "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {pg_type}",
        quote_ident(column)
    ))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn row_count(pool: &PgPool, staging_table: &str) -> Result<i64> {
    let table = qualified(staging_table);
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .persistent(false)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_per_statement_respects_param_cap() {
        let ncols = 12usize;
        let rows = (MAX_BIND_PARAMS / ncols).max(1);
        assert!(rows * ncols <= MAX_BIND_PARAMS);
        // degenerate wide table still makes progress
        assert_eq!((MAX_BIND_PARAMS / 70_000usize).max(1), 1);
    }
}
