//! Per-upload one-shot setup, serialized by an advisory transaction lock.
//!
//! Creates the sales_batch entity, stores upload metadata as EAV, decides
//! which staging columns are transaction- vs line-item-scope attributes,
//! creates any missing attribute definitions, and records how this
//! tenant's headers map onto them. Everything happens in one transaction;
//! a concurrent attempt that cannot take the lock reports `Skipped`.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

use super::{ensure_attributes, insert_entities, upsert_eav, AttrDataType, AttributeDef, EavValue};
use crate::payload::{flatten_for_metadata, IngestSettings};
use crate::schema::{self, qualified, quote_ident};
use crate::staging;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreludeOutcome {
    Done {
        attributes: usize,
        metadata_values: usize,
    },
    /// Another attempt holds the per-upload lock and owns the setup.
    Skipped,
}

/// Per-column classification: scope entity type and attribute data type.
#[derive(Debug, Clone)]
pub struct ColumnClass {
    pub column: String,
    pub entity_type_id: i16,
    pub data_type: AttrDataType,
}

/// Columns whose value never varies within any order group belong to the
/// transaction; the rest belong to the line item.
pub fn classify(column: &str, pg_type: &str, always_constant: bool) -> ColumnClass {
    ColumnClass {
        column: column.to_string(),
        entity_type_id: if always_constant {
            schema::ENTITY_TYPE_TRANSACTION
        } else {
            schema::ENTITY_TYPE_LINE_ITEM
        },
        data_type: AttrDataType::from_pg_type(pg_type),
    }
}

#[instrument(skip(pool, settings), fields(upload = %settings.upload_id()))]
pub async fn eav_prelude(pool: &PgPool, settings: &IngestSettings) -> Result<PreludeOutcome> {
    let upload_id = settings.upload_id();
    let mut tx = pool.begin().await?;

    sqlx::raw_sql(
        "SET LOCAL lock_timeout = '2s';
         SET LOCAL statement_timeout = '5min';
         SET LOCAL idle_in_transaction_session_timeout = '1min'",
    )
    .execute(&mut *tx)
    .await?;

    let locked: bool =
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
            .persistent(false)
            .bind(upload_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
    if !locked {
        tx.rollback().await?;
        info!("prelude lock held elsewhere; skipping");
        return Ok(PreludeOutcome::Skipped);
    }

    // 1. sales_batch root entity, id = upload_id verbatim.
    insert_entities(
        &mut tx,
        &[(upload_id, schema::ENTITY_TYPE_SALES_BATCH, None)],
    )
    .await?;

    // 2. flatten the caller's payload into string metadata on the batch.
    let payload_json =
        serde_json::to_value(&settings.payload).context("failed to serialize payload")?;
    let flat = flatten_for_metadata(&payload_json);
    let meta_defs: Vec<AttributeDef> = flat
        .keys()
        .map(|k| AttributeDef {
            entity_type_id: schema::ENTITY_TYPE_SALES_BATCH,
            name: k.clone(),
            data_type: AttrDataType::String,
            description: None,
        })
        .collect();
    let meta_ids = ensure_attributes(&mut tx, &meta_defs).await?;
    let mut meta_values = Vec::with_capacity(flat.len());
    for (key, value) in &flat {
        let attr = meta_ids
            .get(&(
                schema::ENTITY_TYPE_SALES_BATCH,
                key.clone(),
                AttrDataType::String,
            ))
            .copied()
            .with_context(|| format!("metadata attribute {key} missing after ensure"))?;
        meta_values.push(EavValue::string(upload_id, attr, value.clone()));
    }
    upsert_eav(&mut tx, &meta_values).await?;

    // 3. classify staging columns by per-order constancy.
    let classes = classify_staging_columns(&mut tx, settings).await?;

    // 4. create missing transaction/line-item attributes.
    let defs: Vec<AttributeDef> = classes
        .iter()
        .map(|c| AttributeDef {
            entity_type_id: c.entity_type_id,
            name: c.column.clone(),
            data_type: c.data_type,
            description: None,
        })
        .collect();
    let attr_ids = ensure_attributes(&mut tx, &defs).await?;

    // 5. remember this tenant's header mappings.
    record_header_mappings(&mut tx, settings, &classes, &attr_ids).await?;

    let attributes = defs.len();
    let metadata_values = meta_values.len();
    tx.commit().await?;
    info!(attributes, metadata_values, "prelude complete");
    Ok(PreludeOutcome::Done {
        attributes,
        metadata_values,
    })
}

/// Evaluate the always-constant predicate for every staging column and
/// classify it. The chunk id column does not exist yet at prelude time;
/// the backfilled address-id columns do and are classified like the rest.
pub(crate) async fn classify_staging_columns(
    conn: &mut PgConnection,
    settings: &IngestSettings,
) -> Result<Vec<ColumnClass>> {
    let table = qualified(&settings.staging_table);
    let order_col = quote_ident(settings.order_num_column());
    let columns = staging::staging_columns(&mut *conn, &settings.staging_table).await?;
    let mut classes = Vec::with_capacity(columns.len());
    for col in &columns {
        let ident = quote_ident(&col.name);
        // COUNT(DISTINCT ..) ignores NULLs, so an all-null group counts as
        // constant; an empty table classifies everything transaction-scope.
        let always_constant: bool = sqlx::query_scalar(&format!(
            "SELECT COALESCE(bool_and(cnt <= 1), TRUE) FROM (
                 SELECT COUNT(DISTINCT {ident}) AS cnt FROM {table} GROUP BY {order_col}
             ) g"
        ))
        .persistent(false)
        .fetch_one(&mut *conn)
        .await?;
        classes.push(classify(&col.name, &col.pg_type, always_constant));
    }
    Ok(classes)
}

async fn record_header_mappings(
    conn: &mut PgConnection,
    settings: &IngestSettings,
    classes: &[ColumnClass],
    attr_ids: &HashMap<(i16, String, AttrDataType), uuid::Uuid>,
) -> Result<()> {
    let by_column: HashMap<&str, &ColumnClass> =
        classes.iter().map(|c| (c.column.as_str(), c)).collect();

    let fields = &settings.payload.fields;
    let mut headers: Vec<&str> = fields
        .billing
        .values()
        .chain(fields.shipping.values())
        .map(|s| s.as_str())
        .collect();
    headers.push(&fields.order_info.order_num);
    headers.push(&fields.order_info.sale_date);
    headers.sort();
    headers.dedup();

    for header in headers {
        let Some(class) = by_column.get(header) else {
            warn!(header, "mapped header not present in staging; skipping");
            continue;
        };
        let Some(attr_id) =
            attr_ids.get(&(class.entity_type_id, class.column.clone(), class.data_type))
        else {
            warn!(header, "no attribute for mapped header; skipping");
            continue;
        };
        sqlx::query(
            "INSERT INTO sales.client_header_map (tenant_id, mapped_header, attribute_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (tenant_id, mapped_header) DO NOTHING",
        )
        .persistent(false)
        .bind(settings.tenant_id())
        .bind(header)
        .bind(attr_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constancy_decides_the_scope() {
        let c = classify("sale_date", "text", true);
        assert_eq!(c.entity_type_id, schema::ENTITY_TYPE_TRANSACTION);
        let c = classify("sku", "text", false);
        assert_eq!(c.entity_type_id, schema::ENTITY_TYPE_LINE_ITEM);
    }

    #[test]
    fn data_type_follows_the_column_type() {
        assert_eq!(classify("qty", "bigint", false).data_type, AttrDataType::Numeric);
        assert_eq!(
            classify("billing_address_id", "uuid", true).data_type,
            AttrDataType::String
        );
        assert_eq!(
            classify("flags", "jsonb", false).data_type,
            AttrDataType::Jsonb
        );
    }
}
