//! Per-chunk transform: materializes transaction and line-item entities and
//! their attribute values from staging rows.
//!
//! Each chunk runs in its own transaction under a per-(upload, chunk)
//! advisory lock. All ids are derived, all writes are upserts, so replaying
//! a chunk is a no-op and chunks can run in any order.

use anyhow::{bail, Context, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::prelude::{classify_staging_columns, ColumnClass};
use super::{ensure_attributes, insert_entities, upsert_eav, AttrDataType, AttributeDef, EavValue};
use crate::ids;
use crate::payload::IngestSettings;
use crate::schema::{self, qualified};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Done {
        transactions: usize,
        line_items: usize,
        eav_rows: u64,
    },
    /// Another attempt holds the per-chunk lock.
    Skipped,
}

#[instrument(skip(pool, settings), fields(upload = %settings.upload_id(), chunk = chunk_id))]
pub async fn eav_transform_chunk(
    pool: &PgPool,
    settings: &IngestSettings,
    chunk_id: i32,
) -> Result<TransformOutcome> {
    let upload_id = settings.upload_id();
    let mut tx = pool.begin().await?;

    sqlx::raw_sql(
        "SET LOCAL search_path = sales;
         SET LOCAL lock_timeout = '2s';
         SET LOCAL statement_timeout = '10min';
         SET LOCAL idle_in_transaction_session_timeout = '2min'",
    )
    .execute(&mut *tx)
    .await?;

    let locked: bool =
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
            .persistent(false)
            .bind(format!("{upload_id}|{chunk_id}"))
            .fetch_one(&mut *tx)
            .await?;
    if !locked {
        tx.rollback().await?;
        info!("chunk lock held elsewhere; skipping");
        return Ok(TransformOutcome::Skipped);
    }

    // Same classification the prelude used; staging is frozen by now, so
    // the result is identical and the attribute lookups line up.
    let classes = classify_staging_columns(&mut tx, settings).await?;
    let defs: Vec<AttributeDef> = classes
        .iter()
        .filter(|c| c.column != "chunk_id")
        .map(|c| AttributeDef {
            entity_type_id: c.entity_type_id,
            name: c.column.clone(),
            data_type: c.data_type,
            description: None,
        })
        .collect();
    let attr_ids = ensure_attributes(&mut tx, &defs).await?;

    let table = qualified(&settings.staging_table);
    let rows = sqlx::query(&format!(
        "SELECT row_to_json(t)::jsonb FROM {table} t WHERE chunk_id = $1"
    ))
    .persistent(false)
    .bind(chunk_id)
    .fetch_all(&mut *tx)
    .await?;

    let order_col = settings.order_num_column();
    let ChunkRows {
        txn_ids,
        line_items,
        txn_values,
    } = collect_chunk_rows(
        upload_id,
        order_col,
        rows.into_iter().map(|r| r.get::<Value, _>(0)).collect(),
    )?;

    let transactions: Vec<(Uuid, i16, Option<Uuid>)> = txn_ids
        .values()
        .map(|id| (*id, schema::ENTITY_TYPE_TRANSACTION, Some(upload_id)))
        .collect();
    insert_entities(&mut tx, &transactions).await?;

    let li_entities: Vec<(Uuid, i16, Option<Uuid>)> = line_items
        .iter()
        .map(|(id, txn, _)| (*id, schema::ENTITY_TYPE_LINE_ITEM, Some(*txn)))
        .collect();
    insert_entities(&mut tx, &li_entities).await?;

    // Unpivot: one value per transaction attribute per order, one per
    // line-item attribute per row.
    let mut eav: Vec<EavValue> = Vec::new();
    for class in classes.iter().filter(|c| c.column != "chunk_id") {
        let Some(attr_id) = attr_ids
            .get(&(class.entity_type_id, class.column.clone(), class.data_type))
            .copied()
        else {
            warn!(column = %class.column, "no attribute for staging column; skipping");
            continue;
        };
        match class.entity_type_id {
            schema::ENTITY_TYPE_TRANSACTION => {
                for (txn_id, values) in &txn_values {
                    let cell = values.get(&class.column).unwrap_or(&Value::Null);
                    if let Some(v) = typed_value(*txn_id, attr_id, class, cell) {
                        eav.push(v);
                    }
                }
            }
            _ => {
                for (li_id, _, row) in &line_items {
                    if let Some(v) = typed_value(*li_id, attr_id, class, &row[&class.column]) {
                        eav.push(v);
                    }
                }
            }
        }
    }
    let eav_rows = upsert_eav(&mut tx, &eav).await?;

    let done = TransformOutcome::Done {
        transactions: transactions.len(),
        line_items: line_items.len(),
        eav_rows,
    };
    tx.commit().await?;
    info!(
        transactions = transactions.len(),
        line_items = line_items.len(),
        eav_rows,
        "chunk transform complete"
    );
    Ok(done)
}

struct ChunkRows {
    txn_ids: HashMap<String, Uuid>,
    /// Deduplicated by line-item id; byte-identical staging rows collapse
    /// to one entry so a single upsert statement never touches the same
    /// `(entity_id, attribute_id)` key twice.
    line_items: Vec<(Uuid, Uuid, Value)>,
    /// Per-transaction column values, first non-null per column. The
    /// constancy classification admits at most one distinct non-null value
    /// per group, so this is order-independent.
    txn_values: HashMap<Uuid, Map<String, Value>>,
}

fn collect_chunk_rows(upload_id: Uuid, order_col: &str, rows: Vec<Value>) -> Result<ChunkRows> {
    let mut txn_ids: HashMap<String, Uuid> = HashMap::new();
    let mut line_items: Vec<(Uuid, Uuid, Value)> = Vec::with_capacity(rows.len());
    let mut seen: HashSet<Uuid> = HashSet::with_capacity(rows.len());
    let mut txn_values: HashMap<Uuid, Map<String, Value>> = HashMap::new();

    for row in rows {
        let (order_key, canonical) = canonical_row(&row, order_col)?;
        let txn_id = *txn_ids
            .entry(order_key.clone())
            .or_insert_with(|| ids::transaction_id(upload_id, &order_key));
        if let Value::Object(map) = &row {
            let merged = txn_values.entry(txn_id).or_default();
            for (k, v) in map {
                if !v.is_null() {
                    merged.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        let li_id = ids::line_item_id(upload_id, &order_key, &canonical);
        if seen.insert(li_id) {
            line_items.push((li_id, txn_id, row));
        }
    }

    Ok(ChunkRows {
        txn_ids,
        line_items,
        txn_values,
    })
}

/// Extract the order key and the canonical row JSON that feeds line-item
/// identity. `chunk_id` is planner bookkeeping and is excluded so identity
/// does not depend on the chunk target.
pub fn canonical_row(row: &Value, order_col: &str) -> Result<(String, String)> {
    let Value::Object(map) = row else {
        bail!("staging row did not serialize as a JSON object");
    };
    let order_key = match map.get(order_col) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => bail!("staging row is missing its order key"),
        Some(other) => other.to_string(),
    };
    let mut canonical = map.clone();
    canonical.remove("chunk_id");
    let json = serde_json::to_string(&Value::Object(canonical))
        .context("failed to serialize staging row")?;
    Ok((order_key, json))
}

/// Route a JSON cell into the right EAV value column. A JSON null is no
/// fact and yields nothing; an unparseable value yields a row with NULL in
/// its typed column so the rest of the chunk still lands.
pub fn typed_value(
    entity_id: Uuid,
    attribute_id: Uuid,
    class: &ColumnClass,
    value: &Value,
) -> Option<EavValue> {
    if value.is_null() {
        return None;
    }
    let mut out = EavValue {
        entity_id,
        attribute_id,
        ..Default::default()
    };
    match class.data_type {
        AttrDataType::String => out.string = Some(json_to_text(value)),
        AttrDataType::Numeric => out.numeric = parse_numeric(value),
        AttrDataType::Boolean => out.boolean = parse_boolean(value),
        AttrDataType::Timestamptz => out.ts = parse_timestamp(value),
        AttrDataType::Jsonb => out.jsonb = parse_jsonb(value),
    }
    Some(out)
}

fn json_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Money-tolerant numeric parse: `$`, thousands separators, and
/// parenthesized negatives are accepted.
pub fn parse_numeric(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(raw) => {
            let mut s = raw.trim().replace(['$', ','], "");
            if s.starts_with('(') && s.ends_with(')') {
                s = format!("-{}", &s[1..s.len() - 1]);
            }
            if s.is_empty() {
                return None;
            }
            BigDecimal::from_str(&s).ok()
        }
        _ => None,
    }
}

/// Strict boolean: JSON booleans, or the strings true/false.
pub fn parse_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

pub fn parse_jsonb(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn class(dt: AttrDataType) -> ColumnClass {
        ColumnClass {
            column: "c".into(),
            entity_type_id: schema::ENTITY_TYPE_LINE_ITEM,
            data_type: dt,
        }
    }

    #[test]
    fn canonical_row_excludes_chunk_id_and_is_stable() {
        let row = json!({"order_num": "A", "sku": "X", "chunk_id": 3});
        let (key, canon) = canonical_row(&row, "order_num").unwrap();
        assert_eq!(key, "A");
        assert!(!canon.contains("chunk_id"));

        let rechunked = json!({"order_num": "A", "sku": "X", "chunk_id": 9});
        let (_, canon2) = canonical_row(&rechunked, "order_num").unwrap();
        assert_eq!(canon, canon2);
    }

    #[test]
    fn numeric_parse_handles_money_shapes() {
        assert_eq!(
            parse_numeric(&json!("$1,234.56")),
            BigDecimal::from_str("1234.56").ok()
        );
        assert_eq!(
            parse_numeric(&json!("(45.10)")),
            BigDecimal::from_str("-45.10").ok()
        );
        assert_eq!(parse_numeric(&json!(7)), BigDecimal::from_str("7").ok());
        assert_eq!(parse_numeric(&json!("n/a")), None);
    }

    #[test]
    fn booleans_are_strict() {
        assert_eq!(parse_boolean(&json!("TRUE")), Some(true));
        assert_eq!(parse_boolean(&json!("false")), Some(false));
        assert_eq!(parse_boolean(&json!("1")), None);
        assert_eq!(parse_boolean(&json!(true)), Some(true));
    }

    #[test]
    fn timestamps_accept_common_shapes() {
        assert!(parse_timestamp(&json!("2026-01-05T10:00:00")).is_some());
        assert!(parse_timestamp(&json!("2026-01-05T10:00:00Z")).is_some());
        assert!(parse_timestamp(&json!("2026-01-05")).is_some());
        assert!(parse_timestamp(&json!("01/05/2026")).is_some());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn bad_cast_yields_null_typed_column_not_nothing() {
        let v = typed_value(
            Uuid::nil(),
            Uuid::nil(),
            &class(AttrDataType::Numeric),
            &json!("not a number"),
        )
        .unwrap();
        assert!(v.numeric.is_none());
        assert!(v.string.is_none());

        // a JSON null is no fact at all
        assert!(typed_value(
            Uuid::nil(),
            Uuid::nil(),
            &class(AttrDataType::String),
            &Value::Null
        )
        .is_none());
    }

    #[test]
    fn duplicate_rows_collapse_to_one_line_item() {
        let upload = Uuid::new_v4();
        // same order, same SKU, qty 1 twice; only chunk_id differs
        let rows = vec![
            json!({"order_num": "A", "sku": "X", "qty": "1", "chunk_id": 1}),
            json!({"order_num": "A", "sku": "X", "qty": "1", "chunk_id": 1}),
            json!({"order_num": "A", "sku": "Y", "qty": "1", "chunk_id": 1}),
        ];
        let out = collect_chunk_rows(upload, "order_num", rows).unwrap();
        assert_eq!(out.line_items.len(), 2);
        assert_eq!(out.txn_ids.len(), 1);
        let ids: HashSet<Uuid> = out.line_items.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn transaction_values_skip_leading_nulls() {
        let upload = Uuid::new_v4();
        // the constant column is NULL on the group's first row
        let rows = vec![
            json!({"order_num": "A", "store": null, "chunk_id": 1}),
            json!({"order_num": "A", "store": "north", "chunk_id": 1}),
        ];
        let out = collect_chunk_rows(upload, "order_num", rows).unwrap();
        let txn_id = out.txn_ids["A"];
        assert_eq!(out.txn_values[&txn_id].get("store"), Some(&json!("north")));
    }

    #[test]
    fn line_item_ids_differ_per_row_content() {
        let upload = Uuid::new_v4();
        let a = json!({"order_num": "A", "sku": "X"}).to_string();
        let b = json!({"order_num": "A", "sku": "Y"}).to_string();
        assert_ne!(
            ids::line_item_id(upload, "A", &a),
            ids::line_item_id(upload, "A", &b)
        );
    }
}
