//! Address canonicalization, two phases for parallelism and idempotence.
//!
//! Phase A plans `(offset, limit)` ranges over the *distinct* raw tuples of
//! a scope. Phase B validates each range through the batch provider,
//! derives content-addressed ids, back-fills staging with one set-based
//! UPDATE, and upserts the canonical address entities and their EAV
//! fields. Ranges touch disjoint tuples and every write is an upsert, so
//! ranges replay safely and run in any order.

pub mod validator;

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::eav::{ensure_attributes, insert_entities, upsert_eav, AttrDataType, AttributeDef, EavValue};
use crate::ids;
use crate::payload::{AddressScope, IngestSettings};
use crate::schema::{self, qualified, quote_ident};
use crate::staging::{self, MAX_BIND_PARAMS};
use crate::util::env as env_util;
use validator::{AddressValidator, CanonicalAddress, RawAddress};

/// Distinct tuples per validator call.
pub const DEFAULT_BATCH_ROWS: i64 = 1_000;

/// Canonical fields stored as uppercased string EAV on the address entity.
const ADDRESS_ATTRIBUTES: [&str; 12] = [
    "delivery_line_1",
    "delivery_line_2",
    "city_name",
    "state_abbreviation",
    "zipcode",
    "plus4_code",
    "latitude",
    "longitude",
    "record_type",
    "carrier_route",
    "rdi",
    "county_name",
];

/// A scope's component -> staging column bindings, in canonical component
/// order. Unmapped components are simply absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeColumns {
    pub scope: AddressScope,
    /// `(component, staging column)` pairs, canonical order.
    pub columns: Vec<(&'static str, String)>,
}

impl ScopeColumns {
    pub fn from_settings(settings: &IngestSettings, scope: AddressScope) -> Self {
        let map = settings.payload.scope_map(scope);
        let columns = crate::payload::ADDRESS_COMPONENTS
            .iter()
            .filter_map(|comp| map.get(*comp).map(|col| (*comp, col.clone())))
            .collect();
        Self { scope, columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|(_, col)| format!("{}::text", quote_ident(col)))
            .join(", ")
    }

    fn order_by(&self) -> String {
        (1..=self.columns.len())
            .map(|i| i.to_string())
            .join(", ")
    }

    /// At least one component non-blank; empty tuples never reach the
    /// validator.
    fn non_empty_predicate(&self) -> String {
        self.columns
            .iter()
            .map(|(_, col)| format!("COALESCE(btrim({}::text), '') <> ''", quote_ident(col)))
            .join(" OR ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressPlan {
    pub distinct_tuples: i64,
    /// `(offset, limit)` over the stable-sorted distinct tuples.
    pub ranges: Vec<(i64, i64)>,
    pub suggested_parallelism: usize,
}

/// Parallelism bands over the distinct-tuple count.
pub fn suggested_parallelism(distinct: i64) -> usize {
    if distinct < 5_000 {
        2
    } else if distinct < 50_000 {
        10
    } else if distinct < 250_000 {
        25
    } else {
        10
    }
}

pub fn plan_ranges(distinct: i64, batch_rows: i64) -> Vec<(i64, i64)> {
    let batch = batch_rows.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < distinct {
        ranges.push((offset, batch));
        offset += batch;
    }
    ranges
}

/// Phase A: ensure the scope's id column exists and plan the ranges.
#[instrument(skip(pool, settings), fields(table = %settings.staging_table, scope = scope.as_str()))]
pub async fn plan_address_batches(
    pool: &PgPool,
    settings: &IngestSettings,
    scope: AddressScope,
) -> Result<AddressPlan> {
    let cols = ScopeColumns::from_settings(settings, scope);
    if cols.is_empty() {
        info!("no columns configured for scope; skipping canonicalization");
        return Ok(AddressPlan {
            distinct_tuples: 0,
            ranges: Vec::new(),
            suggested_parallelism: 1,
        });
    }
    staging::ensure_column(pool, &settings.staging_table, scope.id_column(), "UUID").await?;

    let table = qualified(&settings.staging_table);
    let distinct: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM (SELECT DISTINCT {} FROM {table} WHERE {}) d",
        cols.select_list(),
        cols.non_empty_predicate()
    ))
    .persistent(false)
    .fetch_one(pool)
    .await?;

    let batch_rows = env_util::env_parse("ADDRESS_BATCH_ROWS", DEFAULT_BATCH_ROWS);
    let plan = AddressPlan {
        distinct_tuples: distinct,
        ranges: plan_ranges(distinct, batch_rows),
        suggested_parallelism: suggested_parallelism(distinct),
    };
    info!(
        distinct,
        ranges = plan.ranges.len(),
        parallelism = plan.suggested_parallelism,
        "address plan ready"
    );
    Ok(plan)
}

/// Phase B: canonicalize one `(offset, limit)` range of distinct tuples.
/// Returns the number of tuples the validator resolved.
#[instrument(skip(pool, validator, settings), fields(table = %settings.staging_table, scope = scope.as_str(), offset = range.0))]
pub async fn enrich_addresses_batch(
    pool: &PgPool,
    validator: &dyn AddressValidator,
    settings: &IngestSettings,
    scope: AddressScope,
    range: (i64, i64),
) -> Result<usize> {
    let cols = ScopeColumns::from_settings(settings, scope);
    if cols.is_empty() {
        return Ok(0);
    }
    let table = qualified(&settings.staging_table);
    let (offset, limit) = range;

    // Same stable order the plan counted under.
    let rows = sqlx::query(&format!(
        "SELECT DISTINCT {sel} FROM {table} WHERE {pred} \
         ORDER BY {ord} OFFSET {offset} LIMIT {limit}",
        sel = cols.select_list(),
        pred = cols.non_empty_predicate(),
        ord = cols.order_by(),
    ))
    .persistent(false)
    .fetch_all(pool)
    .await?;

    let mut raw: Vec<RawAddress> = Vec::with_capacity(rows.len());
    for r in &rows {
        let mut tuple = RawAddress::default();
        for (i, (component, _)) in cols.columns.iter().enumerate() {
            tuple.set_component(component, r.get(i));
        }
        raw.push(tuple);
    }
    raw.retain(|t| !t.is_empty());
    if raw.is_empty() {
        return Ok(0);
    }

    let records = validator
        .validate_batch(&raw)
        .await
        .context("address validation failed for range")?;

    // (raw tuple, canonical, derived id) for every hit.
    let mut hits: Vec<(RawAddress, CanonicalAddress, Uuid)> = Vec::new();
    for (tuple, record) in raw.into_iter().zip(records) {
        let Some(record) = record else {
            warn!(?tuple, "validator could not resolve tuple");
            continue;
        };
        let id = canonical_address_id(&record);
        hits.push((tuple, record, id));
    }
    if hits.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;

    // One set-based UPDATE per batch: raw tuples join staging on the
    // configured columns only.
    let per_row = cols.columns.len() + 1;
    for batch in hits.chunks((MAX_BIND_PARAMS / per_row).max(1)) {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(format!(
            "UPDATE {table} AS s SET {id_col} = v.address_id FROM (",
            id_col = quote_ident(scope.id_column()),
        ));
        qb.push_values(batch, |mut b, (tuple, _, id)| {
            for (component, _) in &cols.columns {
                b.push_bind(tuple.component(component).map(|s| s.to_string()));
            }
            b.push_bind(*id);
        });
        qb.push(format!(
            ") AS v({components}, address_id) WHERE {join}",
            components = cols.columns.iter().map(|(c, _)| *c).join(", "),
            join = cols
                .columns
                .iter()
                .map(|(comp, col)| format!(
                    "s.{}::text IS NOT DISTINCT FROM v.{comp}",
                    quote_ident(col)
                ))
                .join(" AND "),
        ));
        qb.build().persistent(false).execute(&mut *tx).await?;
    }

    // Upsert the address entities (roots, conflict-do-nothing).
    let mut unique: HashMap<Uuid, &CanonicalAddress> = HashMap::new();
    for (_, record, id) in &hits {
        unique.entry(*id).or_insert(record);
    }
    let entities: Vec<(Uuid, i16, Option<Uuid>)> = unique
        .keys()
        .map(|id| (*id, schema::ENTITY_TYPE_ADDRESS, None))
        .collect();
    insert_entities(&mut tx, &entities).await?;

    // Canonical fields as uppercased string EAV.
    let defs: Vec<AttributeDef> = ADDRESS_ATTRIBUTES
        .iter()
        .map(|name| AttributeDef {
            entity_type_id: schema::ENTITY_TYPE_ADDRESS,
            name: (*name).to_string(),
            data_type: AttrDataType::String,
            description: None,
        })
        .collect();
    let attr_ids = ensure_attributes(&mut tx, &defs).await?;
    let mut eav: Vec<EavValue> = Vec::new();
    for (id, record) in &unique {
        for (name, value) in canonical_fields(record) {
            let Some(value) = value else { continue };
            let attr = attr_ids
                .get(&(
                    schema::ENTITY_TYPE_ADDRESS,
                    name.to_string(),
                    AttrDataType::String,
                ))
                .copied()
                .with_context(|| format!("address attribute {name} missing after ensure"))?;
            eav.push(EavValue::string(*id, attr, value.to_uppercase()));
        }
    }
    upsert_eav(&mut tx, &eav).await?;
    tx.commit().await?;

    info!(resolved = hits.len(), addresses = unique.len(), "range canonicalized");
    Ok(hits.len())
}

/// Content-addressed id over the canonical tuple.
pub fn canonical_address_id(record: &CanonicalAddress) -> Uuid {
    ids::address_id(
        &record.delivery_line_1,
        record.delivery_line_2.as_deref().unwrap_or(""),
        &record.city_name,
        &record.state_abbreviation,
        &record.zipcode,
    )
}

fn canonical_fields(record: &CanonicalAddress) -> Vec<(&'static str, Option<String>)> {
    vec![
        ("delivery_line_1", Some(record.delivery_line_1.clone())),
        ("delivery_line_2", record.delivery_line_2.clone()),
        ("city_name", Some(record.city_name.clone())),
        ("state_abbreviation", Some(record.state_abbreviation.clone())),
        ("zipcode", Some(record.zipcode.clone())),
        ("plus4_code", record.plus4_code.clone()),
        ("latitude", record.latitude.map(|v| v.to_string())),
        ("longitude", record.longitude.map(|v| v.to_string())),
        ("record_type", record.record_type.clone()),
        ("carrier_route", record.carrier_route.clone()),
        ("rdi", record.rdi.clone()),
        ("county_name", record.county_name.clone()),
    ]
}

/// When both scopes bind the same columns, shipping reuses billing's
/// backfill instead of validating the same tuples twice.
pub fn scopes_identical(settings: &IngestSettings) -> bool {
    settings.payload.fields.billing == settings.payload.fields.shipping
}

#[instrument(skip(pool, settings), fields(table = %settings.staging_table))]
pub async fn copy_billing_ids_to_shipping(pool: &PgPool, settings: &IngestSettings) -> Result<()> {
    staging::ensure_column(
        pool,
        &settings.staging_table,
        AddressScope::Shipping.id_column(),
        "UUID",
    )
    .await?;
    let table = qualified(&settings.staging_table);
    sqlx::raw_sql(&format!(
        "UPDATE {table} SET shipping_address_id = billing_address_id \
         WHERE shipping_address_id IS DISTINCT FROM billing_address_id"
    ))
    .execute(pool)
    .await?;
    info!("shipping scope reused billing canonicalization");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line1: &str, city: &str) -> CanonicalAddress {
        CanonicalAddress {
            delivery_line_1: line1.into(),
            city_name: city.into(),
            state_abbreviation: "IL".into(),
            zipcode: "62704".into(),
            ..Default::default()
        }
    }

    #[test]
    fn parallelism_bands() {
        assert_eq!(suggested_parallelism(0), 2);
        assert_eq!(suggested_parallelism(4_999), 2);
        assert_eq!(suggested_parallelism(5_000), 10);
        assert_eq!(suggested_parallelism(49_999), 10);
        assert_eq!(suggested_parallelism(50_000), 25);
        assert_eq!(suggested_parallelism(249_999), 25);
        assert_eq!(suggested_parallelism(250_000), 10);
    }

    #[test]
    fn ranges_cover_the_distinct_count() {
        assert_eq!(plan_ranges(0, 1000), vec![]);
        assert_eq!(plan_ranges(1, 1000), vec![(0, 1000)]);
        assert_eq!(
            plan_ranges(2_500, 1000),
            vec![(0, 1000), (1000, 1000), (2000, 1000)]
        );
    }

    #[test]
    fn same_canonical_record_means_same_id() {
        // "123 Main St" and "123 main street" both canonicalize to the
        // same record, so they share one address id.
        let a = record("123 Main St", "Springfield");
        let b = record("123 MAIN ST", "SPRINGFIELD");
        assert_eq!(canonical_address_id(&a), canonical_address_id(&b));
        assert_ne!(
            canonical_address_id(&a),
            canonical_address_id(&record("124 Main St", "Springfield"))
        );
    }

    #[test]
    fn scope_columns_follow_component_order_and_skip_unmapped() {
        use crate::payload::{IngestSettings, UploadPayload};
        let payload = UploadPayload::from_json(
            &serde_json::json!({
                "fields": {
                    "billing": { "zipcode": "bz", "street": "bs", "city": "bc" },
                    "shipping": { "street": "ss" },
                    "order_info": { "order_num": "order_num", "sale_date": "sale_date" }
                },
                "metadata": {
                    "tenant_id": "t", "upload_id": "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11",
                    "uploader": "u", "upload_timestamp": "2026-01-05T00:00:00Z"
                }
            })
            .to_string(),
        )
        .unwrap();
        let settings = IngestSettings::new(payload, "t1".into()).unwrap();
        let cols = ScopeColumns::from_settings(&settings, AddressScope::Billing);
        let names: Vec<_> = cols.columns.iter().map(|(c, col)| (*c, col.as_str())).collect();
        assert_eq!(
            names,
            vec![("street", "bs"), ("city", "bc"), ("zipcode", "bz")]
        );
        assert!(!scopes_identical(&settings));
    }
}
